// Transport contract consumed by the connection layer.
//
// Deadline handling is an explicit capability: implementations advertise a
// `DeadlineSupport` tag and callers dispatch on it statically instead of
// probing the concrete type at runtime.

pub mod tcp;

pub use tcp::TcpTransport;

use crate::error::{Result, WsError};
use crate::reactor::OsHandle;
use std::io::IoSlice;
use std::time::Duration;

/// Capability flags a transport advertises.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportFeatures {
    /// Receive paths can hand out references into kernel-filled buffers.
    pub zero_copy: bool,
    /// Vectored sends reach the wire as a single syscall.
    pub batch: bool,
    /// The implementation places buffers near a NUMA node.
    pub numa_aware: bool,
}

/// Deadline capability tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineSupport {
    /// Deadlines are not available; `set_*_deadline` fails.
    None,
    /// Read and write deadlines map to socket timeouts.
    ReadWrite,
}

/// Byte transport under a WebSocket connection.
pub trait Transport: Send {
    /// Write as many bytes as the socket accepts from the slices, in
    /// order. Short writes are normal; `WouldBlock` surfaces as a
    /// `TransportIo` error the caller inspects.
    fn send_vectored(&mut self, bufs: &[IoSlice<'_>]) -> Result<usize>;

    /// Read into `buf`. EOF maps to `TransportClosed` so the caller never
    /// confuses a peer shutdown with an empty read.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Shut the transport down. Idempotent.
    fn close(&mut self) -> Result<()>;

    /// Deadline capability of this implementation.
    fn deadline_support(&self) -> DeadlineSupport {
        DeadlineSupport::None
    }

    fn set_read_deadline(&mut self, _deadline: Option<Duration>) -> Result<()> {
        Err(WsError::Unsupported("read deadline"))
    }

    fn set_write_deadline(&mut self, _deadline: Option<Duration>) -> Result<()> {
        Err(WsError::Unsupported("write deadline"))
    }

    /// Capability flags.
    fn features(&self) -> TransportFeatures;

    /// OS handle for reactor registration.
    fn os_handle(&self) -> OsHandle;

    /// Convenience single-buffer send.
    fn send(&mut self, buf: &[u8]) -> Result<usize> {
        self.send_vectored(&[IoSlice::new(buf)])
    }
}
