// Non-blocking TCP transport.

use super::{DeadlineSupport, Transport, TransportFeatures};
use crate::error::{Result, WsError};
use crate::reactor::OsHandle;
use std::io::{IoSlice, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

/// TCP stream transport. The stream is switched to non-blocking mode at
/// construction; deadlines are honoured while the socket is blocking
/// (the handshake phase) via socket timeouts.
pub struct TcpTransport {
    stream: TcpStream,
    closed: bool,
}

impl TcpTransport {
    /// Wrap an accepted stream: enables TCP_NODELAY and switches to
    /// non-blocking mode.
    pub fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            closed: false,
        })
    }

    /// Wrap a stream without changing its blocking mode. Used by clients
    /// that drive the socket synchronously.
    pub fn from_blocking(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            closed: false,
        })
    }

    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.stream.peer_addr().ok()
    }
}

impl Transport for TcpTransport {
    fn send_vectored(&mut self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        if self.closed {
            return Err(WsError::TransportClosed);
        }
        Ok(self.stream.write_vectored(bufs)?)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Err(WsError::TransportClosed);
        }
        match self.stream.read(buf)? {
            0 => Err(WsError::TransportClosed),
            n => Ok(n),
        }
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            let _ = self.stream.shutdown(Shutdown::Both);
        }
        Ok(())
    }

    fn deadline_support(&self) -> DeadlineSupport {
        DeadlineSupport::ReadWrite
    }

    fn set_read_deadline(&mut self, deadline: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(deadline)?;
        Ok(())
    }

    fn set_write_deadline(&mut self, deadline: Option<Duration>) -> Result<()> {
        self.stream.set_write_timeout(deadline)?;
        Ok(())
    }

    fn features(&self) -> TransportFeatures {
        TransportFeatures {
            zero_copy: false,
            batch: true,
            numa_aware: false,
        }
    }

    #[cfg(unix)]
    fn os_handle(&self) -> OsHandle {
        use std::os::fd::AsRawFd;
        self.stream.as_raw_fd()
    }

    #[cfg(windows)]
    fn os_handle(&self) -> OsHandle {
        use std::os::windows::io::AsRawSocket;
        self.stream.as_raw_socket() as OsHandle
    }
}
