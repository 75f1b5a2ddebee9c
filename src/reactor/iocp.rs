// Windows completion backend: an I/O Completion Port.
//
// Registration associates a handle with the port under the caller's token
// as its completion key. The reactor only surfaces completions; callers
// post their own overlapped read/write operations.

use super::{Event, Interest, OsHandle, Token, WAKE_TOKEN};
use crate::error::{Result, WsError};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatusEx, PostQueuedCompletionStatus,
    OVERLAPPED_ENTRY,
};

/// Send-safe wrapper for the port handle. The port is thread-safe by
/// contract; all mutation goes through kernel calls.
#[derive(Clone, Copy)]
struct PortHandle(HANDLE);

unsafe impl Send for PortHandle {}
unsafe impl Sync for PortHandle {}

pub struct IocpReactor {
    port: PortHandle,
    closed: AtomicBool,
}

impl IocpReactor {
    pub fn new() -> Result<Self> {
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, std::ptr::null_mut(), 0, 0) };
        if port.is_null() {
            return Err(WsError::TransportIo(io::Error::last_os_error()));
        }
        Ok(Self {
            port: PortHandle(port),
            closed: AtomicBool::new(false),
        })
    }

    /// Associate `handle` with the port; `interest` is ignored because the
    /// completion model has no interest set.
    pub fn register(&self, handle: OsHandle, _interest: Interest, token: Token) -> Result<()> {
        let result = unsafe {
            CreateIoCompletionPort(handle as HANDLE, self.port.0, token as usize, 0)
        };
        if result.is_null() {
            return Err(WsError::TransportIo(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// No-op: completion-port associations carry no interest set.
    pub fn modify(&self, _handle: OsHandle, _interest: Interest, _token: Token) -> Result<()> {
        Ok(())
    }

    /// No-op: a handle dissociates from the port when it is closed.
    pub fn unregister(&self, _handle: OsHandle) -> Result<()> {
        Ok(())
    }

    pub fn poll(&self, max_events: usize, timeout_ms: i32, out: &mut Vec<Event>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WsError::Closed);
        }

        let max = max_events.max(1).min(1024);
        let mut entries: Vec<OVERLAPPED_ENTRY> = vec![unsafe { std::mem::zeroed() }; max];
        let mut removed: u32 = 0;
        let timeout = if timeout_ms < 0 {
            u32::MAX
        } else {
            timeout_ms as u32
        };

        let ok = unsafe {
            GetQueuedCompletionStatusEx(
                self.port.0,
                entries.as_mut_ptr(),
                max as u32,
                &mut removed,
                timeout,
                0,
            )
        };
        if ok == 0 {
            let err = io::Error::last_os_error();
            // WAIT_TIMEOUT surfaces as an empty poll, not an error.
            if err.raw_os_error() == Some(258) {
                return Ok(());
            }
            return Err(WsError::TransportIo(err));
        }

        for entry in &entries[..removed as usize] {
            let token = entry.lpCompletionKey as Token;
            if token == WAKE_TOKEN {
                continue;
            }
            out.push(Event {
                token,
                readable: true,
                writable: false,
                is_error: false,
                bytes: entry.dwNumberOfBytesTransferred as usize,
            });
        }
        Ok(())
    }

    pub fn wake(&self) -> Result<()> {
        let ok = unsafe {
            PostQueuedCompletionStatus(self.port.0, 0, WAKE_TOKEN as usize, std::ptr::null_mut())
        };
        if ok == 0 {
            return Err(WsError::TransportIo(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            unsafe { CloseHandle(self.port.0) };
        }
        Ok(())
    }
}

impl Drop for IocpReactor {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
