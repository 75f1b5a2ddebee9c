use thiserror::Error;

/// Errors observable at the engine boundary.
#[derive(Error, Debug)]
pub enum WsError {
    #[error("invalid handshake: {0}")]
    HandshakeInvalid(String),

    #[error("handshake deadline expired")]
    HandshakeTimeout,

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("payload of {len} bytes exceeds per-frame maximum of {max}")]
    PayloadTooLarge { len: u64, max: usize },

    #[error("truncated frame: need {needed} more bytes")]
    Truncated { needed: usize },

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("transport closed")]
    TransportClosed,

    #[error("transport I/O error: {0}")]
    TransportIo(#[from] std::io::Error),

    #[error("executor has no free slot")]
    Busy,

    #[error("operation on a closed connection or executor")]
    Closed,

    #[error("capability not supported: {0}")]
    Unsupported(&'static str),
}

impl WsError {
    /// True when the underlying socket reported `EWOULDBLOCK`/`EAGAIN`.
    /// The non-blocking receive path uses this to distinguish "drained"
    /// from a real transport failure.
    pub fn is_would_block(&self) -> bool {
        matches!(
            self,
            WsError::TransportIo(e) if e.kind() == std::io::ErrorKind::WouldBlock
        )
    }

    /// True when the error should tear the connection down without a
    /// close handshake.
    pub fn is_fatal_transport(&self) -> bool {
        match self {
            WsError::TransportClosed => true,
            WsError::TransportIo(e) => e.kind() != std::io::ErrorKind::WouldBlock,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, WsError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_would_block_probe() {
        let e = WsError::TransportIo(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(e.is_would_block());
        assert!(!e.is_fatal_transport());

        let e = WsError::TransportIo(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(!e.is_would_block());
        assert!(e.is_fatal_transport());

        assert!(WsError::TransportClosed.is_fatal_transport());
        assert!(!WsError::Busy.is_fatal_transport());
    }

    #[test]
    fn test_display_formats() {
        let e = WsError::PayloadTooLarge { len: 2048, max: 1024 };
        assert!(e.to_string().contains("2048"));
        assert!(e.to_string().contains("1024"));
    }
}
