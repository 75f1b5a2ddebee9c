// RFC 6455 wire protocol: frame codec and HTTP upgrade handshake.

pub mod frame;
pub mod handshake;

pub use frame::{Frame, FrameCodec, Opcode, DEFAULT_MAX_FRAME_PAYLOAD};
pub use handshake::{
    compute_accept_key, HandshakeConfig, HandshakeRequest, DEFAULT_MAX_HEADER_BYTES,
};

/// WebSocket close codes (RFC 6455 section 7.4)
pub mod close_codes {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    /// Reserved: signalled locally when the peer sent no code.
    pub const NO_STATUS: u16 = 1005;
    /// Reserved: signalled locally on abnormal closure.
    pub const ABNORMAL: u16 = 1006;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const MANDATORY_EXTENSION: u16 = 1010;
    pub const INTERNAL_ERROR: u16 = 1011;

    /// True for codes a peer may legitimately place on the wire.
    pub fn is_valid_on_wire(code: u16) -> bool {
        matches!(
            code,
            NORMAL
                | GOING_AWAY
                | PROTOCOL_ERROR
                | UNSUPPORTED_DATA
                | INVALID_PAYLOAD
                | POLICY_VIOLATION
                | MESSAGE_TOO_BIG
                | MANDATORY_EXTENSION
                | INTERNAL_ERROR
        ) || (3000..5000).contains(&code)
    }
}
