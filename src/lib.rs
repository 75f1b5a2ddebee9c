// SwiftSock - high-throughput WebSocket serving engine.
//
// The data plane: a cross-platform reactor (epoll / IOCP), a NUMA-aware
// slab buffer pool with lock-free recycling, bounded MPMC rings feeding a
// pinned worker pool, and a zero-copy RFC 6455 codec behind a
// per-connection state machine.

pub mod concurrent;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod executor;
pub mod memory;
pub mod protocol;
pub mod reactor;
pub mod transport;

pub use config::EngineConfig;
pub use connection::{
    ConnState, ConnectionConfig, ConnectionEvents, InboundMessage, ListenerConfig, MessageHandler,
    MessageKind, NoEvents, OverflowPolicy, WsConnection, WsListener,
};
pub use engine::Engine;
pub use error::{Result, WsError};
pub use executor::{Executor, ExecutorConfig};
pub use memory::{Buffer, PoolConfig, PoolManager};
pub use protocol::{close_codes, Frame, FrameCodec, Opcode};
pub use reactor::{Event, EventLoop, EventLoopConfig, Interest, Reactor, Token};
pub use transport::{DeadlineSupport, TcpTransport, Transport, TransportFeatures};
