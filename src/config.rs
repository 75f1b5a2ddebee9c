// Engine-level configuration, aggregating the per-component configs.

use crate::connection::ListenerConfig;
use crate::executor::ExecutorConfig;
use crate::memory::PoolConfig;
use crate::reactor::EventLoopConfig;

/// Top-level configuration for an `Engine`.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub executor: ExecutorConfig,
    pub event_loop: EventLoopConfig,
    pub listener: ListenerConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_carry_spec_values() {
        let config = EngineConfig::default();
        assert_eq!(config.listener.connection.max_frame_payload, 1 << 20);
        assert_eq!(config.listener.handshake.max_header_bytes, 8192);
        assert_eq!(
            config.listener.handshake.deadline,
            std::time::Duration::from_secs(5)
        );
        assert!(config.executor.workers >= 1);
    }
}
