// Engine wiring: listener -> handshake -> reactor -> executor -> handler.
//
// One accept thread feeds the connection registry; one reactor thread runs
// the event loop and schedules per-event receive work onto the executor; a
// timer thread drives idle flushes and reaps finished connections. The
// engine interprets no paths and owns no routing: every connection is
// served by the single handler it was built with.

use crate::config::EngineConfig;
use crate::connection::{ConnectionEvents, MessageHandler, NoEvents, WsConnection, WsListener};
use crate::error::{Result, WsError};
use crate::executor::Executor;
use crate::memory::PoolManager;
use crate::reactor::{EventLoop, Interest, Reactor};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// The assembled data plane.
pub struct Engine {
    pools: Arc<PoolManager>,
    executor: Arc<Executor>,
    event_loop: Arc<EventLoop>,
    connections: Arc<RwLock<HashMap<u64, Arc<WsConnection>>>>,
    handler: Arc<dyn MessageHandler>,
    events: Arc<dyn ConnectionEvents>,
    config: EngineConfig,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Build an engine around `handler`. Lifecycle observations go to
    /// `events`; pass `NoEvents` when they are not needed.
    pub fn new(
        config: EngineConfig,
        handler: Arc<dyn MessageHandler>,
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<Self> {
        let pools = PoolManager::new(config.pool.clone());
        let executor = Arc::new(Executor::new(config.executor.clone()));
        let reactor = Arc::new(Reactor::new()?);
        let event_loop = Arc::new(EventLoop::new(reactor, config.event_loop.clone()));

        Ok(Self {
            pools,
            executor,
            event_loop,
            connections: Arc::new(RwLock::new(HashMap::new())),
            handler,
            events,
            config,
            running: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Convenience constructor with no lifecycle sink.
    pub fn with_handler(config: EngineConfig, handler: Arc<dyn MessageHandler>) -> Result<Self> {
        Self::new(config, handler, Arc::new(NoEvents))
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Bind `addr` and start the accept, reactor, and flush threads.
    /// Returns the bound address (useful with port 0).
    pub fn serve(&self, addr: SocketAddr) -> Result<SocketAddr> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(WsError::Closed);
        }

        let listener = WsListener::bind(addr, self.config.listener.clone())?;
        let bound = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        tracing::info!(%bound, "engine serving");

        let mut threads = self.threads.lock();
        threads.push(self.spawn_reactor_thread()?);
        threads.push(self.spawn_accept_thread(listener)?);
        threads.push(self.spawn_flush_thread()?);
        Ok(bound)
    }

    fn spawn_reactor_thread(&self) -> Result<JoinHandle<()>> {
        let event_loop = self.event_loop.clone();
        let connections = self.connections.clone();
        let executor = self.executor.clone();
        let handler = self.handler.clone();

        std::thread::Builder::new()
            .name("ws-reactor".into())
            .spawn(move || {
                let result = event_loop.run(move |event| {
                    let Some(connection) = connections.read().get(&event.token).cloned() else {
                        return;
                    };
                    let handler = handler.clone();
                    let submit = executor.submit(move || {
                        if event.readable || event.is_error || event.bytes > 0 {
                            if let Err(e) = connection.on_readable() {
                                if !e.is_would_block() {
                                    tracing::debug!(
                                        conn = connection.id(),
                                        error = %e,
                                        "receive path ended"
                                    );
                                }
                            }
                            connection.pump_inbound(handler.as_ref());
                        }
                        if event.writable {
                            let _ = connection.on_writable();
                        }
                    });
                    if let Err(e) = submit {
                        tracing::warn!(token = event.token, error = %e, "dropping event");
                    }
                });
                if let Err(e) = result {
                    tracing::error!(error = %e, "reactor loop failed");
                }
            })
            .map_err(WsError::TransportIo)
    }

    fn spawn_accept_thread(&self, listener: WsListener) -> Result<JoinHandle<()>> {
        let running = self.running.clone();
        let pools = self.pools.clone();
        let events = self.events.clone();
        let connections = self.connections.clone();
        let reactor = self.event_loop.reactor().clone();

        std::thread::Builder::new()
            .name("ws-accept".into())
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    match listener.accept(&pools, events.clone()) {
                        Ok((connection, request)) => {
                            tracing::debug!(
                                conn = connection.id(),
                                path = %request.path,
                                "connection established"
                            );
                            let token = connection.id();
                            let handle = connection.os_handle();
                            connections.write().insert(token, connection.clone());
                            if let Err(e) = reactor.register(handle, Interest::Both, token) {
                                tracing::warn!(error = %e, "reactor registration failed");
                                connections.write().remove(&token);
                                continue;
                            }
                            // Bytes may already sit in the handshake
                            // leftover; process them without waiting for a
                            // readiness edge.
                            let _ = connection.on_readable();
                        }
                        Err(e) if e.is_would_block() => {
                            std::thread::sleep(Duration::from_millis(10));
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "accept/handshake failed");
                        }
                    }
                }
            })
            .map_err(WsError::TransportIo)
    }

    fn spawn_flush_thread(&self) -> Result<JoinHandle<()>> {
        let running = self.running.clone();
        let connections = self.connections.clone();
        let reactor = self.event_loop.reactor().clone();
        let tick = (self.config.listener.connection.flush_interval / 2)
            .max(Duration::from_millis(1));

        std::thread::Builder::new()
            .name("ws-flush".into())
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    let snapshot: Vec<Arc<WsConnection>> =
                        connections.read().values().cloned().collect();
                    let mut finished = Vec::new();
                    for connection in snapshot {
                        if connection.is_done() {
                            finished.push(connection);
                            continue;
                        }
                        let _ = connection.maybe_flush_idle();
                    }
                    if !finished.is_empty() {
                        let mut map = connections.write();
                        for connection in finished {
                            let _ = reactor.unregister(connection.os_handle());
                            map.remove(&connection.id());
                        }
                    }
                    std::thread::sleep(tick);
                }
            })
            .map_err(WsError::TransportIo)
    }

    /// Stop the engine: close every connection, halt the threads, and
    /// shut the executor down.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::info!("engine shutting down");

        for connection in self.connections.read().values() {
            let _ = connection.close(crate::protocol::close_codes::GOING_AWAY, "server shutdown");
            let _ = connection.flush();
        }

        self.event_loop.stop();
        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        self.connections.write().clear();
        self.executor.close();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
