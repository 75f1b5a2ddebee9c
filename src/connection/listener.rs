// TCP accept loop and handshake driver.
//
// Accepted sockets stay blocking with a read timeout while the handshake
// runs, then switch to the non-blocking transport handed to the
// connection. A handshake that misses its deadline or fails validation
// closes the socket; the listener moves on.

use super::{ConnectionConfig, ConnectionEvents, WsConnection};
use crate::error::Result;
use crate::memory::PoolManager;
use crate::protocol::handshake::{self, HandshakeConfig, HandshakeRequest};
use crate::transport::TcpTransport;
use socket2::{Domain, Socket, Type};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Listener configuration
#[derive(Debug, Clone, Default)]
pub struct ListenerConfig {
    pub handshake: HandshakeConfig,
    pub connection: ConnectionConfig,
}

/// Accepts TCP connections and upgrades them to WebSocket.
pub struct WsListener {
    listener: TcpListener,
    config: ListenerConfig,
    next_id: AtomicU64,
}

impl WsListener {
    /// Bind with SO_REUSEADDR and a deep accept backlog.
    pub fn bind(addr: SocketAddr, config: ListenerConfig) -> Result<Self> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;

        Ok(Self {
            listener: socket.into(),
            config,
            next_id: AtomicU64::new(1),
        })
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Put the listening socket itself into non-blocking mode so `accept`
    /// can be reactor-driven.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.listener.set_nonblocking(nonblocking)?;
        Ok(())
    }

    #[cfg(unix)]
    pub fn os_handle(&self) -> crate::reactor::OsHandle {
        use std::os::fd::AsRawFd;
        self.listener.as_raw_fd()
    }

    #[cfg(windows)]
    pub fn os_handle(&self) -> crate::reactor::OsHandle {
        use std::os::windows::io::AsRawSocket;
        self.listener.as_raw_socket() as crate::reactor::OsHandle
    }

    /// Accept one socket, run the server handshake under its deadline,
    /// and build an open `WsConnection`.
    pub fn accept(
        &self,
        pools: &Arc<PoolManager>,
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<(Arc<WsConnection>, HandshakeRequest)> {
        let (stream, peer) = self.listener.accept()?;
        tracing::debug!(%peer, "accepted TCP connection");
        self.upgrade(stream, pools, events)
    }

    /// Run the handshake on an accepted stream and wrap it.
    pub fn upgrade(
        &self,
        mut stream: TcpStream,
        pools: &Arc<PoolManager>,
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<(Arc<WsConnection>, HandshakeRequest)> {
        // Handshake runs on the blocking socket under a read timeout.
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.config.handshake.deadline))?;

        let (request, leftover) =
            match handshake::perform_server(&mut stream, &self.config.handshake) {
                Ok(ok) => ok,
                Err(e) => {
                    tracing::debug!(error = %e, "handshake rejected");
                    let _ = stream.shutdown(std::net::Shutdown::Both);
                    return Err(e);
                }
            };

        stream.set_read_timeout(None)?;
        let transport = TcpTransport::new(stream)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = WsConnection::new(
            id,
            Box::new(transport),
            pools.clone(),
            self.config.connection.clone(),
            events,
            leftover,
        );
        connection.open();
        Ok((connection, request))
    }
}

/// Client-side dial: connect, handshake, and return an open connection.
pub fn connect(
    addr: SocketAddr,
    path: &str,
    pools: &Arc<PoolManager>,
    config: ListenerConfig,
    events: Arc<dyn ConnectionEvents>,
) -> Result<Arc<WsConnection>> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(config.handshake.deadline))?;

    let host = addr.to_string();
    let leftover = handshake::perform_client(&mut stream, &host, path, &config.handshake)?;

    stream.set_read_timeout(None)?;
    let transport = TcpTransport::new(stream)?;

    let mut conn_config = config.connection;
    // Client role: mask everything we send, accept unmasked input.
    conn_config.require_masked_input = false;
    conn_config.mask_outgoing = true;

    let connection = WsConnection::new(0, Box::new(transport), pools.clone(), conn_config, events, leftover);
    connection.open();
    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::NoEvents;
    use crate::memory::PoolConfig;
    use std::io::{Read, Write};

    fn pools() -> Arc<PoolManager> {
        PoolManager::new(PoolConfig {
            max_cached_per_class: 8,
            numa_nodes: Some(1),
        })
    }

    fn bound_listener() -> WsListener {
        WsListener::bind("127.0.0.1:0".parse().unwrap(), ListenerConfig::default()).unwrap()
    }

    #[test]
    fn test_accept_and_upgrade() {
        let listener = bound_listener();
        let addr = listener.local_addr().unwrap();
        let pools = pools();

        let client = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream
                .write_all(
                    b"GET /echo HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\n\
                      Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                      Sec-WebSocket-Version: 13\r\n\r\n",
                )
                .unwrap();

            let mut response = vec![0u8; 1024];
            let n = stream.read(&mut response).unwrap();
            String::from_utf8_lossy(&response[..n]).to_string()
        });

        let (connection, request) = listener.accept(&pools, Arc::new(NoEvents)).unwrap();
        assert_eq!(request.path, "/echo");
        assert_eq!(connection.state(), crate::connection::ConnState::Open);

        let response = client.join().unwrap();
        assert!(response.contains("101 Switching Protocols"));
        assert!(response.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    }

    #[test]
    fn test_bad_handshake_rejected() {
        let listener = bound_listener();
        let addr = listener.local_addr().unwrap();
        let pools = pools();

        let client = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
            // The listener closes the socket without a 101.
            let mut buf = [0u8; 64];
            stream.read(&mut buf).unwrap_or(0)
        });

        let err = listener.accept(&pools, Arc::new(NoEvents)).unwrap_err();
        assert!(matches!(err, crate::error::WsError::HandshakeInvalid(_)));
        assert_eq!(client.join().unwrap(), 0);
    }

    #[test]
    fn test_client_connect_round_trip() {
        let listener = bound_listener();
        let addr = listener.local_addr().unwrap();
        let server_pools = pools();
        let client_pools = pools();

        let server = std::thread::spawn(move || {
            listener.accept(&server_pools, Arc::new(NoEvents)).unwrap()
        });

        let connection = connect(
            addr,
            "/live",
            &client_pools,
            ListenerConfig::default(),
            Arc::new(NoEvents),
        )
        .unwrap();
        assert_eq!(connection.state(), crate::connection::ConnState::Open);

        let (_server_conn, request) = server.join().unwrap();
        assert_eq!(request.path, "/live");
    }
}
