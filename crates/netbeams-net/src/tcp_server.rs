//! TCP server for accepting and managing client connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;

use crate::connection::{Connection, ConnectionState, SHUTDOWN_REASON, ServerContext};
use crate::service::{Service, ServiceError, ServiceStatus, StatusWatch};

/// How long `stop` waits for kicked connections to deregister.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// The listener's view of one live connection.
pub struct ConnectionHandle {
    kick_tx: watch::Sender<Option<String>>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        kick_tx: watch::Sender<Option<String>>,
        state_rx: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self { kick_tx, state_rx }
    }

    /// Ask the connection to send `"K" + reason` and close.
    pub fn kick(&self, reason: &str) {
        let _ = self.kick_tx.send(Some(reason.to_string()));
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

/// Thread-safe map of active connections keyed by remote address.
#[derive(Default)]
pub struct ConnectionMap {
    inner: RwLock<HashMap<SocketAddr, ConnectionHandle>>,
}

impl ConnectionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, replacing any stale entry for the same address.
    pub async fn insert(&self, addr: SocketAddr, handle: ConnectionHandle) {
        self.inner.write().await.insert(addr, handle);
    }

    pub async fn remove(&self, addr: &SocketAddr) -> Option<ConnectionHandle> {
        self.inner.write().await.remove(addr)
    }

    /// Return the number of active connections.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn addresses(&self) -> Vec<SocketAddr> {
        self.inner.read().await.keys().copied().collect()
    }

    pub async fn state_of(&self, addr: &SocketAddr) -> Option<ConnectionState> {
        self.inner.read().await.get(addr).map(ConnectionHandle::state)
    }

    /// Kick one connection. Returns whether it was found.
    pub async fn kick(&self, addr: &SocketAddr, reason: &str) -> bool {
        match self.inner.read().await.get(addr) {
            Some(handle) => {
                handle.kick(reason);
                true
            }
            None => false,
        }
    }

    /// Kick every connection. Returns how many were kicked.
    pub async fn kick_all(&self, reason: &str) -> usize {
        let map = self.inner.read().await;
        for handle in map.values() {
            handle.kick(reason);
        }
        map.len()
    }
}

/// TCP listener service that spawns one [`Connection`] per accepted socket.
pub struct TcpServer {
    bind_addr: SocketAddr,
    ctx: Arc<ServerContext>,
    status: StatusWatch,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl TcpServer {
    pub fn new(bind_addr: SocketAddr, ctx: Arc<ServerContext>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            bind_addr,
            ctx,
            status: StatusWatch::new(),
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
            shutdown_tx,
        }
    }

    /// The bound address while the listener runs. Differs from the configured
    /// address when binding port 0.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    pub fn connections(&self) -> &Arc<ConnectionMap> {
        &self.ctx.connections
    }

    /// Accept connections until shutdown is signalled.
    async fn accept_loop(
        listener: TcpListener,
        ctx: Arc<ServerContext>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("Failed to accept connection: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("Could not set TCP_NODELAY for {peer_addr}: {e}");
                    }

                    tracing::info!("Accepted connection from {peer_addr}");
                    let (connection, handle) = Connection::new(stream, peer_addr, Arc::clone(&ctx));
                    ctx.connections.insert(peer_addr, handle).await;
                    tokio::spawn(connection.run());
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("TCP server shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Service for TcpServer {
    fn name(&self) -> &str {
        "TCP Server"
    }

    fn status_watch(&self) -> &StatusWatch {
        &self.status
    }

    async fn start(&self) -> Result<ServiceStatus, ServiceError> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|source| ServiceError::Bind {
                addr: self.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("TCP server listening on {local_addr}");

        self.shutdown_tx.send_replace(false);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let ctx = Arc::clone(&self.ctx);
        let handle = tokio::spawn(Self::accept_loop(listener, ctx, shutdown_rx));
        *self.accept_task.lock().await = Some(handle);

        Ok(ServiceStatus::Healthy)
    }

    async fn stop(&self) -> Result<ServiceStatus, ServiceError> {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.accept_task.lock().await.take() {
            handle.await?;
        }
        *self.local_addr.lock().await = None;

        let kicked = self.ctx.connections.kick_all(SHUTDOWN_REASON).await;
        if kicked > 0 {
            tracing::info!("Kicked {kicked} connection(s)");
            let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
                while !self.ctx.connections.is_empty().await {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await;
            if drained.is_err() {
                tracing::warn!("Connections still open after {DRAIN_TIMEOUT:?}");
            }
        }

        Ok(ServiceStatus::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthError, AuthGateway};
    use crate::framing::{FrameReader, write_frame};
    use crate::player::Player;
    use crate::settings::ProtocolSettings;
    use crate::slots::SlotManager;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    struct NoAuth;

    #[async_trait]
    impl AuthGateway for NoAuth {
        async fn authenticate(&self, _key: &str) -> Result<Player, AuthError> {
            Err(AuthError::Status(403))
        }
    }

    /// Helper: start a server on an ephemeral port and return the bound address.
    async fn start_test_server(max_players: u32) -> (SocketAddr, TcpServer) {
        let ctx = Arc::new(ServerContext {
            settings: ProtocolSettings::default(),
            slots: Arc::new(SlotManager::new(max_players, None, None)),
            auth: Arc::new(NoAuth),
            connections: Arc::new(ConnectionMap::new()),
        });
        let server = TcpServer::new("127.0.0.1:0".parse().unwrap(), ctx);
        server.start().await.unwrap();
        let addr = server.local_addr().await.unwrap();
        (addr, server)
    }

    async fn wait_for_connections(server: &TcpServer, expected: usize) {
        for _ in 0..100 {
            if server.connections().len().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {expected} connections");
    }

    #[tokio::test]
    async fn test_server_binds_ephemeral_port() {
        let (addr, server) = start_test_server(4).await;
        assert_ne!(addr.port(), 0);
        server.stop().await.unwrap();
        assert!(server.local_addr().await.is_none());
    }

    #[tokio::test]
    async fn test_bind_failure_is_service_error() {
        let (addr, server) = start_test_server(4).await;
        let ctx = Arc::clone(&server.ctx);
        let second = TcpServer::new(addr, ctx);
        assert!(matches!(second.start().await, Err(ServiceError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_multiple_clients_tracked() {
        let (addr, server) = start_test_server(8).await;
        let mut streams = Vec::new();
        for _ in 0..5 {
            streams.push(TcpStream::connect(addr).await.unwrap());
        }
        wait_for_connections(&server, 5).await;

        let peers = server.connections().addresses().await;
        assert_eq!(peers.len(), 5);
        let state = server.connections().state_of(&peers[0]).await;
        assert!(matches!(
            state,
            Some(ConnectionState::Unknown | ConnectionState::Identify)
        ));
    }

    #[tokio::test]
    async fn test_ping_connection_deregisters() {
        let (addr, server) = start_test_server(4).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (rx, mut tx) = stream.into_split();
        let mut reader = FrameReader::new(rx);

        tx.write_all(b"P").await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap().payload(), b"P");
        wait_for_connections(&server, 0).await;
    }

    #[tokio::test]
    async fn test_kick_single_connection() {
        let (addr, server) = start_test_server(4).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let local = stream.local_addr().unwrap();
        let mut reader = FrameReader::new(stream);
        wait_for_connections(&server, 1).await;

        assert!(server.connections().kick(&local, "Bye").await);
        assert_eq!(reader.read_frame().await.unwrap().payload(), b"KBye");
        wait_for_connections(&server, 0).await;
        assert!(!server.connections().kick(&local, "Bye").await);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_kicks_connections() {
        let (addr, server) = start_test_server(4).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (rx, mut tx) = stream.into_split();
        let mut reader = FrameReader::new(rx);

        // Park the connection in mod sync.
        tx.write_all(b"D").await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap().payload(), b"P0");
        write_frame(&mut tx, b"SR").await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap().payload(), b"-");

        assert_eq!(server.stop().await.unwrap(), ServiceStatus::Stopped);
        assert_eq!(
            reader.read_frame().await.unwrap().payload(),
            b"KServer shutting down"
        );
        assert!(server.connections().is_empty().await);
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
