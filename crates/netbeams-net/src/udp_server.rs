//! UDP listener. Datagrams are received and logged; nothing is parsed yet.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::service::{Service, ServiceError, ServiceStatus, StatusWatch};

/// Largest datagram read in one call; longer ones are truncated.
pub const MAX_DATAGRAM: usize = 1024;

pub struct UdpServer {
    bind_addr: SocketAddr,
    status: Arc<StatusWatch>,
    local_addr: Mutex<Option<SocketAddr>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl UdpServer {
    pub fn new(bind_addr: SocketAddr) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            bind_addr,
            status: Arc::new(StatusWatch::new()),
            local_addr: Mutex::new(None),
            recv_task: Mutex::new(None),
            shutdown_tx,
        }
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    async fn recv_loop(
        socket: UdpSocket,
        status: Arc<StatusWatch>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut buffer = [0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buffer) => match result {
                    Ok((len, from)) => {
                        tracing::debug!(
                            %from,
                            len,
                            payload = %String::from_utf8_lossy(&buffer[..len]),
                            "Received datagram"
                        );
                    }
                    Err(e) => {
                        tracing::error!("UDP receive failed: {e}");
                        status.set(ServiceStatus::Errored);
                        break;
                    }
                },
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Service for UdpServer {
    fn name(&self) -> &str {
        "UDP Server"
    }

    fn status_watch(&self) -> &StatusWatch {
        &self.status
    }

    async fn start(&self) -> Result<ServiceStatus, ServiceError> {
        let socket = UdpSocket::bind(self.bind_addr)
            .await
            .map_err(|source| ServiceError::Bind {
                addr: self.bind_addr,
                source,
            })?;
        let local_addr = socket.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("UDP server listening on {local_addr}");

        self.shutdown_tx.send_replace(false);
        let handle = tokio::spawn(Self::recv_loop(
            socket,
            Arc::clone(&self.status),
            self.shutdown_tx.subscribe(),
        ));
        *self.recv_task.lock().await = Some(handle);

        Ok(ServiceStatus::Healthy)
    }

    async fn stop(&self) -> Result<ServiceStatus, ServiceError> {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.recv_task.lock().await.take() {
            handle.await?;
        }
        *self.local_addr.lock().await = None;
        Ok(ServiceStatus::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receives_and_stops() {
        let server = UdpServer::new("127.0.0.1:0".parse().unwrap());
        server.start().await.unwrap();
        let addr = server.local_addr().await.unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hello", addr).await.unwrap();
        client.send_to(&[0u8; 2048], addr).await.unwrap();

        assert_eq!(server.stop().await.unwrap(), ServiceStatus::Stopped);
        assert!(server.local_addr().await.is_none());
    }

    #[tokio::test]
    async fn test_can_restart() {
        let server = UdpServer::new("127.0.0.1:0".parse().unwrap());
        server.start().await.unwrap();
        server.stop().await.unwrap();
        server.start().await.unwrap();
        assert!(server.local_addr().await.is_some());
        server.stop().await.unwrap();
    }
}
