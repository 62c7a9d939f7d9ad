//! Service lifecycle and the supervisor that drives it.
//!
//! Each long-running part of the server (slot sweeper, auth gateway, TCP and
//! UDP listeners) implements [`Service`]. The [`Supervisor`] owns them as trait
//! objects, starts them in registration order and stops them in reverse.
//! Status changes are broadcast via a [`watch`] channel so any number of
//! consumers can react without polling.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

/// Lifecycle status of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Constructed, never started.
    Idle,
    Starting,
    Healthy,
    Stopping,
    Stopped,
    /// Stopped for good; the service will not be restarted.
    Shutdown,
    /// Failed to start or crashed while running.
    Errored,
    Restarting,
}

impl ServiceStatus {
    /// Whether the service is up or on its way up.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Starting | Self::Healthy | Self::Restarting)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Shutdown => "shutdown",
            Self::Errored => "errored",
            Self::Restarting => "restarting",
        };
        f.write_str(s)
    }
}

/// Observable service status backed by a [`watch`] channel.
pub struct StatusWatch {
    tx: watch::Sender<ServiceStatus>,
    rx: watch::Receiver<ServiceStatus>,
}

impl Default for StatusWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusWatch {
    /// Create a new watch initialized to [`ServiceStatus::Idle`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ServiceStatus::Idle);
        Self { tx, rx }
    }

    /// Set the current status, notifying all subscribers.
    pub fn set(&self, status: ServiceStatus) {
        let _ = self.tx.send(status);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ServiceStatus> {
        self.rx.clone()
    }

    /// Return the current status without blocking.
    pub fn current(&self) -> ServiceStatus {
        *self.rx.borrow()
    }
}

/// Errors surfaced by service lifecycle hooks.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// A listener could not bind its socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// No service with this name is registered.
    #[error("unknown service {0:?}")]
    UnknownService(String),

    /// A background task panicked or was cancelled.
    #[error("service task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A supervised, restartable component.
///
/// Implementations do the work in `start`/`stop` and report the status they
/// ended in; the [`Supervisor`] records transitional states around the calls.
#[async_trait]
pub trait Service: Send + Sync {
    /// Human readable name, used for lookup and logging.
    fn name(&self) -> &str;

    fn status_watch(&self) -> &StatusWatch;

    fn status(&self) -> ServiceStatus {
        self.status_watch().current()
    }

    async fn start(&self) -> Result<ServiceStatus, ServiceError>;

    async fn stop(&self) -> Result<ServiceStatus, ServiceError>;

    /// Release whatever `stop` left behind. Runs after every stop.
    async fn cleanup(&self) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// Owns every service and drives their lifecycle.
#[derive(Default)]
pub struct Supervisor {
    services: Vec<(String, Arc<dyn Service>)>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service. Services start in registration order.
    pub fn register(&mut self, service: Arc<dyn Service>) -> &mut Self {
        self.services.push((service.name().to_string(), service));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Service>> {
        self.services
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, service)| service)
    }

    /// Snapshot of every service's status, in registration order.
    pub fn statuses(&self) -> Vec<(String, ServiceStatus)> {
        self.services
            .iter()
            .map(|(name, service)| (name.clone(), service.status()))
            .collect()
    }

    /// Subscribe to a service's status changes.
    pub fn subscribe(&self, name: &str) -> Option<watch::Receiver<ServiceStatus>> {
        self.get(name).map(|service| service.status_watch().subscribe())
    }

    /// Start every service that is not already running.
    ///
    /// If one fails, everything started so far is stopped again and the error
    /// is returned.
    pub async fn start_all(&self) -> Result<(), ServiceError> {
        for (index, (name, service)) in self.services.iter().enumerate() {
            if service.status().is_running() {
                tracing::debug!(service = %name, "Already running, skipping start");
                continue;
            }

            if let Err(e) = start_service(service.as_ref()).await {
                tracing::error!(service = %name, "Failed to start: {e}");
                for (_, started) in self.services[..index].iter().rev() {
                    stop_service(started.as_ref()).await;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stop every running service in reverse registration order.
    pub async fn stop_all(&self) {
        for (_, service) in self.services.iter().rev() {
            if service.status().is_running() || service.status() == ServiceStatus::Errored {
                stop_service(service.as_ref()).await;
            }
        }
    }

    /// Stop and start a single service.
    pub async fn restart(&self, name: &str) -> Result<(), ServiceError> {
        let service = self
            .get(name)
            .ok_or_else(|| ServiceError::UnknownService(name.to_string()))?;

        tracing::info!(service = %name, "Restarting");
        service.status_watch().set(ServiceStatus::Restarting);
        stop_service(service.as_ref()).await;
        start_service(service.as_ref()).await
    }
}

async fn start_service(service: &dyn Service) -> Result<(), ServiceError> {
    let watch = service.status_watch();
    tracing::info!(service = service.name(), "Starting");
    watch.set(ServiceStatus::Starting);

    match service.start().await {
        Ok(status) => {
            watch.set(status);
            tracing::info!(service = service.name(), "Service is {status}");
            Ok(())
        }
        Err(e) => {
            watch.set(ServiceStatus::Errored);
            Err(e)
        }
    }
}

async fn stop_service(service: &dyn Service) {
    let watch = service.status_watch();
    tracing::debug!(service = service.name(), "Stopping");
    watch.set(ServiceStatus::Stopping);

    match service.stop().await {
        Ok(status) => watch.set(status),
        Err(e) => {
            tracing::error!(service = service.name(), "Failed to stop cleanly: {e}");
            watch.set(ServiceStatus::Errored);
        }
    }

    if let Err(e) = service.cleanup().await {
        tracing::warn!(service = service.name(), "Cleanup failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeService {
        name: &'static str,
        status: StatusWatch,
        fail_start: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl FakeService {
        fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                status: StatusWatch::new(),
                fail_start: false,
                log: Arc::clone(log),
            }
        }
    }

    #[async_trait]
    impl Service for FakeService {
        fn name(&self) -> &str {
            self.name
        }

        fn status_watch(&self) -> &StatusWatch {
            &self.status
        }

        async fn start(&self) -> Result<ServiceStatus, ServiceError> {
            if self.fail_start {
                return Err(ServiceError::Io(std::io::Error::other("boom")));
            }
            self.log.lock().unwrap().push(format!("start {}", self.name));
            Ok(ServiceStatus::Healthy)
        }

        async fn stop(&self) -> Result<ServiceStatus, ServiceError> {
            self.log.lock().unwrap().push(format!("stop {}", self.name));
            Ok(ServiceStatus::Stopped)
        }
    }

    #[test]
    fn test_status_watch_starts_idle() {
        let watch = StatusWatch::new();
        assert_eq!(watch.current(), ServiceStatus::Idle);
        watch.set(ServiceStatus::Healthy);
        assert_eq!(*watch.subscribe().borrow(), ServiceStatus::Healthy);
    }

    #[tokio::test]
    async fn test_start_and_stop_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut supervisor = Supervisor::new();
        supervisor
            .register(Arc::new(FakeService::new("a", &log)))
            .register(Arc::new(FakeService::new("b", &log)));

        supervisor.start_all().await.unwrap();
        assert!(
            supervisor
                .statuses()
                .iter()
                .all(|(_, s)| *s == ServiceStatus::Healthy)
        );

        supervisor.stop_all().await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start a", "start b", "stop b", "stop a"]
        );
        assert_eq!(supervisor.get("a").unwrap().status(), ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_failed_start_rolls_back() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut broken = FakeService::new("broken", &log);
        broken.fail_start = true;

        let mut supervisor = Supervisor::new();
        supervisor
            .register(Arc::new(FakeService::new("a", &log)))
            .register(Arc::new(broken));

        assert!(supervisor.start_all().await.is_err());
        assert_eq!(*log.lock().unwrap(), vec!["start a", "stop a"]);
        assert_eq!(
            supervisor.get("broken").unwrap().status(),
            ServiceStatus::Errored
        );
    }

    #[tokio::test]
    async fn test_running_service_not_started_twice() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut supervisor = Supervisor::new();
        supervisor.register(Arc::new(FakeService::new("a", &log)));

        supervisor.start_all().await.unwrap();
        supervisor.start_all().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["start a"]);
    }

    #[tokio::test]
    async fn test_restart_unknown_service() {
        let supervisor = Supervisor::new();
        let result = supervisor.restart("missing").await;
        assert!(matches!(result, Err(ServiceError::UnknownService(_))));
    }

    #[tokio::test]
    async fn test_restart_cycles_service() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut supervisor = Supervisor::new();
        supervisor.register(Arc::new(FakeService::new("a", &log)));
        supervisor.start_all().await.unwrap();

        supervisor.restart("a").await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start a", "stop a", "start a"]
        );
        assert_eq!(supervisor.get("a").unwrap().status(), ServiceStatus::Healthy);
    }
}
