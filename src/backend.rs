//! Per-backend state and lifecycle control.
//!
//! One [`Backend`] exists per configured server. It owns the cloud provider
//! handle and the shared mutable state the connection handlers and the idle
//! watcher coordinate through: the logged-in connection counter, the
//! empty-since timestamp, and the cached statuses.

use crate::cloud::{CloudError, CloudStatus, Provider};
use crate::config::ServerConfig;
use crate::minecraft::{self, ServerStatus};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// A fronted Minecraft server and the instance backing it.
///
/// Designed to live behind an `Arc` shared by the dispatcher, every
/// connection task, and the watcher; [`new`](Backend::new) returns `Arc<Self>`
/// to enforce the pattern. All mutable state is interior and safe for
/// concurrent use without external locking.
pub struct Backend {
    config: ServerConfig,
    shutdown_after: Duration,

    provider: Arc<dyn Provider>,
    instance_id: String,

    /// Last observed provider status. Written on every status RPC.
    cloud_status: Mutex<CloudStatus>,

    /// Last successful server list ping, used to fabricate credible
    /// offline responses.
    last_minecraft_status: RwLock<Option<ServerStatus>>,

    /// Number of logged-in client connections. Status pings do not count.
    connections: AtomicU64,

    /// When the backend last transitioned to zero connections. `None`
    /// while players are online or after a stop was issued.
    empty_since: Mutex<Option<Instant>>,
}

impl Backend {
    pub fn new(
        config: ServerConfig,
        provider: Arc<dyn Provider>,
        instance_id: String,
    ) -> anyhow::Result<Arc<Self>> {
        let shutdown_after = config.shutdown_after()?;

        Ok(Arc::new(Self {
            config,
            shutdown_after,
            provider,
            instance_id,
            cloud_status: Mutex::new(CloudStatus::Unknown),
            last_minecraft_status: RwLock::new(None),
            connections: AtomicU64::new(0),
            empty_since: Mutex::new(None),
        }))
    }

    /// The virtual hostname clients route with.
    pub fn hostname(&self) -> &str {
        &self.config.hostname
    }

    /// The backend listener address, `host:port`.
    pub fn remote_addr(&self) -> String {
        format!(
            "{}:{}",
            self.config.minecraft.hostname, self.config.minecraft.port
        )
    }

    pub fn shutdown_after(&self) -> Duration {
        self.shutdown_after
    }

    /// Whether the whitelist admits this player. An empty whitelist admits
    /// everyone; matching is on the exact name string.
    pub fn admits(&self, player: &str) -> bool {
        self.config.whitelist.is_empty() || self.config.whitelist.iter().any(|p| p == player)
    }

    /// Fetch the provider's view of the instance and cache it.
    pub async fn cloud_status(&self) -> Result<CloudStatus, CloudError> {
        let status = self.provider.status(&self.instance_id).await?;
        *self.cloud_status.lock() = status;
        Ok(status)
    }

    /// Last-known provider status, without an RPC.
    pub fn cached_cloud_status(&self) -> CloudStatus {
        *self.cloud_status.lock()
    }

    pub fn set_cached_cloud_status(&self, status: CloudStatus) {
        *self.cloud_status.lock() = status;
    }

    /// Ping the backend's Minecraft listener. Requires the server to be up;
    /// a success refreshes the cached status payload.
    pub async fn minecraft_status(&self) -> anyhow::Result<ServerStatus> {
        let status = minecraft::server_status(
            &self.config.minecraft.hostname,
            self.config.minecraft.port,
            minecraft::PING_TIMEOUT,
        )
        .await?;

        *self.last_minecraft_status.write() = Some(status.clone());
        Ok(status)
    }

    /// Payload of the last successful ping, if any.
    pub fn last_minecraft_status(&self) -> Option<ServerStatus> {
        self.last_minecraft_status.read().clone()
    }

    /// Start the instance unless it is already up.
    ///
    /// A cached `RUNNING` status short-circuits without any provider RPC.
    /// [`CloudError::NotStopped`] from the provider means another caller won
    /// the race; that is not an error.
    pub async fn start(&self) -> Result<(), CloudError> {
        if self.cached_cloud_status() == CloudStatus::Running {
            return Ok(());
        }

        let status = self.cloud_status().await?;
        if status == CloudStatus::Running {
            return Ok(());
        }

        match self.provider.start(&self.instance_id).await {
            Ok(()) => {
                self.set_cached_cloud_status(CloudStatus::Starting);
                Ok(())
            }
            Err(CloudError::NotStopped) => {
                debug!(
                    server = self.hostname(),
                    "instance already starting elsewhere"
                );
                self.set_cached_cloud_status(CloudStatus::Starting);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Stop the instance unless it is already down. Symmetric with
    /// [`start`](Backend::start).
    pub async fn stop(&self) -> Result<(), CloudError> {
        if self.cached_cloud_status() == CloudStatus::Stopped {
            return Ok(());
        }

        let status = self.cloud_status().await?;
        if status == CloudStatus::Stopped {
            return Ok(());
        }

        match self.provider.stop(&self.instance_id).await {
            Ok(()) => {
                self.set_cached_cloud_status(CloudStatus::Stopping);
                Ok(())
            }
            Err(CloudError::NotRunning) => {
                debug!(
                    server = self.hostname(),
                    "instance already stopped elsewhere"
                );
                self.set_cached_cloud_status(CloudStatus::Stopped);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Record a client reaching the login state. Driven exclusively by the
    /// connection handler's login hook.
    pub fn client_connected(&self) {
        self.connections.fetch_add(1, Ordering::SeqCst);
        *self.empty_since.lock() = None;
    }

    /// Record a logged-in client going away. The transition to zero starts
    /// the idle clock.
    pub fn client_disconnected(&self) {
        let previous = self.connections.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            *self.empty_since.lock() = Some(Instant::now());
        }
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn empty_since(&self) -> Option<Instant> {
        *self.empty_since.lock()
    }

    /// The empty-since timestamp, initializing it to now when unset.
    pub fn empty_since_or_now(&self) -> Instant {
        *self.empty_since.lock().get_or_insert_with(Instant::now)
    }

    /// Restart the idle clock; the timer begins again the next time the
    /// watcher observes the backend running and empty.
    pub fn clear_empty_since(&self) {
        *self.empty_since.lock() = None;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{DockerConfig, MinecraftConfig};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Scripted provider: returns a fixed status and counts calls.
    pub(crate) struct FakeProvider {
        pub status: Mutex<CloudStatus>,
        pub status_calls: AtomicUsize,
        pub start_calls: AtomicUsize,
        pub stop_calls: AtomicUsize,
        pub start_result: Mutex<Option<CloudError>>,
        pub stop_result: Mutex<Option<CloudError>>,
    }

    impl FakeProvider {
        pub(crate) fn new(status: CloudStatus) -> Arc<Self> {
            Arc::new(Self {
                status: Mutex::new(status),
                status_calls: AtomicUsize::new(0),
                start_calls: AtomicUsize::new(0),
                stop_calls: AtomicUsize::new(0),
                start_result: Mutex::new(None),
                stop_result: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl Provider for FakeProvider {
        async fn status(&self, _instance_id: &str) -> Result<CloudStatus, CloudError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            Ok(*self.status.lock())
        }

        async fn start(&self, _instance_id: &str) -> Result<(), CloudError> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            match self.start_result.lock().take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        async fn stop(&self, _instance_id: &str) -> Result<(), CloudError> {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            match self.stop_result.lock().take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        async fn should_terminate(&self) -> Result<bool, CloudError> {
            Ok(false)
        }
    }

    pub(crate) fn test_backend(
        provider: Arc<FakeProvider>,
        whitelist: Vec<String>,
    ) -> Arc<Backend> {
        let config = ServerConfig {
            hostname: "mc.example.com".to_string(),
            shutdown_after: Some("1s".to_string()),
            whitelist,
            minecraft: MinecraftConfig {
                hostname: "127.0.0.1".to_string(),
                port: 25565,
            },
            gcp: None,
            docker: Some(DockerConfig {
                container_id: "test".to_string(),
            }),
        };
        Backend::new(config, provider, "test".to_string()).unwrap()
    }

    #[test]
    fn connection_counter_round_trips() {
        let backend = test_backend(FakeProvider::new(CloudStatus::Running), Vec::new());

        assert_eq!(backend.connections(), 0);
        backend.client_connected();
        backend.client_connected();
        assert_eq!(backend.connections(), 2);

        backend.client_disconnected();
        assert_eq!(backend.connections(), 1);
        assert!(backend.empty_since().is_none());

        backend.client_disconnected();
        assert_eq!(backend.connections(), 0);
        assert!(backend.empty_since().is_some());
    }

    #[test]
    fn empty_since_is_monotonic_at_last_disconnect() {
        let backend = test_backend(FakeProvider::new(CloudStatus::Running), Vec::new());

        backend.client_connected();
        let before = Instant::now();
        backend.client_disconnected();

        let empty_since = backend.empty_since().unwrap();
        assert!(empty_since >= before);
    }

    #[test]
    fn reconnect_clears_empty_since() {
        let backend = test_backend(FakeProvider::new(CloudStatus::Running), Vec::new());

        backend.client_connected();
        backend.client_disconnected();
        assert!(backend.empty_since().is_some());

        backend.client_connected();
        assert!(backend.empty_since().is_none());
        backend.client_disconnected();
    }

    #[tokio::test]
    async fn start_with_cached_running_issues_no_rpc() {
        let provider = FakeProvider::new(CloudStatus::Running);
        let backend = test_backend(provider.clone(), Vec::new());
        backend.set_cached_cloud_status(CloudStatus::Running);

        backend.start().await.unwrap();

        assert_eq!(provider.status_calls.load(Ordering::SeqCst), 0);
        assert_eq!(provider.start_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_with_cached_stopped_issues_no_rpc() {
        let provider = FakeProvider::new(CloudStatus::Stopped);
        let backend = test_backend(provider.clone(), Vec::new());
        backend.set_cached_cloud_status(CloudStatus::Stopped);

        backend.stop().await.unwrap();

        assert_eq!(provider.status_calls.load(Ordering::SeqCst), 0);
        assert_eq!(provider.stop_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn start_on_stopped_instance_calls_provider_once() {
        let provider = FakeProvider::new(CloudStatus::Stopped);
        let backend = test_backend(provider.clone(), Vec::new());

        backend.start().await.unwrap();

        assert_eq!(provider.start_calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.cached_cloud_status(), CloudStatus::Starting);
    }

    #[tokio::test]
    async fn start_treats_not_stopped_as_benign() {
        let provider = FakeProvider::new(CloudStatus::Stopped);
        *provider.start_result.lock() = Some(CloudError::NotStopped);
        let backend = test_backend(provider.clone(), Vec::new());

        backend.start().await.unwrap();
        assert_eq!(backend.cached_cloud_status(), CloudStatus::Starting);
    }

    #[tokio::test]
    async fn stop_treats_not_running_as_benign() {
        let provider = FakeProvider::new(CloudStatus::Running);
        *provider.stop_result.lock() = Some(CloudError::NotRunning);
        let backend = test_backend(provider.clone(), Vec::new());

        backend.stop().await.unwrap();
        assert_eq!(backend.cached_cloud_status(), CloudStatus::Stopped);
    }

    #[tokio::test]
    async fn start_surfaces_provider_errors() {
        let provider = FakeProvider::new(CloudStatus::Stopped);
        *provider.start_result.lock() =
            Some(CloudError::Provider(anyhow::anyhow!("quota exceeded")));
        let backend = test_backend(provider.clone(), Vec::new());

        let err = backend.start().await.unwrap_err();
        assert!(matches!(err, CloudError::Provider(_)));
    }

    #[tokio::test]
    async fn cloud_status_refreshes_cache() {
        let provider = FakeProvider::new(CloudStatus::Running);
        let backend = test_backend(provider.clone(), Vec::new());
        assert_eq!(backend.cached_cloud_status(), CloudStatus::Unknown);

        let status = backend.cloud_status().await.unwrap();
        assert_eq!(status, CloudStatus::Running);
        assert_eq!(backend.cached_cloud_status(), CloudStatus::Running);
    }

    #[test]
    fn whitelist_admission() {
        let open = test_backend(FakeProvider::new(CloudStatus::Running), Vec::new());
        assert!(open.admits("anyone"));

        let restricted = test_backend(
            FakeProvider::new(CloudStatus::Running),
            vec!["alice".to_string(), "bob".to_string()],
        );
        assert!(restricted.admits("alice"));
        assert!(restricted.admits("bob"));
        assert!(!restricted.admits("mallory"));
        // Matching is exact.
        assert!(!restricted.admits("Alice"));
    }

    #[test]
    fn empty_since_or_now_initializes_once() {
        let backend = test_backend(FakeProvider::new(CloudStatus::Running), Vec::new());

        let first = backend.empty_since_or_now();
        let second = backend.empty_since_or_now();
        assert_eq!(first, second);

        backend.clear_empty_since();
        assert!(backend.empty_since().is_none());
    }
}
