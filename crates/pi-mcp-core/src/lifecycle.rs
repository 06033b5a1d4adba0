//! Connection lifecycle management.
//!
//! A periodic health loop reconnects keep-alive servers that dropped
//! and closes idle connections past their effective timeout. The
//! adapter installs callbacks to refresh metadata after a reconnect
//! and to log idle shutdowns; callbacks run inside the loop task.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pi_mcp_types::config::{Lifecycle, ServerDefinition};

use crate::manager::ServerManager;
use crate::util::now_ms;

/// Default health check cadence.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Callback invoked with a server name after a lifecycle event.
pub type LifecycleCallback =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct RegisteredServer {
    definition: ServerDefinition,
    effective_idle_timeout_ms: i64,
    keep_alive: bool,
}

/// Owns registered server definitions and the health loop.
pub struct LifecycleManager {
    manager: Arc<ServerManager>,
    registered: Mutex<HashMap<String, RegisteredServer>>,
    on_reconnect: Mutex<Option<LifecycleCallback>>,
    on_idle_shutdown: Mutex<Option<LifecycleCallback>>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl LifecycleManager {
    /// Lifecycle management over `manager`'s pool.
    pub fn new(manager: Arc<ServerManager>) -> Self {
        Self {
            manager,
            registered: Mutex::new(HashMap::new()),
            on_reconnect: Mutex::new(None),
            on_idle_shutdown: Mutex::new(None),
            task: std::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Register a server with its resolved idle timeout.
    pub async fn register(
        &self,
        name: &str,
        definition: ServerDefinition,
        effective_idle_timeout_ms: i64,
    ) {
        let keep_alive = definition.lifecycle == Lifecycle::KeepAlive;
        self.registered.lock().await.insert(
            name.to_string(),
            RegisteredServer {
                definition,
                effective_idle_timeout_ms,
                keep_alive,
            },
        );
    }

    /// Install the reconnect callback (metadata refresh).
    pub async fn on_reconnect(&self, callback: LifecycleCallback) {
        *self.on_reconnect.lock().await = Some(callback);
    }

    /// Install the idle shutdown callback.
    pub async fn on_idle_shutdown(&self, callback: LifecycleCallback) {
        *self.on_idle_shutdown.lock().await = Some(callback);
    }

    /// The effective idle timeout registered for `name`.
    pub async fn idle_timeout_ms(&self, name: &str) -> Option<i64> {
        self.registered
            .lock()
            .await
            .get(name)
            .map(|r| r.effective_idle_timeout_ms)
    }

    /// The registered definition for `name`.
    pub async fn definition(&self, name: &str) -> Option<ServerDefinition> {
        self.registered
            .lock()
            .await
            .get(name)
            .map(|r| r.definition.clone())
    }

    /// Start the periodic health loop.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let this = Arc::clone(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => this.health_check(now_ms()).await,
                }
            }
        });
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
    }

    /// One health pass: reconnect dropped keep-alive servers, then
    /// evict idle connections. Public so tests can tick deterministically.
    pub async fn health_check(&self, now_ms: i64) {
        // Collect under the lock, act outside it.
        let (keep_alive, evictable): (Vec<(String, ServerDefinition)>, Vec<(String, i64)>) = {
            let registered = self.registered.lock().await;
            let keep_alive = registered
                .iter()
                .filter(|(_, r)| r.keep_alive)
                .map(|(name, r)| (name.clone(), r.definition.clone()))
                .collect();
            let evictable = registered
                .iter()
                .filter(|(_, r)| !r.keep_alive && r.effective_idle_timeout_ms > 0)
                .map(|(name, r)| (name.clone(), r.effective_idle_timeout_ms))
                .collect();
            (keep_alive, evictable)
        };

        for (name, def) in keep_alive {
            if self.manager.is_connected(&name).await {
                continue;
            }
            match self.manager.connect(&name, &def).await {
                Ok(_) => {
                    info!(server = %name, "keep-alive server reconnected");
                    if let Some(callback) = self.on_reconnect.lock().await.clone() {
                        callback(name).await;
                    }
                }
                Err(e) => {
                    // Retried next tick.
                    warn!(server = %name, error = %e, "keep-alive reconnect failed");
                }
            }
        }

        for (name, timeout_ms) in evictable {
            if self.manager.is_idle(&name, timeout_ms, now_ms).await {
                debug!(server = %name, timeout_ms, "closing idle server");
                self.manager.close(&name).await;
                if let Some(callback) = self.on_idle_shutdown.lock().await.clone() {
                    callback(name).await;
                }
            }
        }
    }

    /// Stop the loop and close every connection.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.manager.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::Connector;
    use crate::testkit::{FakeConnector, FakeServer};

    fn keep_alive_def() -> ServerDefinition {
        ServerDefinition {
            command: Some("fake".into()),
            lifecycle: Lifecycle::KeepAlive,
            ..Default::default()
        }
    }

    fn lazy_def() -> ServerDefinition {
        ServerDefinition {
            command: Some("fake".into()),
            ..Default::default()
        }
    }

    fn setup(connector: FakeConnector) -> (Arc<ServerManager>, Arc<LifecycleManager>) {
        let manager = Arc::new(ServerManager::new(
            Arc::new(connector) as Arc<dyn Connector>
        ));
        let lifecycle = Arc::new(LifecycleManager::new(Arc::clone(&manager)));
        (manager, lifecycle)
    }

    /// Record callback invocations into a shared vec.
    fn recording_callback(into: Arc<std::sync::Mutex<Vec<String>>>) -> LifecycleCallback {
        Arc::new(move |name| {
            let into = Arc::clone(&into);
            Box::pin(async move {
                into.lock().unwrap().push(name);
            })
        })
    }

    #[tokio::test]
    async fn keep_alive_server_is_reconnected() {
        let (manager, lifecycle) =
            setup(FakeConnector::new().serve("k", FakeServer::with_tools(&["t"])));
        lifecycle.register("k", keep_alive_def(), 0).await;

        let reconnected = Arc::new(std::sync::Mutex::new(Vec::new()));
        lifecycle
            .on_reconnect(recording_callback(Arc::clone(&reconnected)))
            .await;

        lifecycle.health_check(now_ms()).await;
        assert!(manager.is_connected("k").await);
        assert_eq!(*reconnected.lock().unwrap(), vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn connected_keep_alive_server_is_left_alone() {
        let (manager, lifecycle) =
            setup(FakeConnector::new().serve("k", FakeServer::with_tools(&["t"])));
        lifecycle.register("k", keep_alive_def(), 0).await;
        manager.connect("k", &keep_alive_def()).await.unwrap();

        let reconnected = Arc::new(std::sync::Mutex::new(Vec::new()));
        lifecycle
            .on_reconnect(recording_callback(Arc::clone(&reconnected)))
            .await;

        lifecycle.health_check(now_ms()).await;
        // Already connected: no reconnect callback.
        assert!(reconnected.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn keep_alive_reconnect_failure_is_swallowed() {
        let (manager, lifecycle) = setup(FakeConnector::new().refuse("k"));
        lifecycle.register("k", keep_alive_def(), 0).await;
        lifecycle.health_check(now_ms()).await;
        assert!(!manager.is_connected("k").await);
    }

    #[tokio::test]
    async fn idle_server_is_evicted() {
        let (manager, lifecycle) =
            setup(FakeConnector::new().serve("e", FakeServer::default()));
        lifecycle.register("e", lazy_def(), 60_000).await;
        manager.connect("e", &lazy_def()).await.unwrap();
        manager.touch("e", 0).await;

        let evicted = Arc::new(std::sync::Mutex::new(Vec::new()));
        lifecycle
            .on_idle_shutdown(recording_callback(Arc::clone(&evicted)))
            .await;

        lifecycle.health_check(70_000).await;
        assert_eq!(manager.status("e").await, None);
        assert_eq!(*evicted.lock().unwrap(), vec!["e".to_string()]);
    }

    #[tokio::test]
    async fn keep_alive_survives_while_idle_peer_is_evicted() {
        let (manager, lifecycle) = setup(
            FakeConnector::new()
                .serve("k", FakeServer::default())
                .serve("e", FakeServer::default()),
        );
        lifecycle.register("k", keep_alive_def(), 0).await;
        lifecycle.register("e", lazy_def(), 60_000).await;
        manager.connect("k", &keep_alive_def()).await.unwrap();
        manager.connect("e", &lazy_def()).await.unwrap();
        manager.touch("k", 0).await;
        manager.touch("e", 0).await;

        lifecycle.health_check(70_000).await;
        assert!(manager.is_connected("k").await);
        assert_eq!(manager.status("e").await, None);
    }

    #[tokio::test]
    async fn zero_timeout_disables_eviction() {
        let (manager, lifecycle) =
            setup(FakeConnector::new().serve("eager", FakeServer::default()));
        lifecycle.register("eager", lazy_def(), 0).await;
        manager.connect("eager", &lazy_def()).await.unwrap();
        manager.touch("eager", 0).await;

        lifecycle.health_check(i64::MAX).await;
        assert!(manager.is_connected("eager").await);
    }

    #[tokio::test]
    async fn in_flight_call_blocks_eviction() {
        let (manager, lifecycle) =
            setup(FakeConnector::new().serve("busy", FakeServer::default()));
        lifecycle.register("busy", lazy_def(), 60_000).await;
        manager.connect("busy", &lazy_def()).await.unwrap();
        manager.increment_in_flight("busy", 0).await;

        lifecycle.health_check(i64::MAX).await;
        assert!(manager.is_connected("busy").await);

        manager.decrement_in_flight("busy").await;
        manager.touch("busy", 0).await;
        lifecycle.health_check(70_000).await;
        assert!(!manager.is_connected("busy").await);
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let (manager, lifecycle) =
            setup(FakeConnector::new().serve("s", FakeServer::default()));
        lifecycle.register("s", lazy_def(), 60_000).await;
        manager.connect("s", &lazy_def()).await.unwrap();

        lifecycle.start(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        lifecycle.shutdown().await;
        assert!(manager.tracked().await.is_empty());
    }
}
