// Runtime configuration manager
//
// Policy knobs are hot-reloaded from the store on an interval. Writers swap a
// fully-populated snapshot under a reader-preferring lock; readers clone the
// Arc and observe one consistent snapshot per observation.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::store::entities::RuntimeSettings;
use crate::store::GatewayStore;

pub const DEFAULT_RELOAD_INTERVAL_SECS: u64 = 60;

pub struct RuntimeConfigManager {
    snapshot: RwLock<Arc<RuntimeSettings>>,
    store: Arc<dyn GatewayStore>,
}

impl RuntimeConfigManager {
    /// Load the initial snapshot from the store
    pub async fn load(store: Arc<dyn GatewayStore>) -> anyhow::Result<Arc<Self>> {
        let settings = store
            .load_runtime_settings()
            .await
            .map_err(|e| anyhow::anyhow!("failed to load runtime settings: {}", e))?;
        Ok(Arc::new(Self {
            snapshot: RwLock::new(Arc::new(settings)),
            store,
        }))
    }

    #[cfg(test)]
    pub fn with_settings(store: Arc<dyn GatewayStore>, settings: RuntimeSettings) -> Arc<Self> {
        Arc::new(Self {
            snapshot: RwLock::new(Arc::new(settings)),
            store,
        })
    }

    /// Current snapshot; cheap to call on every request
    pub async fn current(&self) -> Arc<RuntimeSettings> {
        self.snapshot.read().await.clone()
    }

    /// Re-read settings from the store and swap the snapshot
    pub async fn reload(&self) {
        match self.store.load_runtime_settings().await {
            Ok(settings) => {
                let mut guard = self.snapshot.write().await;
                *guard = Arc::new(settings);
            }
            Err(e) => {
                tracing::warn!("Runtime settings reload failed, keeping snapshot: {}", e);
            }
        }
    }

    /// Spawn the reload timer task
    pub fn spawn_reload_task(self: &Arc<Self>, interval_secs: u64) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            // First tick fires immediately; skip it, startup already loaded
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.reload().await;
                tracing::debug!("Runtime settings reloaded");
            }
        })
    }
}
