//! Change pump: bridges the store's blocking watch stream into the
//! "updated since last poll" queue the manager drains on every tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use alertmux_common::tenant::TenantConfig;

use super::{ConfigPoller, ConfigStore, StoreError};

/// Watch events buffered between two polls. A full buffer blocks the
/// watcher, bounding memory without dropping events.
pub const UPDATE_BUFFER: usize = 10_000;

const WATCH_RESTART_DELAY: Duration = Duration::from_secs(1);

pub struct ChangePump {
    store: Arc<dyn ConfigStore>,
    updates: tokio::sync::Mutex<mpsc::Receiver<TenantConfig>>,
}

impl ChangePump {
    /// Start the watcher task; it re-subscribes on backend failures until
    /// `stop` fires.
    pub fn new(store: Arc<dyn ConfigStore>, stop: CancellationToken) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(UPDATE_BUFFER);
        let pump = Arc::new(Self {
            store: store.clone(),
            updates: tokio::sync::Mutex::new(rx),
        });

        tokio::spawn(async move {
            loop {
                let watch = store.watch(tx.clone());
                tokio::select! {
                    _ = stop.cancelled() => return,
                    result = watch => match result {
                        Ok(()) => {
                            tracing::debug!("config watch stream ended");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "config watch failed, restarting");
                        }
                    },
                }
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(WATCH_RESTART_DELAY) => {}
                }
            }
        });

        pump
    }

    async fn drain(&self) -> Vec<TenantConfig> {
        let mut rx = self.updates.lock().await;
        let mut out = Vec::new();
        while let Ok(cfg) = rx.try_recv() {
            out.push(cfg);
        }
        out
    }
}

#[async_trait]
impl ConfigPoller for ChangePump {
    async fn get_all_configs(&self) -> Result<Vec<TenantConfig>, StoreError> {
        self.store.get_all_configs().await
    }

    /// Atomically drain everything the watcher buffered since the previous
    /// call.
    async fn get_all_updated_configs(&self) -> Result<Vec<TenantConfig>, StoreError> {
        Ok(self.drain().await)
    }
}
