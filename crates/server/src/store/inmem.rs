//! In-memory config store for development and tests, selected when no etcd
//! endpoints are configured. Watchers receive the same put/delete events
//! the etcd adapter would emit.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

use alertmux_common::now_unix;
use alertmux_common::tenant::TenantConfig;

use super::{ConfigStore, StoreError};

#[derive(Default)]
pub struct InMemStore {
    storage: DashMap<String, TenantConfig>,
    watchers: Mutex<Vec<mpsc::Sender<TenantConfig>>>,
}

impl InMemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify_watchers(&self, cfg: &TenantConfig) {
        let mut watchers = self.watchers.lock().expect("watcher lock poisoned");
        watchers.retain(|tx| tx.try_send(cfg.clone()).is_ok());
    }

    /// Hard-delete a key, emitting the synthetic deletion event the etcd
    /// watcher would produce.
    pub fn delete_config(&self, user_id: &str) -> bool {
        let removed = self.storage.remove(user_id).is_some();
        if removed {
            self.notify_watchers(&TenantConfig {
                user_id: user_id.to_string(),
                deleted_at: now_unix(),
                ..Default::default()
            });
        }
        removed
    }
}

#[async_trait]
impl ConfigStore for InMemStore {
    async fn get_config(&self, user_id: &str) -> Result<TenantConfig, StoreError> {
        Ok(self
            .storage
            .get(user_id)
            .map(|e| e.clone())
            .unwrap_or_default())
    }

    async fn get_all_configs(&self) -> Result<Vec<TenantConfig>, StoreError> {
        let mut out: Vec<TenantConfig> = self.storage.iter().map(|e| e.clone()).collect();
        out.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(out)
    }

    async fn set_config(&self, cfg: &TenantConfig) -> Result<(), StoreError> {
        self.storage.insert(cfg.user_id.clone(), cfg.clone());
        self.notify_watchers(cfg);
        Ok(())
    }

    async fn deactivate_config(&self, user_id: &str) -> Result<(), StoreError> {
        let mut cfg = match self.storage.get(user_id) {
            Some(entry) => entry.clone(),
            None => return Err(StoreError::NotFound),
        };
        cfg.deactivated_at = now_unix();
        cfg.updated_at = now_unix();
        self.storage.insert(user_id.to_string(), cfg.clone());
        self.notify_watchers(&cfg);
        Ok(())
    }

    async fn restore_config(&self, user_id: &str) -> Result<(), StoreError> {
        let mut cfg = match self.storage.get(user_id) {
            Some(entry) => entry.clone(),
            None => return Err(StoreError::NotFound),
        };
        cfg.deactivated_at = 0;
        cfg.updated_at = now_unix();
        self.storage.insert(user_id.to_string(), cfg.clone());
        self.notify_watchers(&cfg);
        Ok(())
    }

    async fn watch(&self, tx: mpsc::Sender<TenantConfig>) -> Result<(), StoreError> {
        self.watchers
            .lock()
            .expect("watcher lock poisoned")
            .push(tx.clone());
        // Stay alive until the consumer goes away, like a backend stream.
        tx.closed().await;
        Ok(())
    }
}
