//! Tenant config storage: a KV-backed adapter exposing reads, writes,
//! soft-deactivation and a prefix watch, plus the poller interface the
//! manager consumes.

pub mod etcd;
pub mod inmem;
pub mod pump;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use alertmux_common::tenant::TenantConfig;

pub const CONFIG_PREFIX: &str = "alertmanager/configs/";

pub fn config_key(user_id: &str) -> String {
    format!("alertmanager/configs/user/{user_id}")
}

/// Extract the user id from `alertmanager/configs/user/{user_id}`.
pub fn user_id_from_key(key: &str) -> Option<&str> {
    let mut parts = key.split('/');
    if parts.next() != Some("alertmanager") || parts.next() != Some("configs") {
        return None;
    }
    parts.next()?;
    parts.next().filter(|s| !s.is_empty())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("failed to decode stored config: {0}")]
    Decode(#[from] serde_yaml::Error),
    #[error("config not found")]
    NotFound,
}

impl From<etcd_client::Error> for StoreError {
    fn from(e: etcd_client::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Full CRUD surface over tenant configs, as used by the admin API.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Absent keys yield the zero config, not an error.
    async fn get_config(&self, user_id: &str) -> Result<TenantConfig, StoreError>;
    async fn get_all_configs(&self) -> Result<Vec<TenantConfig>, StoreError>;
    async fn set_config(&self, cfg: &TenantConfig) -> Result<(), StoreError>;
    async fn deactivate_config(&self, user_id: &str) -> Result<(), StoreError>;
    async fn restore_config(&self, user_id: &str) -> Result<(), StoreError>;

    /// Stream change events into `tx` until the receiver is dropped or the
    /// backend fails. Deletions arrive as synthetic configs with
    /// `deleted_at` set.
    async fn watch(&self, tx: mpsc::Sender<TenantConfig>) -> Result<(), StoreError>;
}

/// The two reads the manager's control loop performs.
#[async_trait]
pub trait ConfigPoller: Send + Sync {
    async fn get_all_configs(&self) -> Result<Vec<TenantConfig>, StoreError>;
    async fn get_all_updated_configs(&self) -> Result<Vec<TenantConfig>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(config_key("u1"), "alertmanager/configs/user/u1");
        assert!(config_key("u1").starts_with(CONFIG_PREFIX));
    }

    #[test]
    fn user_id_roundtrips_through_key() {
        assert_eq!(user_id_from_key(&config_key("tenant-7")), Some("tenant-7"));
    }

    #[test]
    fn malformed_keys_yield_none() {
        assert_eq!(user_id_from_key("other/prefix/user/u1"), None);
        assert_eq!(user_id_from_key("alertmanager/configs/user/"), None);
        assert_eq!(user_id_from_key("alertmanager/configs"), None);
    }
}
