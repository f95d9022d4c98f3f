//! Etcd v3 adapter. Configs live as YAML bodies under
//! `alertmanager/configs/user/{user_id}`; a prefix watch feeds the change
//! pump.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, EventType, GetOptions, WatchOptions};
use tokio::sync::mpsc;

use alertmux_common::now_unix;
use alertmux_common::tenant::TenantConfig;

use super::{config_key, user_id_from_key, ConfigStore, StoreError, CONFIG_PREFIX};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self, StoreError> {
        let options = ConnectOptions::new().with_connect_timeout(DIAL_TIMEOUT);
        let client = Client::connect(endpoints, Some(options)).await?;
        Ok(Self { client })
    }

    async fn get(&self, key: &str) -> Result<TenantConfig, StoreError> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(serde_yaml::from_slice(kv.value())?),
            None => Ok(TenantConfig::default()),
        }
    }

    async fn put(&self, cfg: &TenantConfig) -> Result<(), StoreError> {
        let body = serde_yaml::to_string(cfg)?;
        let mut client = self.client.clone();
        client.put(config_key(&cfg.user_id), body, None).await?;
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for EtcdStore {
    async fn get_config(&self, user_id: &str) -> Result<TenantConfig, StoreError> {
        self.get(&config_key(user_id)).await
    }

    async fn get_all_configs(&self) -> Result<Vec<TenantConfig>, StoreError> {
        let mut client = self.client.clone();
        let resp = client
            .get(CONFIG_PREFIX, Some(GetOptions::new().with_prefix()))
            .await?;
        let mut out = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            out.push(serde_yaml::from_slice(kv.value())?);
        }
        Ok(out)
    }

    async fn set_config(&self, cfg: &TenantConfig) -> Result<(), StoreError> {
        self.put(cfg).await
    }

    async fn deactivate_config(&self, user_id: &str) -> Result<(), StoreError> {
        let mut cfg = self.get_config(user_id).await?;
        if cfg.is_zero() {
            return Err(StoreError::NotFound);
        }
        cfg.deactivated_at = now_unix();
        cfg.updated_at = now_unix();
        self.put(&cfg).await
    }

    async fn restore_config(&self, user_id: &str) -> Result<(), StoreError> {
        let mut cfg = self.get_config(user_id).await?;
        if cfg.is_zero() {
            return Err(StoreError::NotFound);
        }
        cfg.deactivated_at = 0;
        cfg.updated_at = now_unix();
        self.put(&cfg).await
    }

    async fn watch(&self, tx: mpsc::Sender<TenantConfig>) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        let (_watcher, mut stream) = client
            .watch(CONFIG_PREFIX, Some(WatchOptions::new().with_prefix()))
            .await?;

        while let Some(resp) = stream.message().await? {
            for event in resp.events() {
                let Some(kv) = event.kv() else { continue };
                match event.event_type() {
                    EventType::Delete => {
                        let key = kv.key_str().unwrap_or_default();
                        let Some(user_id) = user_id_from_key(key) else {
                            continue;
                        };
                        let synthetic = TenantConfig {
                            user_id: user_id.to_string(),
                            deleted_at: now_unix(),
                            ..Default::default()
                        };
                        if tx.send(synthetic).await.is_err() {
                            return Ok(());
                        }
                    }
                    EventType::Put => match serde_yaml::from_slice::<TenantConfig>(kv.value()) {
                        Ok(cfg) => {
                            if tx.send(cfg).await.is_err() {
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to decode watched config");
                        }
                    },
                }
            }
        }
        Ok(())
    }
}
