//! The multi-tenant control loop: reconciles declared tenant configs from
//! the store against the set of running engines.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use alertmux_common::retry::Backoff;
use alertmux_common::tenant::TenantConfig;
use alertmux_engine::peer::StaticPeer;
use alertmux_engine::{Engine, EngineOptions};

use crate::metrics::ManagerMetrics;
use crate::store::ConfigPoller;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct ManagerConfig {
    pub data_dir: PathBuf,
    pub retention: Duration,
    pub external_url: String,
    pub poll_interval: Duration,
    pub peer: Option<Arc<StaticPeer>>,
    pub peer_timeout: Duration,
}

pub struct Manager {
    cfg: ManagerConfig,
    poller: Arc<dyn ConfigPoller>,
    metrics: Arc<ManagerMetrics>,
    cfgs: std::sync::RwLock<HashMap<String, TenantConfig>>,
    engines: tokio::sync::RwLock<HashMap<String, Arc<Engine>>>,
    stop: CancellationToken,
}

impl Manager {
    pub fn new(
        cfg: ManagerConfig,
        poller: Arc<dyn ConfigPoller>,
        metrics: Arc<ManagerMetrics>,
    ) -> std::io::Result<Arc<Self>> {
        std::fs::create_dir_all(&cfg.data_dir)?;
        Ok(Arc::new(Self {
            cfg,
            poller,
            metrics,
            cfgs: std::sync::RwLock::new(HashMap::new()),
            engines: tokio::sync::RwLock::new(HashMap::new()),
            stop: CancellationToken::new(),
        }))
    }

    /// Signal the control loop to exit; `run` stops every engine before
    /// returning.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    /// Load the initial config set (retrying forever with backoff), then
    /// poll for updates every `poll_interval` until shut down.
    pub async fn run(self: Arc<Self>) {
        let mut backoff = Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF);
        loop {
            let started = Instant::now();
            match self.poller.get_all_configs().await {
                Ok(configs) => {
                    self.metrics.record_poll(started, true);
                    tracing::debug!(num_configs = configs.len(), "initial configuration load");
                    self.apply_configs(configs).await;
                    break;
                }
                Err(e) => {
                    self.metrics.record_poll(started, false);
                    tracing::warn!(error = %e, "error fetching all configurations, backing off");
                    tokio::select! {
                        _ = self.stop.cancelled() => {
                            self.stop_all().await;
                            return;
                        }
                        _ = backoff.wait() => {}
                    }
                }
            }
        }

        let mut ticker = tokio::time::interval(self.cfg.poll_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {
                    let started = Instant::now();
                    match self.poller.get_all_updated_configs().await {
                        Ok(configs) => {
                            self.metrics.record_poll(started, true);
                            self.apply_configs(configs).await;
                        }
                        Err(e) => {
                            self.metrics.record_poll(started, false);
                            tracing::warn!(error = %e, "error updating configs");
                        }
                    }
                }
            }
        }
        self.stop_all().await;
    }

    async fn stop_all(&self) {
        let engines: Vec<(String, Arc<Engine>)> =
            self.engines.write().await.drain().collect();
        for (user_id, engine) in engines {
            engine.stop().await;
            self.metrics.inc_engines_stopped();
            tracing::debug!(user = %user_id, "engine stopped on shutdown");
        }
        tracing::debug!("manager stopped");
    }

    async fn apply_configs(&self, configs: Vec<TenantConfig>) {
        for cfg in configs {
            let user_id = cfg.user_id.clone();
            if let Err(e) = self.set_config(cfg).await {
                tracing::warn!(user = %user_id, error = %e, "error applying config");
            }
        }
        let known = self.cfgs.read().expect("cfgs lock poisoned").len();
        self.metrics.set_configs(known as u64);
    }

    /// Reconcile one declared config: tear down inactive tenants, create
    /// engines on first activation, re-apply on changes, no-op otherwise.
    /// Parse failures keep the running engine untouched.
    pub async fn set_config(&self, cfg: TenantConfig) -> anyhow::Result<()> {
        let user_id = cfg.user_id.clone();
        if user_id.is_empty() {
            anyhow::bail!("config has no user id");
        }

        if cfg.is_inactive() {
            let engine = self.engines.write().await.remove(&user_id);
            if let Some(engine) = engine {
                engine.stop().await;
                self.metrics.inc_engines_stopped();
                tracing::info!(user = %user_id, "engine stopped");
            }
            self.cfgs
                .write()
                .expect("cfgs lock poisoned")
                .remove(&user_id);
            return Ok(());
        }

        let templates_changed =
            write_template_files(&self.cfg.data_dir, &user_id, &cfg.template_files)?;

        let parsed = alertmux_engine::config::load(&cfg.config)?;

        let existing = self.engines.read().await.get(&user_id).cloned();
        match existing {
            None => {
                let engine = Arc::new(Engine::new(EngineOptions {
                    user_id: user_id.clone(),
                    data_dir: self.cfg.data_dir.clone(),
                    retention: self.cfg.retention,
                    external_url: self.cfg.external_url.clone(),
                    peer: self.cfg.peer.clone(),
                    peer_timeout: self.cfg.peer_timeout,
                })?);
                engine.apply_config(&parsed).await?;
                self.engines
                    .write()
                    .await
                    .insert(user_id.clone(), engine);
                self.metrics.inc_engines_started();
                self.cfgs
                    .write()
                    .expect("cfgs lock poisoned")
                    .insert(user_id, cfg);
            }
            Some(engine) => {
                let config_changed = {
                    let cfgs = self.cfgs.read().expect("cfgs lock poisoned");
                    cfgs.get(&user_id).map(|c| c.config != cfg.config).unwrap_or(true)
                };
                if config_changed || templates_changed {
                    engine.apply_config(&parsed).await?;
                    self.cfgs
                        .write()
                        .expect("cfgs lock poisoned")
                        .insert(user_id, cfg);
                }
            }
        }
        Ok(())
    }

    pub async fn engine(&self, user_id: &str) -> Option<Arc<Engine>> {
        self.engines.read().await.get(user_id).cloned()
    }

    pub async fn engine_count(&self) -> usize {
        self.engines.read().await.len()
    }

    pub fn cached_config(&self, user_id: &str) -> Option<TenantConfig> {
        self.cfgs
            .read()
            .expect("cfgs lock poisoned")
            .get(user_id)
            .cloned()
    }

    pub fn peer(&self) -> Option<Arc<StaticPeer>> {
        self.cfg.peer.clone()
    }
}

/// Materialize a tenant's template files, writing only on content change.
/// Returns whether anything changed.
fn write_template_files(
    data_dir: &Path,
    user_id: &str,
    files: &std::collections::BTreeMap<String, String>,
) -> std::io::Result<bool> {
    let mut changed = false;
    for (name, content) in files {
        let path = data_dir.join("templates").join(user_id).join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::read_to_string(&path) {
            Ok(existing) if existing == *content => continue,
            _ => {
                std::fs::write(&path, content)?;
                changed = true;
            }
        }
    }
    Ok(changed)
}
