//! The per-tenant engine: owns the renderer, silences, notification log,
//! inhibitor, alert store and dispatcher, and survives reconfiguration by
//! swapping its inner handles.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use alertmux_common::alert::Alert;
use alertmux_common::now_unix;

use crate::config::{AmConfig, ConfigError};
use crate::dispatch::{Dispatcher, Route};
use crate::inhibit::Inhibitor;
use crate::nflog::{NflogError, NotificationLog};
use crate::notify::build_receiver_integrations;
use crate::peer::{ClusterPosition, StaticPeer};
use crate::pipeline::{ReceiverPipeline, WaitFn, MIN_TIMEOUT};
use crate::silence::{Silence, SilenceError, Silences};
use crate::store::AlertStore;
use crate::template::{Renderer, TemplateError};

const MAINTENANCE_PERIOD: Duration = Duration::from_secs(15 * 60);
const ALERT_GC_PERIOD: Duration = Duration::from_secs(30 * 60);
const ALERT_RETENTION: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to create data directory: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Silences(#[from] SilenceError),
    #[error(transparent)]
    Nflog(#[from] NflogError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Clone)]
pub struct EngineOptions {
    pub user_id: String,
    pub data_dir: PathBuf,
    pub retention: Duration,
    pub external_url: String,
    pub peer: Option<Arc<StaticPeer>>,
    pub peer_timeout: Duration,
}

struct TaskHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

#[derive(Default)]
struct Inner {
    dispatcher: Option<TaskHandle>,
    inhibitor: Option<TaskHandle>,
}

pub struct Engine {
    opts: EngineOptions,
    silences: Arc<Silences>,
    nflog: Arc<NotificationLog>,
    alerts: Arc<AlertStore>,
    inner: tokio::sync::Mutex<Inner>,
    lifecycle: CancellationToken,
    maintenance: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(opts: EngineOptions) -> Result<Self, EngineError> {
        std::fs::create_dir_all(&opts.data_dir)?;

        let silences = Arc::new(Silences::open(
            opts.data_dir.join(format!("silences:{}", opts.user_id)),
            opts.retention,
        )?);
        let nflog = Arc::new(NotificationLog::open(
            opts.data_dir.join(format!("nflog:{}", opts.user_id)),
            opts.retention,
        )?);
        if let Some(peer) = &opts.peer {
            nflog.set_broadcast(peer.state_sender());
        }
        let alerts = Arc::new(AlertStore::new(ALERT_RETENTION));

        let lifecycle = CancellationToken::new();
        let mut maintenance = Vec::new();
        {
            let silences = silences.clone();
            let stop = lifecycle.child_token();
            maintenance.push(tokio::spawn(async move {
                silences.maintenance(MAINTENANCE_PERIOD, stop).await;
            }));
        }
        {
            let nflog = nflog.clone();
            let stop = lifecycle.child_token();
            maintenance.push(tokio::spawn(async move {
                nflog.maintenance(MAINTENANCE_PERIOD, stop).await;
            }));
        }
        {
            let alerts = alerts.clone();
            let stop = lifecycle.child_token();
            maintenance.push(tokio::spawn(async move {
                alerts.run_gc(ALERT_GC_PERIOD, stop).await;
            }));
        }

        Ok(Self {
            opts,
            silences,
            nflog,
            alerts,
            inner: tokio::sync::Mutex::new(Inner::default()),
            lifecycle,
            maintenance: std::sync::Mutex::new(maintenance),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.opts.user_id
    }

    /// Apply a parsed receiver configuration, replacing the dispatcher and
    /// inhibitor. The engine identity and its stores survive.
    pub async fn apply_config(&self, conf: &AmConfig) -> Result<(), EngineError> {
        let templates_dir = self
            .opts
            .data_dir
            .join("templates")
            .join(&self.opts.user_id);
        let mut renderer = Renderer::new(self.opts.external_url.clone());
        for name in &conf.templates {
            let path = templates_dir.join(name);
            let stem = Path::new(name)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(name.as_str());
            renderer.register_file(stem, &path)?;
        }
        let renderer = Arc::new(renderer);

        let mut inner = self.inner.lock().await;
        // The first apply has no previous handles to stop.
        if let Some(task) = inner.dispatcher.take() {
            task.stop().await;
        }
        if let Some(task) = inner.inhibitor.take() {
            task.stop().await;
        }

        let inhibitor = Arc::new(Inhibitor::new(&conf.inhibit_rules, self.alerts.clone()));

        let wait: WaitFn = match &self.opts.peer {
            None => Arc::new(|| Duration::ZERO),
            Some(peer) => {
                let peer = peer.clone();
                let timeout = self.opts.peer_timeout;
                Arc::new(move || timeout * peer.position() as u32)
            }
        };
        let timeout_fn: Arc<dyn Fn(Duration) -> Duration + Send + Sync> = {
            let wait = wait.clone();
            Arc::new(move |d| d.max(MIN_TIMEOUT) + wait())
        };

        let mut pipelines = HashMap::new();
        for rc in &conf.receivers {
            let integrations = build_receiver_integrations(rc, &conf.global, renderer.clone())?;
            pipelines.insert(
                rc.name.clone(),
                ReceiverPipeline::build(
                    integrations,
                    inhibitor.clone(),
                    self.silences.clone(),
                    self.nflog.clone(),
                    wait.clone(),
                ),
            );
        }
        let route = Route::compile(&conf.route)?;

        let dispatcher = Dispatcher::new(
            self.opts.user_id.clone(),
            route,
            pipelines,
            timeout_fn,
        );
        let cancel = self.lifecycle.child_token();
        let store = self.alerts.clone();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { dispatcher.run(store, cancel).await })
        };
        inner.dispatcher = Some(TaskHandle { cancel, handle });

        let cancel = self.lifecycle.child_token();
        let handle = {
            let inhibitor = inhibitor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { inhibitor.run(cancel).await })
        };
        inner.inhibitor = Some(TaskHandle { cancel, handle });

        tracing::info!(user = %self.opts.user_id, "configuration applied");
        Ok(())
    }

    /// Tear everything down: dispatcher, inhibitor, then the maintenance
    /// tasks. All in-flight notifications are cancelled.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.dispatcher.take() {
            task.stop().await;
        }
        if let Some(task) = inner.inhibitor.take() {
            task.stop().await;
        }
        drop(inner);

        self.lifecycle.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.maintenance.lock().expect("maintenance lock poisoned");
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        tracing::debug!(user = %self.opts.user_id, "engine stopped");
    }

    pub fn post_alerts(&self, alerts: Vec<Alert>) -> usize {
        let count = alerts.len();
        for alert in alerts {
            self.alerts.put(alert);
        }
        count
    }

    pub fn list_alerts(&self) -> Vec<Alert> {
        self.alerts.list()
    }

    pub fn create_silence(&self, silence: Silence) -> Result<String, SilenceError> {
        self.silences.set(silence)
    }

    pub fn list_silences(&self) -> Vec<Silence> {
        self.silences.list()
    }

    pub fn expire_silence(&self, id: &str) -> bool {
        self.silences.expire(id)
    }

    pub fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "user_id": self.opts.user_id,
            "alerts": self.alerts.list().len(),
            "silences": self.silences.list().len(),
            "uptime_checked_at": now_unix(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alertmux_common::alert::LabelSet;

    const CONFIG: &str = r#"
route:
  receiver: team-x
  group_by: [alertname]
  group_wait: 100ms
receivers:
  - name: team-x
    webhook_configs:
      - url: http://127.0.0.1:9/hook
"#;

    fn options(dir: &Path) -> EngineOptions {
        EngineOptions {
            user_id: "u1".into(),
            data_dir: dir.to_path_buf(),
            retention: Duration::from_secs(3600),
            external_url: "/api/prom/alertmanager".into(),
            peer: None,
            peer_timeout: Duration::from_secs(15),
        }
    }

    fn firing_alert(name: &str) -> Alert {
        let mut labels = LabelSet::new();
        labels.insert("alertname".into(), name.into());
        Alert {
            labels,
            annotations: LabelSet::new(),
            starts_at: 0,
            ends_at: 0,
            generator_url: String::new(),
        }
    }

    #[tokio::test]
    async fn apply_config_twice_keeps_engine_running() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(options(dir.path())).unwrap();
        let conf = crate::config::load(CONFIG).unwrap();

        engine.apply_config(&conf).await.unwrap();
        engine.apply_config(&conf).await.unwrap();

        engine.post_alerts(vec![firing_alert("X")]);
        assert_eq!(engine.list_alerts().len(), 1);

        engine.stop().await;
    }

    #[tokio::test]
    async fn stop_completes_without_apply() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(options(dir.path())).unwrap();
        engine.stop().await;
    }

    #[tokio::test]
    async fn template_files_are_loaded_from_tenant_dir() {
        let dir = tempfile::tempdir().unwrap();
        let templates = dir.path().join("templates").join("u1");
        std::fs::create_dir_all(&templates).unwrap();
        std::fs::write(templates.join("custom.tmpl"), "hello {{receiver}}").unwrap();

        let conf_text = format!("{CONFIG}templates:\n  - custom.tmpl\n");
        let conf = crate::config::load(&conf_text).unwrap();
        let engine = Engine::new(options(dir.path())).unwrap();
        engine.apply_config(&conf).await.unwrap();
        engine.stop().await;
    }

    #[tokio::test]
    async fn missing_template_file_fails_apply() {
        let dir = tempfile::tempdir().unwrap();
        let conf_text = format!("{CONFIG}templates:\n  - nope.tmpl\n");
        let conf = crate::config::load(&conf_text).unwrap();
        let engine = Engine::new(options(dir.path())).unwrap();
        assert!(engine.apply_config(&conf).await.is_err());
        engine.stop().await;
    }

    #[tokio::test]
    async fn silence_roundtrip_through_engine() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(options(dir.path())).unwrap();
        let id = engine
            .create_silence(Silence {
                id: String::new(),
                matchers: vec![crate::silence::Matcher::eq("alertname", "X")],
                starts_at: 0,
                ends_at: i64::MAX,
                created_by: "ops".into(),
                comment: "test".into(),
            })
            .unwrap();
        assert_eq!(engine.list_silences().len(), 1);
        assert!(engine.expire_silence(&id));
        engine.stop().await;
    }
}
