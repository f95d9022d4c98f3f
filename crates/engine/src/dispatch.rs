//! Routing and dispatch: alerts are matched to a route, aggregated into
//! groups by the route's grouping labels, and flushed through the receiver
//! pipeline after the group's wait or interval elapses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use alertmux_common::alert::{Alert, AlertStatus, LabelSet};
use alertmux_common::now_unix;

use crate::config::{ConfigError, RouteConfig};
use crate::notify::NotifyContext;
use crate::pipeline::ReceiverPipeline;
use crate::silence::Matcher;
use crate::store::AlertStore;

const DEFAULT_GROUP_WAIT: Duration = Duration::from_secs(30);
const DEFAULT_GROUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_REPEAT_INTERVAL: Duration = Duration::from_secs(4 * 3600);

const FLUSH_TICK: Duration = Duration::from_secs(1);

/// A compiled routing node. Children inherit timing and receiver settings.
#[derive(Debug)]
pub struct Route {
    pub receiver: String,
    pub group_by: Vec<String>,
    matchers: Vec<Matcher>,
    pub group_wait: Duration,
    pub group_interval: Duration,
    pub repeat_interval: Duration,
    pub routes: Vec<Route>,
}

impl Route {
    pub fn compile(cfg: &RouteConfig) -> Result<Route, ConfigError> {
        let receiver = cfg
            .receiver
            .clone()
            .ok_or(ConfigError::MissingRootReceiver)?;
        Self::compile_node(
            cfg,
            &receiver,
            &cfg.group_by,
            cfg.group_wait.unwrap_or(DEFAULT_GROUP_WAIT),
            cfg.group_interval.unwrap_or(DEFAULT_GROUP_INTERVAL),
            cfg.repeat_interval.unwrap_or(DEFAULT_REPEAT_INTERVAL),
        )
    }

    fn compile_node(
        cfg: &RouteConfig,
        parent_receiver: &str,
        parent_group_by: &[String],
        parent_group_wait: Duration,
        parent_group_interval: Duration,
        parent_repeat_interval: Duration,
    ) -> Result<Route, ConfigError> {
        let receiver = cfg
            .receiver
            .clone()
            .unwrap_or_else(|| parent_receiver.to_string());
        let group_by = if cfg.group_by.is_empty() {
            parent_group_by.to_vec()
        } else {
            cfg.group_by.clone()
        };
        let group_wait = cfg.group_wait.unwrap_or(parent_group_wait);
        let group_interval = cfg.group_interval.unwrap_or(parent_group_interval);
        let repeat_interval = cfg.repeat_interval.unwrap_or(parent_repeat_interval);

        let mut matchers: Vec<Matcher> = cfg
            .match_eq
            .iter()
            .map(|(k, v)| Matcher::eq(k, v))
            .collect();
        matchers.extend(cfg.match_re.iter().map(|(k, v)| Matcher::re(k, v)));

        let routes = cfg
            .routes
            .iter()
            .map(|child| {
                Self::compile_node(
                    child,
                    &receiver,
                    &group_by,
                    group_wait,
                    group_interval,
                    repeat_interval,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Route {
            receiver,
            group_by,
            matchers,
            group_wait,
            group_interval,
            repeat_interval,
            routes,
        })
    }

    pub fn matches(&self, labels: &LabelSet) -> bool {
        self.matchers.iter().all(|m| m.matches(labels))
    }

    /// Walk the tree, descending into the first matching child.
    pub fn resolve(&self, labels: &LabelSet) -> &Route {
        for child in &self.routes {
            if child.matches(labels) {
                return child.resolve(labels);
            }
        }
        self
    }
}

/// Project the labels a route groups by. An empty `group_by` keeps a single
/// group per route.
pub fn project_labels(labels: &LabelSet, group_by: &[String]) -> LabelSet {
    let mut out = LabelSet::new();
    for key in group_by {
        if let Some(value) = labels.get(key) {
            out.insert(key.clone(), value.clone());
        }
    }
    out
}

/// Stable group identifier consumed by integrations for dedup keys.
pub fn group_key(receiver: &str, group_labels: &LabelSet) -> String {
    let labels: Vec<String> = group_labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect();
    format!("{receiver}:{{{}}}", labels.join(","))
}

struct AggrGroup {
    receiver: String,
    group_labels: LabelSet,
    group_key: String,
    group_interval: Duration,
    repeat_interval: Duration,
    alerts: HashMap<u64, Alert>,
    next_flush: Instant,
}

pub struct Dispatcher {
    user_id: String,
    route: Route,
    pipelines: HashMap<String, ReceiverPipeline>,
    timeout_fn: Arc<dyn Fn(Duration) -> Duration + Send + Sync>,
}

impl Dispatcher {
    pub fn new(
        user_id: String,
        route: Route,
        pipelines: HashMap<String, ReceiverPipeline>,
        timeout_fn: Arc<dyn Fn(Duration) -> Duration + Send + Sync>,
    ) -> Self {
        Self {
            user_id,
            route,
            pipelines,
            timeout_fn,
        }
    }

    /// Consume the store's alert stream until cancelled. Groups deliver
    /// sequentially; a fresh dispatcher re-seeds its groups from the store
    /// so reconfiguration does not lose pending alerts.
    pub async fn run(self, store: Arc<AlertStore>, cancel: CancellationToken) {
        let mut rx = store.subscribe();
        let mut groups: HashMap<String, AggrGroup> = HashMap::new();
        for alert in store.list() {
            self.ingest(&mut groups, alert);
        }

        let mut ticker = tokio::time::interval(FLUSH_TICK);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(alert) => self.ingest(&mut groups, alert),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(user = %self.user_id, skipped, "dispatcher lagged, re-seeding from store");
                        for alert in store.list() {
                            self.ingest(&mut groups, alert);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = ticker.tick() => self.flush_due(&mut groups, &cancel).await,
            }
        }
        tracing::debug!(user = %self.user_id, "dispatcher stopped");
    }

    fn ingest(&self, groups: &mut HashMap<String, AggrGroup>, alert: Alert) {
        let route = self.route.resolve(&alert.labels);
        let group_labels = project_labels(&alert.labels, &route.group_by);
        let key = group_key(&route.receiver, &group_labels);
        let group = groups.entry(key.clone()).or_insert_with(|| AggrGroup {
            receiver: route.receiver.clone(),
            group_labels,
            group_key: key,
            group_interval: route.group_interval,
            repeat_interval: route.repeat_interval,
            alerts: HashMap::new(),
            next_flush: Instant::now() + route.group_wait,
        });
        group.alerts.insert(alert.fingerprint(), alert);
    }

    async fn flush_due(&self, groups: &mut HashMap<String, AggrGroup>, cancel: &CancellationToken) {
        let tick = Instant::now();
        let mut drained = Vec::new();
        for (key, group) in groups.iter_mut() {
            if group.alerts.is_empty() {
                drained.push(key.clone());
                continue;
            }
            if group.next_flush > tick {
                continue;
            }
            self.flush_group(group, cancel).await;
            group.next_flush = Instant::now() + group.group_interval;
        }
        for key in drained {
            groups.remove(&key);
        }
    }

    async fn flush_group(&self, group: &mut AggrGroup, cancel: &CancellationToken) {
        let Some(pipeline) = self.pipelines.get(&group.receiver) else {
            tracing::warn!(
                user = %self.user_id,
                receiver = %group.receiver,
                "no pipeline for receiver"
            );
            return;
        };

        let now = now_unix();
        let mut all: Vec<Alert> = group.alerts.values().cloned().collect();
        all.sort_by_key(Alert::fingerprint);
        let (resolved, firing): (Vec<Alert>, Vec<Alert>) = all
            .into_iter()
            .partition(|a| a.status_at(now) == AlertStatus::Resolved);

        let timeout = (self.timeout_fn)(group.group_interval);
        // Homogeneous batches: all firing first, then all resolved.
        for batch in [firing, resolved] {
            if batch.is_empty() {
                continue;
            }
            let ctx = NotifyContext {
                group_key: group.group_key.clone(),
                receiver_name: group.receiver.clone(),
                group_labels: group.group_labels.clone(),
                repeat_interval: group.repeat_interval,
                cancel: cancel.child_token(),
            };
            match tokio::time::timeout(timeout, pipeline.exec(&ctx, batch)).await {
                Ok(failures) => {
                    for (integration, error) in failures {
                        tracing::error!(
                            user = %self.user_id,
                            integration = %integration,
                            error = %error,
                            "notification failed"
                        );
                    }
                }
                Err(_) => {
                    ctx.cancel.cancel();
                    tracing::warn!(
                        user = %self.user_id,
                        group = %group.group_key,
                        "notification timed out"
                    );
                }
            }
        }

        // Resolved alerts leave the group once flushed.
        group
            .alerts
            .retain(|_, a| a.status_at(now) != AlertStatus::Resolved);
    }
}
