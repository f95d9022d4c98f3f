//! Inhibition: a firing "source" alert suppresses "target" alerts that agree
//! on the `equal` labels. The inhibitor keeps its own cache of candidate
//! source alerts, fed by the alert store's subscription.

use std::sync::Arc;

use dashmap::DashMap;

use alertmux_common::alert::{Alert, AlertStatus, LabelSet};
use alertmux_common::now_unix;
use tokio_util::sync::CancellationToken;

use crate::config::InhibitRuleConfig;
use crate::silence::Matcher;
use crate::store::AlertStore;

#[derive(Debug)]
pub struct InhibitRule {
    sources: Vec<Matcher>,
    targets: Vec<Matcher>,
    equal: Vec<String>,
}

impl InhibitRule {
    pub fn from_config(cfg: &InhibitRuleConfig) -> Self {
        let mut sources: Vec<Matcher> = cfg
            .source_match
            .iter()
            .map(|(k, v)| Matcher::eq(k, v))
            .collect();
        sources.extend(cfg.source_match_re.iter().map(|(k, v)| Matcher::re(k, v)));
        let mut targets: Vec<Matcher> = cfg
            .target_match
            .iter()
            .map(|(k, v)| Matcher::eq(k, v))
            .collect();
        targets.extend(cfg.target_match_re.iter().map(|(k, v)| Matcher::re(k, v)));
        Self {
            sources,
            targets,
            equal: cfg.equal.clone(),
        }
    }

    fn source_matches(&self, labels: &LabelSet) -> bool {
        !self.sources.is_empty() && self.sources.iter().all(|m| m.matches(labels))
    }

    fn target_matches(&self, labels: &LabelSet) -> bool {
        !self.targets.is_empty() && self.targets.iter().all(|m| m.matches(labels))
    }

    fn equal_labels_agree(&self, source: &LabelSet, target: &LabelSet) -> bool {
        self.equal.iter().all(|k| source.get(k) == target.get(k))
    }
}

pub struct Inhibitor {
    rules: Vec<InhibitRule>,
    store: Arc<AlertStore>,
    sources: DashMap<u64, Alert>,
}

impl Inhibitor {
    pub fn new(configs: &[InhibitRuleConfig], store: Arc<AlertStore>) -> Self {
        let rules = configs.iter().map(InhibitRule::from_config).collect();
        let inhibitor = Self {
            rules,
            store,
            sources: DashMap::new(),
        };
        // Seed the cache from alerts already in the store.
        for alert in inhibitor.store.list() {
            inhibitor.observe(alert);
        }
        inhibitor
    }

    fn observe(&self, alert: Alert) {
        let interesting = self
            .rules
            .iter()
            .any(|rule| rule.source_matches(&alert.labels));
        if interesting {
            self.sources.insert(alert.fingerprint(), alert);
        }
    }

    /// Whether any rule inhibits the given label set right now.
    pub fn mutes(&self, labels: &LabelSet) -> bool {
        let now = now_unix();
        for rule in &self.rules {
            if !rule.target_matches(labels) {
                continue;
            }
            for entry in self.sources.iter() {
                let source = entry.value();
                if source.status_at(now) != AlertStatus::Firing {
                    continue;
                }
                // An alert never inhibits itself.
                if &source.labels == labels {
                    continue;
                }
                if rule.source_matches(&source.labels)
                    && rule.equal_labels_agree(&source.labels, labels)
                {
                    return true;
                }
            }
        }
        false
    }

    /// Track source candidates until the engine reconfigures or stops.
    pub async fn run(&self, stop: CancellationToken) {
        let mut rx = self.store.subscribe();
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(alert) => self.observe(alert),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "inhibitor lagged behind alert stream");
                        // Recover the dropped updates from the store itself.
                        for alert in self.store.list() {
                            self.observe(alert);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }
}
