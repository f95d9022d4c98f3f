//! Silences: declarative predicates that suppress matching alerts for a
//! time window, persisted as a per-tenant snapshot file.

use std::path::PathBuf;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use alertmux_common::alert::LabelSet;
use alertmux_common::now_unix;

#[derive(Debug, Error)]
pub enum SilenceError {
    #[error("snapshot io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot decode failed: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("silence has no matchers")]
    NoMatchers,
    #[error("invalid matcher regex {0:?}: {1}")]
    BadRegex(String, regex::Error),
}

/// A single label predicate: exact equality or an anchored regex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Matcher {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub is_regex: bool,
}

impl Matcher {
    pub fn eq(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            is_regex: false,
        }
    }

    pub fn re(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            is_regex: true,
        }
    }

    pub fn validate(&self) -> Result<(), SilenceError> {
        if self.is_regex {
            regex::Regex::new(&self.value)
                .map_err(|e| SilenceError::BadRegex(self.value.clone(), e))?;
        }
        Ok(())
    }

    pub fn matches(&self, labels: &LabelSet) -> bool {
        let Some(value) = labels.get(&self.name) else {
            return false;
        };
        if !self.is_regex {
            return value == &self.value;
        }
        match regex::Regex::new(&format!("^(?:{})$", self.value)) {
            Ok(re) => re.is_match(value),
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Silence {
    pub id: String,
    pub matchers: Vec<Matcher>,
    pub starts_at: i64,
    pub ends_at: i64,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub comment: String,
}

impl Silence {
    pub fn active_at(&self, now: i64) -> bool {
        self.starts_at <= now && (self.ends_at == 0 || now < self.ends_at)
    }

    pub fn matches(&self, labels: &LabelSet) -> bool {
        self.matchers.iter().all(|m| m.matches(labels))
    }
}

pub struct Silences {
    entries: DashMap<String, Silence>,
    path: PathBuf,
    retention: Duration,
}

impl Silences {
    /// Open the per-tenant silence set, loading a prior snapshot if present.
    pub fn open(path: PathBuf, retention: Duration) -> Result<Self, SilenceError> {
        let entries = DashMap::new();
        match std::fs::read(&path) {
            Ok(raw) => {
                let loaded: Vec<Silence> = serde_json::from_slice(&raw)?;
                for silence in loaded {
                    entries.insert(silence.id.clone(), silence);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self {
            entries,
            path,
            retention,
        })
    }

    pub fn set(&self, mut silence: Silence) -> Result<String, SilenceError> {
        if silence.matchers.is_empty() {
            return Err(SilenceError::NoMatchers);
        }
        for matcher in &silence.matchers {
            matcher.validate()?;
        }
        if silence.id.is_empty() {
            silence.id = uuid::Uuid::new_v4().to_string();
        }
        let id = silence.id.clone();
        self.entries.insert(id.clone(), silence);
        Ok(id)
    }

    /// Expire a silence now. Returns false for unknown ids.
    pub fn expire(&self, id: &str) -> bool {
        match self.entries.get_mut(id) {
            Some(mut entry) => {
                entry.ends_at = now_unix();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<Silence> {
        self.entries.get(id).map(|e| e.clone())
    }

    pub fn list(&self) -> Vec<Silence> {
        let mut out: Vec<Silence> = self.entries.iter().map(|e| e.clone()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Whether any active silence mutes the given label set.
    pub fn mutes(&self, labels: &LabelSet, now: i64) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.active_at(now) && entry.matches(labels))
    }

    /// Drop silences expired for longer than the retention period.
    pub fn gc(&self, now: i64) -> usize {
        let cutoff = now - self.retention.as_secs() as i64;
        let before = self.entries.len();
        self.entries
            .retain(|_, s| !(s.ends_at > 0 && s.ends_at < cutoff));
        before - self.entries.len()
    }

    pub fn snapshot(&self) -> Result<(), SilenceError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec(&self.list())?;
        std::fs::write(&self.path, data)?;
        Ok(())
    }

    /// Periodic GC + snapshot until the engine shuts down; a final snapshot
    /// runs on the way out.
    pub async fn maintenance(&self, period: Duration, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let dropped = self.gc(now_unix());
                    if dropped > 0 {
                        tracing::debug!(dropped, "silence gc");
                    }
                    if let Err(e) = self.snapshot() {
                        tracing::warn!(error = %e, "silence snapshot failed");
                    }
                }
            }
        }
        if let Err(e) = self.snapshot() {
            tracing::warn!(error = %e, "final silence snapshot failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>()
    }

    fn silences() -> Silences {
        let dir = tempfile::tempdir().unwrap();
        Silences::open(dir.path().join("silences:u1"), Duration::from_secs(3600)).unwrap()
    }

    fn sample(ends_at: i64) -> Silence {
        Silence {
            id: String::new(),
            matchers: vec![Matcher::eq("alertname", "HighLoad")],
            starts_at: 0,
            ends_at,
            created_by: "ops".into(),
            comment: "maintenance".into(),
        }
    }

    #[test]
    fn eq_matcher() {
        let m = Matcher::eq("alertname", "X");
        assert!(m.matches(&labels(&[("alertname", "X")])));
        assert!(!m.matches(&labels(&[("alertname", "Y")])));
        assert!(!m.matches(&labels(&[("other", "X")])));
    }

    #[test]
    fn regex_matcher_is_anchored() {
        let m = Matcher::re("job", "api.*");
        assert!(m.matches(&labels(&[("job", "api-server")])));
        assert!(!m.matches(&labels(&[("job", "my-api")])));
    }

    #[test]
    fn active_silence_mutes_matching_labels() {
        let s = silences();
        s.set(sample(i64::MAX)).unwrap();
        assert!(s.mutes(&labels(&[("alertname", "HighLoad")]), now_unix()));
        assert!(!s.mutes(&labels(&[("alertname", "Other")]), now_unix()));
    }

    #[test]
    fn expired_silence_does_not_mute() {
        let s = silences();
        let id = s.set(sample(i64::MAX)).unwrap();
        assert!(s.expire(&id));
        assert!(!s.mutes(&labels(&[("alertname", "HighLoad")]), now_unix() + 10));
    }

    #[test]
    fn silence_without_matchers_rejected() {
        let s = silences();
        let mut bad = sample(0);
        bad.matchers.clear();
        assert!(matches!(s.set(bad), Err(SilenceError::NoMatchers)));
    }

    #[test]
    fn gc_respects_retention() {
        let s = silences();
        let mut old = sample(1);
        old.id = "old".into();
        s.set(old).unwrap();
        s.set(sample(i64::MAX)).unwrap();
        assert_eq!(s.gc(now_unix()), 1);
        assert_eq!(s.list().len(), 1);
    }

    #[test]
    fn snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silences:u1");
        let s = Silences::open(path.clone(), Duration::from_secs(3600)).unwrap();
        let id = s.set(sample(i64::MAX)).unwrap();
        s.snapshot().unwrap();

        let reopened = Silences::open(path, Duration::from_secs(3600)).unwrap();
        assert!(reopened.get(&id).is_some());
    }
}
