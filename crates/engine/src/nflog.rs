//! Notification log: the record that a receiver was already notified about a
//! group with a given alert-set hash. Backs the Dedup stage and is snapshot
//! to `{data_dir}/nflog:{user}`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use alertmux_common::alert::Alert;
use alertmux_common::now_unix;

#[derive(Debug, Error)]
pub enum NflogError {
    #[error("snapshot io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub group_key: String,
    pub receiver: String,
    pub firing_hash: u64,
    pub resolved_hash: u64,
    pub updated_at: i64,
}

/// Stable hash over the fingerprints of an alert batch.
pub fn hash_alerts(alerts: &[Alert]) -> u64 {
    let mut fingerprints: Vec<u64> = alerts.iter().map(Alert::fingerprint).collect();
    fingerprints.sort_unstable();
    let mut hasher = Sha256::new();
    for fp in fingerprints {
        hasher.update(fp.to_be_bytes());
    }
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

pub struct NotificationLog {
    entries: Mutex<HashMap<(String, String), LogEntry>>,
    path: PathBuf,
    retention: Duration,
    broadcast: Mutex<Option<broadcast::Sender<Vec<u8>>>>,
}

impl NotificationLog {
    pub fn open(path: PathBuf, retention: Duration) -> Result<Self, NflogError> {
        let mut entries = HashMap::new();
        match std::fs::read(&path) {
            Ok(raw) => {
                let loaded: Vec<LogEntry> = serde_json::from_slice(&raw)?;
                for entry in loaded {
                    entries.insert((entry.group_key.clone(), entry.receiver.clone()), entry);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self {
            entries: Mutex::new(entries),
            path,
            retention,
            broadcast: Mutex::new(None),
        })
    }

    /// Replicate log writes to cluster peers through the given channel.
    pub fn set_broadcast(&self, tx: broadcast::Sender<Vec<u8>>) {
        *self.broadcast.lock().expect("nflog lock poisoned") = Some(tx);
    }

    pub fn query(&self, group_key: &str, receiver: &str) -> Option<LogEntry> {
        self.entries
            .lock()
            .expect("nflog lock poisoned")
            .get(&(group_key.to_string(), receiver.to_string()))
            .cloned()
    }

    pub fn log(&self, group_key: &str, receiver: &str, firing_hash: u64, resolved_hash: u64) {
        let entry = LogEntry {
            group_key: group_key.to_string(),
            receiver: receiver.to_string(),
            firing_hash,
            resolved_hash,
            updated_at: now_unix(),
        };
        self.entries
            .lock()
            .expect("nflog lock poisoned")
            .insert((entry.group_key.clone(), entry.receiver.clone()), entry.clone());
        let broadcast = self.broadcast.lock().expect("nflog lock poisoned");
        if let Some(tx) = &*broadcast {
            if let Ok(encoded) = serde_json::to_vec(&entry) {
                let _ = tx.send(encoded);
            }
        }
    }

    /// Whether a notification still has to go out given the prior entry.
    pub fn needs_update(
        entry: Option<&LogEntry>,
        firing_hash: u64,
        resolved_hash: u64,
        repeat_interval: Duration,
        now: i64,
    ) -> bool {
        match entry {
            None => true,
            Some(entry) => {
                entry.firing_hash != firing_hash
                    || entry.resolved_hash != resolved_hash
                    || now >= entry.updated_at + repeat_interval.as_secs() as i64
            }
        }
    }

    pub fn gc(&self, now: i64) -> usize {
        let cutoff = now - self.retention.as_secs() as i64;
        let mut entries = self.entries.lock().expect("nflog lock poisoned");
        let before = entries.len();
        entries.retain(|_, e| e.updated_at >= cutoff);
        before - entries.len()
    }

    pub fn snapshot(&self) -> Result<(), NflogError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let entries: Vec<LogEntry> = {
            let guard = self.entries.lock().expect("nflog lock poisoned");
            guard.values().cloned().collect()
        };
        std::fs::write(&self.path, serde_json::to_vec(&entries)?)?;
        Ok(())
    }

    pub async fn maintenance(&self, period: Duration, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let dropped = self.gc(now_unix());
                    if dropped > 0 {
                        tracing::debug!(dropped, "notification log gc");
                    }
                    if let Err(e) = self.snapshot() {
                        tracing::warn!(error = %e, "notification log snapshot failed");
                    }
                }
            }
        }
        if let Err(e) = self.snapshot() {
            tracing::warn!(error = %e, "final notification log snapshot failed");
        }
    }
}
