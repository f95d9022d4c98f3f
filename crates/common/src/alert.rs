use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Label keys are unique, so a sorted map keeps fingerprints stable.
pub type LabelSet = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Firing => "firing",
            AlertStatus::Resolved => "resolved",
        }
    }
}

/// A single alert event. Timestamps are unix seconds, zero means unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub labels: LabelSet,
    #[serde(default)]
    pub annotations: LabelSet,
    #[serde(rename = "startsAt", default)]
    pub starts_at: i64,
    #[serde(rename = "endsAt", default)]
    pub ends_at: i64,
    #[serde(rename = "generatorURL", default)]
    pub generator_url: String,
}

impl Alert {
    pub fn status_at(&self, now: i64) -> AlertStatus {
        if self.ends_at > 0 && self.ends_at <= now {
            AlertStatus::Resolved
        } else {
            AlertStatus::Firing
        }
    }

    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Sha256::new();
        for (k, v) in &self.labels {
            hasher.update(k.as_bytes());
            hasher.update([0x1e]);
            hasher.update(v.as_bytes());
            hasher.update([0x1e]);
        }
        let digest = hasher.finalize();
        u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
    }

    pub fn fingerprint_string(&self) -> String {
        format!("{:016x}", self.fingerprint())
    }
}

/// Status of a homogeneous batch: resolved only if every alert is resolved.
pub fn batch_status(alerts: &[Alert], now: i64) -> AlertStatus {
    if !alerts.is_empty()
        && alerts
            .iter()
            .all(|a| a.status_at(now) == AlertStatus::Resolved)
    {
        AlertStatus::Resolved
    } else {
        AlertStatus::Firing
    }
}
