//! In-memory alert provider. Holds the current alert set for one tenant and
//! fans new arrivals out to the dispatcher and inhibitor.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use alertmux_common::alert::{Alert, AlertStatus};
use alertmux_common::now_unix;

const SUBSCRIBER_BUFFER: usize = 512;

pub struct AlertStore {
    alerts: Mutex<HashMap<u64, Alert>>,
    tx: broadcast::Sender<Alert>,
    retention: Duration,
}

impl AlertStore {
    pub fn new(retention: Duration) -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            alerts: Mutex::new(HashMap::new()),
            tx,
            retention,
        }
    }

    /// Insert or merge an alert and notify subscribers. Merging keeps the
    /// earliest start and the latest end for the same fingerprint.
    pub fn put(&self, mut alert: Alert) {
        if alert.starts_at == 0 {
            alert.starts_at = now_unix();
        }
        let fingerprint = alert.fingerprint();
        {
            let mut alerts = self.alerts.lock().expect("alert store lock poisoned");
            if let Some(existing) = alerts.get(&fingerprint) {
                if existing.starts_at > 0 && existing.starts_at < alert.starts_at {
                    alert.starts_at = existing.starts_at;
                }
                if alert.ends_at == 0 && existing.ends_at > alert.ends_at {
                    alert.ends_at = existing.ends_at;
                }
            }
            alerts.insert(fingerprint, alert.clone());
        }
        // Nobody listening yet is fine.
        let _ = self.tx.send(alert);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.tx.subscribe()
    }

    pub fn list(&self) -> Vec<Alert> {
        let mut out: Vec<Alert> = self
            .alerts
            .lock()
            .expect("alert store lock poisoned")
            .values()
            .cloned()
            .collect();
        out.sort_by_key(|a| a.fingerprint());
        out
    }

    pub fn firing(&self, now: i64) -> Vec<Alert> {
        self.list()
            .into_iter()
            .filter(|a| a.status_at(now) == AlertStatus::Firing)
            .collect()
    }

    /// Drop resolved alerts older than the retention window.
    pub fn gc(&self, now: i64) -> usize {
        let cutoff = now - self.retention.as_secs() as i64;
        let mut alerts = self.alerts.lock().expect("alert store lock poisoned");
        let before = alerts.len();
        alerts.retain(|_, a| !(a.ends_at > 0 && a.ends_at < cutoff));
        before - alerts.len()
    }

    pub async fn run_gc(&self, period: Duration, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let dropped = self.gc(now_unix());
                    if dropped > 0 {
                        tracing::debug!(dropped, "alert store gc");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alertmux_common::alert::LabelSet;

    fn alert(name: &str, starts_at: i64, ends_at: i64) -> Alert {
        let mut labels = LabelSet::new();
        labels.insert("alertname".into(), name.into());
        Alert {
            labels,
            annotations: LabelSet::new(),
            starts_at,
            ends_at,
            generator_url: String::new(),
        }
    }

    #[test]
    fn put_assigns_start_time() {
        let store = AlertStore::new(Duration::from_secs(1800));
        store.put(alert("X", 0, 0));
        assert!(store.list()[0].starts_at > 0);
    }

    #[test]
    fn merge_keeps_earliest_start() {
        let store = AlertStore::new(Duration::from_secs(1800));
        store.put(alert("X", 100, 0));
        store.put(alert("X", 200, 0));
        let listed = store.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].starts_at, 100);
    }

    #[test]
    fn firing_excludes_resolved() {
        let store = AlertStore::new(Duration::from_secs(1800));
        store.put(alert("X", 100, 0));
        store.put(alert("Y", 100, 200));
        let firing = store.firing(1000);
        assert_eq!(firing.len(), 1);
        assert_eq!(firing[0].labels["alertname"], "X");
    }

    #[test]
    fn gc_drops_old_resolved_alerts() {
        let store = AlertStore::new(Duration::from_secs(100));
        store.put(alert("X", 1, 10));
        store.put(alert("Y", 1, 0));
        assert_eq!(store.gc(1000), 1);
        assert_eq!(store.list().len(), 1);
    }

    #[tokio::test]
    async fn subscribers_see_new_alerts() {
        let store = AlertStore::new(Duration::from_secs(1800));
        let mut rx = store.subscribe();
        store.put(alert("X", 100, 0));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.labels["alertname"], "X");
    }
}
