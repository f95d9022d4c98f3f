//! The per-receiver notification pipeline: Inhibit → Silence → Wait →
//! Dedup → Retry → SetNotifies, executed strictly in order. The Retry stage
//! is the only authority on re-invoking an integration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use alertmux_common::alert::{batch_status, Alert, AlertStatus};
use alertmux_common::now_unix;
use alertmux_common::retry::RetryPolicy;

use crate::inhibit::Inhibitor;
use crate::nflog::{hash_alerts, NotificationLog};
use crate::notify::{Integration, NotifyContext, NotifyError};
use crate::silence::Silences;

/// Floor for the per-notification timeout.
pub const MIN_TIMEOUT: Duration = Duration::from_secs(10);

pub type WaitFn = Arc<dyn Fn() -> Duration + Send + Sync>;

#[async_trait]
pub trait Stage: Send + Sync {
    async fn exec(
        &self,
        ctx: &NotifyContext,
        alerts: Vec<Alert>,
    ) -> Result<Vec<Alert>, NotifyError>;
}

pub struct InhibitStage {
    inhibitor: Arc<Inhibitor>,
}

#[async_trait]
impl Stage for InhibitStage {
    async fn exec(
        &self,
        _ctx: &NotifyContext,
        mut alerts: Vec<Alert>,
    ) -> Result<Vec<Alert>, NotifyError> {
        alerts.retain(|a| !self.inhibitor.mutes(&a.labels));
        Ok(alerts)
    }
}

pub struct SilenceStage {
    silences: Arc<Silences>,
}

#[async_trait]
impl Stage for SilenceStage {
    async fn exec(
        &self,
        _ctx: &NotifyContext,
        mut alerts: Vec<Alert>,
    ) -> Result<Vec<Alert>, NotifyError> {
        let now = now_unix();
        alerts.retain(|a| !self.silences.mutes(&a.labels, now));
        Ok(alerts)
    }
}

/// Sleeps this node's cluster wait before the Dedup stage so peers that come
/// earlier in the ordering get to write the notification log first.
pub struct WaitStage {
    wait: WaitFn,
}

#[async_trait]
impl Stage for WaitStage {
    async fn exec(
        &self,
        ctx: &NotifyContext,
        alerts: Vec<Alert>,
    ) -> Result<Vec<Alert>, NotifyError> {
        let delay = (self.wait)();
        if delay.is_zero() {
            return Ok(alerts);
        }
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(NotifyError::fatal("notification cancelled")),
            _ = tokio::time::sleep(delay) => Ok(alerts),
        }
    }
}

pub struct DedupStage {
    nflog: Arc<NotificationLog>,
    integration_id: String,
}

fn entry_hashes(
    entry: Option<&crate::nflog::LogEntry>,
    alerts: &[Alert],
    now: i64,
) -> (u64, u64) {
    let batch_hash = hash_alerts(alerts);
    match batch_status(alerts, now) {
        AlertStatus::Firing => (
            batch_hash,
            entry.map(|e| e.resolved_hash).unwrap_or_default(),
        ),
        AlertStatus::Resolved => (
            entry.map(|e| e.firing_hash).unwrap_or_default(),
            batch_hash,
        ),
    }
}

#[async_trait]
impl Stage for DedupStage {
    async fn exec(
        &self,
        ctx: &NotifyContext,
        alerts: Vec<Alert>,
    ) -> Result<Vec<Alert>, NotifyError> {
        let group_key = ctx.require_group_key()?;
        let now = now_unix();
        let entry = self.nflog.query(group_key, &self.integration_id);
        let (firing_hash, resolved_hash) = entry_hashes(entry.as_ref(), &alerts, now);
        if NotificationLog::needs_update(
            entry.as_ref(),
            firing_hash,
            resolved_hash,
            ctx.repeat_interval,
            now,
        ) {
            Ok(alerts)
        } else {
            Ok(Vec::new())
        }
    }
}

pub struct RetryStage {
    integration: Integration,
    policy: RetryPolicy,
}

#[async_trait]
impl Stage for RetryStage {
    async fn exec(
        &self,
        ctx: &NotifyContext,
        alerts: Vec<Alert>,
    ) -> Result<Vec<Alert>, NotifyError> {
        let mut attempt = 0;
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(NotifyError::fatal("notification cancelled"));
            }
            match self.integration.notify(ctx, &alerts).await {
                Ok(()) => return Ok(alerts),
                Err(e) if e.retryable => {
                    if !self.policy.should_retry(attempt) {
                        return Err(e);
                    }
                    tracing::warn!(
                        integration = %self.integration.id(),
                        error = %e,
                        attempt,
                        "retrying notification"
                    );
                    let delay = self.policy.delay_for_attempt(attempt);
                    attempt += 1;
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => {
                            return Err(NotifyError::fatal(format!(
                                "notification cancelled, last error: {e}"
                            )));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub struct SetNotifiesStage {
    nflog: Arc<NotificationLog>,
    integration_id: String,
}

#[async_trait]
impl Stage for SetNotifiesStage {
    async fn exec(
        &self,
        ctx: &NotifyContext,
        alerts: Vec<Alert>,
    ) -> Result<Vec<Alert>, NotifyError> {
        let group_key = ctx.require_group_key()?;
        let now = now_unix();
        let entry = self.nflog.query(group_key, &self.integration_id);
        let (firing_hash, resolved_hash) = entry_hashes(entry.as_ref(), &alerts, now);
        self.nflog
            .log(group_key, &self.integration_id, firing_hash, resolved_hash);
        Ok(alerts)
    }
}

/// The Wait → Dedup → Retry → SetNotifies chain of one integration.
pub struct IntegrationChain {
    id: String,
    send_resolved: bool,
    stages: Vec<Box<dyn Stage>>,
}

impl IntegrationChain {
    fn new(integration: Integration, nflog: Arc<NotificationLog>, wait: WaitFn) -> Self {
        let id = integration.id();
        let send_resolved = integration.send_resolved();
        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(WaitStage { wait }),
            Box::new(DedupStage {
                nflog: nflog.clone(),
                integration_id: id.clone(),
            }),
            Box::new(RetryStage {
                integration,
                policy: RetryPolicy::default(),
            }),
            Box::new(SetNotifiesStage {
                nflog,
                integration_id: id.clone(),
            }),
        ];
        Self {
            id,
            send_resolved,
            stages,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    async fn exec(&self, ctx: &NotifyContext, mut alerts: Vec<Alert>) -> Result<(), NotifyError> {
        for stage in &self.stages {
            alerts = stage.exec(ctx, alerts).await?;
            if alerts.is_empty() {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// All stages for one receiver: the shared mute stages followed by one
/// chain per integration, executed sequentially.
pub struct ReceiverPipeline {
    mutes: Vec<Box<dyn Stage>>,
    chains: Vec<IntegrationChain>,
}

impl ReceiverPipeline {
    pub fn build(
        integrations: Vec<Integration>,
        inhibitor: Arc<Inhibitor>,
        silences: Arc<Silences>,
        nflog: Arc<NotificationLog>,
        wait: WaitFn,
    ) -> Self {
        let mutes: Vec<Box<dyn Stage>> = vec![
            Box::new(InhibitStage { inhibitor }),
            Box::new(SilenceStage { silences }),
        ];
        let chains = integrations
            .into_iter()
            .map(|integration| IntegrationChain::new(integration, nflog.clone(), wait.clone()))
            .collect();
        Self { mutes, chains }
    }

    /// Run one homogeneous batch through the pipeline, returning per-
    /// integration failures.
    pub async fn exec(
        &self,
        ctx: &NotifyContext,
        alerts: Vec<Alert>,
    ) -> Vec<(String, NotifyError)> {
        let mut alerts = alerts;
        for stage in &self.mutes {
            match stage.exec(ctx, alerts).await {
                Ok(remaining) => alerts = remaining,
                Err(e) => return vec![("mute".to_string(), e)],
            }
            if alerts.is_empty() {
                return Vec::new();
            }
        }

        let status = batch_status(&alerts, now_unix());
        let mut failures = Vec::new();
        for chain in &self.chains {
            if status == AlertStatus::Resolved && !chain.send_resolved {
                continue;
            }
            if let Err(e) = chain.exec(ctx, alerts.clone()).await {
                failures.push((chain.id.clone(), e));
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Notifier;
    use alertmux_common::alert::LabelSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio_util::sync::CancellationToken;

    struct FlakyNotifier {
        calls: Arc<AtomicU32>,
        failures: u32,
        retryable: bool,
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn notify(&self, _ctx: &NotifyContext, _alerts: &[Alert]) -> Result<(), NotifyError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                if self.retryable {
                    Err(NotifyError::retryable(format!("fail #{}", call + 1)))
                } else {
                    Err(NotifyError::fatal(format!("fail #{}", call + 1)))
                }
            } else {
                Ok(())
            }
        }
    }

    struct RecordingNotifier {
        seen: Arc<StdMutex<Vec<usize>>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn notify(&self, _ctx: &NotifyContext, alerts: &[Alert]) -> Result<(), NotifyError> {
            self.seen.lock().unwrap().push(alerts.len());
            Ok(())
        }
    }

    fn ctx() -> NotifyContext {
        let mut group_labels = LabelSet::new();
        group_labels.insert("alertname".into(), "X".into());
        NotifyContext {
            group_key: "g".into(),
            receiver_name: "team-x".into(),
            group_labels,
            repeat_interval: Duration::from_secs(3600),
            cancel: CancellationToken::new(),
        }
    }

    fn alert(name: &str, ends_at: i64) -> Alert {
        let mut labels = LabelSet::new();
        labels.insert("alertname".into(), name.into());
        Alert {
            labels,
            annotations: LabelSet::new(),
            starts_at: 100,
            ends_at,
            generator_url: String::new(),
        }
    }

    fn fast_policy(max: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: Some(max),
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_factor: 0.0,
        }
    }

    fn nflog() -> Arc<NotificationLog> {
        let dir = tempfile::tempdir().unwrap();
        Arc::new(
            NotificationLog::open(dir.path().join("nflog:u1"), Duration::from_secs(3600)).unwrap(),
        )
    }

    fn integration(notifier: Box<dyn Notifier>) -> Integration {
        Integration::new("webhook", 0, true, notifier)
    }

    #[tokio::test]
    async fn retry_stage_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let stage = RetryStage {
            integration: integration(Box::new(FlakyNotifier {
                calls: calls.clone(),
                failures: 2,
                retryable: true,
            })),
            policy: fast_policy(5),
        };
        let out = stage.exec(&ctx(), vec![alert("X", 0)]).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_stage_surfaces_fatal_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let stage = RetryStage {
            integration: integration(Box::new(FlakyNotifier {
                calls: calls.clone(),
                failures: 10,
                retryable: false,
            })),
            policy: fast_policy(5),
        };
        assert!(stage.exec(&ctx(), vec![alert("X", 0)]).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_stage_stops_on_cancellation() {
        let calls = Arc::new(AtomicU32::new(0));
        let stage = RetryStage {
            integration: integration(Box::new(FlakyNotifier {
                calls,
                failures: u32::MAX,
                retryable: true,
            })),
            policy: RetryPolicy {
                max_attempts: None,
                base_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(60),
                jitter_factor: 0.0,
            },
        };
        let context = ctx();
        let cancel = context.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let err = stage.exec(&context, vec![alert("X", 0)]).await.unwrap_err();
        assert!(!err.retryable);
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn dedup_drops_already_notified_batches() {
        let log = nflog();
        let context = ctx();
        let batch = vec![alert("X", 0)];

        let dedup = DedupStage {
            nflog: log.clone(),
            integration_id: "webhook[0]".into(),
        };
        let first = dedup.exec(&context, batch.clone()).await.unwrap();
        assert_eq!(first.len(), 1);

        let set = SetNotifiesStage {
            nflog: log.clone(),
            integration_id: "webhook[0]".into(),
        };
        set.exec(&context, batch.clone()).await.unwrap();

        let second = dedup.exec(&context, batch.clone()).await.unwrap();
        assert!(second.is_empty());

        // A changed alert set goes out again.
        let changed = vec![alert("X", 0), alert("Y", 0)];
        let third = dedup.exec(&context, changed).await.unwrap();
        assert_eq!(third.len(), 2);
    }

    #[tokio::test]
    async fn resolved_batch_dedup_is_independent_of_firing_hash() {
        let log = nflog();
        let context = ctx();
        let set = SetNotifiesStage {
            nflog: log.clone(),
            integration_id: "webhook[0]".into(),
        };
        set.exec(&context, vec![alert("X", 0)]).await.unwrap();

        let dedup = DedupStage {
            nflog: log,
            integration_id: "webhook[0]".into(),
        };
        let resolved = dedup.exec(&context, vec![alert("X", 50)]).await.unwrap();
        assert_eq!(resolved.len(), 1);
    }

    #[tokio::test]
    async fn pipeline_skips_resolved_for_send_resolved_false() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(
            NotificationLog::open(dir.path().join("nflog"), Duration::from_secs(3600)).unwrap(),
        );
        let store = Arc::new(crate::store::AlertStore::new(Duration::from_secs(1800)));
        let inhibitor = Arc::new(Inhibitor::new(&[], store));
        let silences = Arc::new(
            Silences::open(dir.path().join("silences"), Duration::from_secs(3600)).unwrap(),
        );
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let integration = Integration::new(
            "webhook",
            0,
            false,
            Box::new(RecordingNotifier { seen: seen.clone() }),
        );
        let pipeline = ReceiverPipeline::build(
            vec![integration],
            inhibitor,
            silences,
            log,
            Arc::new(|| Duration::ZERO),
        );

        let failures = pipeline.exec(&ctx(), vec![alert("X", 50)]).await;
        assert!(failures.is_empty());
        assert!(seen.lock().unwrap().is_empty());

        let failures = pipeline.exec(&ctx(), vec![alert("X", 0)]).await;
        assert!(failures.is_empty());
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn wait_stage_applies_delay() {
        let stage = WaitStage {
            wait: Arc::new(|| Duration::from_millis(30)),
        };
        let started = std::time::Instant::now();
        stage.exec(&ctx(), vec![alert("X", 0)]).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
