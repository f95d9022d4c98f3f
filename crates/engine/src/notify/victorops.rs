use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use alertmux_common::alert::{batch_status, Alert, AlertStatus};
use alertmux_common::text::{sha256hex, truncate};
use alertmux_common::now_unix;

use super::http;
use super::{Notifier, NotifyContext, NotifyError};
use crate::receivers::{HttpClientConfig, VictorOpsConfig};
use crate::template::Renderer;

const EVENT_TRIGGER: &str = "CRITICAL";
const EVENT_RESOLVE: &str = "RECOVERY";

const STATE_MESSAGE_LIMIT: usize = 20480;

const ALLOWED_EVENTS: [&str; 3] = ["INFO", "WARNING", "CRITICAL"];

pub struct VictorOpsNotifier {
    conf: VictorOpsConfig,
    http: HttpClientConfig,
    renderer: Arc<Renderer>,
}

impl VictorOpsNotifier {
    pub fn new(conf: VictorOpsConfig, http: HttpClientConfig, renderer: Arc<Renderer>) -> Self {
        Self {
            conf,
            http,
            renderer,
        }
    }

    fn build_payload(
        &self,
        ctx: &NotifyContext,
        alerts: &[Alert],
    ) -> Result<(String, BTreeMap<String, String>), NotifyError> {
        let key = ctx.require_group_key()?;
        let status = batch_status(alerts, now_unix());
        let data = self
            .renderer
            .data(&ctx.receiver_name, &ctx.group_labels, alerts, now_unix());
        let mut tmpl = self.renderer.latched(&data);

        let mut message_type = tmpl.text(&self.conf.message_type);
        if status == AlertStatus::Firing && !ALLOWED_EVENTS.contains(&message_type.as_str()) {
            message_type = EVENT_TRIGGER.to_string();
        }
        if status == AlertStatus::Resolved {
            message_type = EVENT_RESOLVE.to_string();
        }

        let (state_message, _) = truncate(&tmpl.text(&self.conf.state_message), STATE_MESSAGE_LIMIT);

        let mut msg = BTreeMap::new();
        msg.insert("message_type".to_string(), message_type);
        msg.insert("entity_id".to_string(), sha256hex(key));
        msg.insert(
            "entity_display_name".to_string(),
            tmpl.text(&self.conf.entity_display_name),
        );
        msg.insert("state_message".to_string(), state_message);
        msg.insert(
            "monitoring_tool".to_string(),
            tmpl.text(&self.conf.monitoring_tool),
        );
        for (k, v) in &self.conf.custom_fields {
            msg.insert(k.clone(), tmpl.text(v));
        }

        let routing_key = tmpl.text(&self.conf.routing_key);
        tmpl.finish()?;

        let api_url = format!(
            "{}{}/{}",
            self.conf.api_url, self.conf.api_key, routing_key
        );
        Ok((api_url, msg))
    }
}

#[async_trait]
impl Notifier for VictorOpsNotifier {
    fn name(&self) -> &'static str {
        "victorops"
    }

    async fn notify(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<(), NotifyError> {
        let (api_url, msg) = self.build_payload(ctx, alerts)?;
        let client = http::build_client(&self.http)?;
        let resp = http::post_json(&client, &api_url, &self.http, &msg, ctx).await?;
        classify(resp.status().as_u16())
    }
}

/// VictorOps documents nothing here; only 5xx is assumed recoverable.
pub fn classify(status: u16) -> Result<(), NotifyError> {
    let message = format!("unexpected status code {status}");
    if status / 100 == 5 {
        Err(NotifyError::retryable(message))
    } else if status / 100 != 2 {
        Err(NotifyError::fatal(message))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alertmux_common::alert::LabelSet;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> NotifyContext {
        let mut group_labels = LabelSet::new();
        group_labels.insert("alertname".into(), "X".into());
        NotifyContext {
            group_key: "g".into(),
            receiver_name: "team-x".into(),
            group_labels,
            repeat_interval: Duration::from_secs(60),
            cancel: CancellationToken::new(),
        }
    }

    fn alert(ends_at: i64) -> Alert {
        let mut labels = LabelSet::new();
        labels.insert("alertname".into(), "X".into());
        Alert {
            labels,
            annotations: LabelSet::new(),
            starts_at: 100,
            ends_at,
            generator_url: String::new(),
        }
    }

    fn notifier(yaml: &str) -> VictorOpsNotifier {
        VictorOpsNotifier::new(
            serde_yaml::from_str(yaml).unwrap(),
            HttpClientConfig::default(),
            Arc::new(Renderer::new("")),
        )
    }

    const BASE: &str = "api_key: key\nrouting_key: ops\napi_url: https://alert.victorops.com/integrations/generic/20131114/alert/\n";

    #[test]
    fn url_joins_api_key_and_routing_key() {
        let n = notifier(BASE);
        let (url, _) = n.build_payload(&ctx(), &[alert(0)]).unwrap();
        assert_eq!(
            url,
            "https://alert.victorops.com/integrations/generic/20131114/alert/key/ops"
        );
    }

    #[test]
    fn firing_defaults_to_critical() {
        let n = notifier(BASE);
        let (_, msg) = n.build_payload(&ctx(), &[alert(0)]).unwrap();
        assert_eq!(msg["message_type"], "CRITICAL");
        assert_eq!(msg["entity_id"], sha256hex("g"));
    }

    #[test]
    fn unknown_firing_type_coerced_to_critical() {
        let n = notifier(&format!("{BASE}message_type: BOGUS\n"));
        let (_, msg) = n.build_payload(&ctx(), &[alert(0)]).unwrap();
        assert_eq!(msg["message_type"], "CRITICAL");
    }

    #[test]
    fn allowed_firing_type_kept() {
        let n = notifier(&format!("{BASE}message_type: WARNING\n"));
        let (_, msg) = n.build_payload(&ctx(), &[alert(0)]).unwrap();
        assert_eq!(msg["message_type"], "WARNING");
    }

    #[test]
    fn resolved_becomes_recovery() {
        let n = notifier(&format!("{BASE}message_type: WARNING\n"));
        let (_, msg) = n.build_payload(&ctx(), &[alert(50)]).unwrap();
        assert_eq!(msg["message_type"], "RECOVERY");
    }

    #[test]
    fn custom_fields_merged() {
        let n = notifier(&format!("{BASE}custom_fields:\n  region: us-east-1\n"));
        let (_, msg) = n.build_payload(&ctx(), &[alert(0)]).unwrap();
        assert_eq!(msg["region"], "us-east-1");
    }

    #[test]
    fn state_message_truncated() {
        let n = notifier(&format!("{BASE}state_message: '{}'\n", "x".repeat(30000)));
        let (_, msg) = n.build_payload(&ctx(), &[alert(0)]).unwrap();
        assert_eq!(msg["state_message"].chars().count(), STATE_MESSAGE_LIMIT);
    }

    #[test]
    fn classifier() {
        assert!(classify(200).is_ok());
        assert!(classify(500).unwrap_err().retryable);
        assert!(!classify(429).unwrap_err().retryable);
        assert!(!classify(400).unwrap_err().retryable);
    }
}
