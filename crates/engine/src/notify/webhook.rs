use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use serde::Serialize;

use alertmux_common::alert::Alert;
use alertmux_common::now_unix;

use super::http;
use super::{Notifier, NotifyContext, NotifyError};
use crate::receivers::{HttpClientConfig, WebhookConfig};
use crate::template::{Renderer, TemplateData};

pub struct WebhookNotifier {
    conf: WebhookConfig,
    http: HttpClientConfig,
    renderer: Arc<Renderer>,
}

impl WebhookNotifier {
    pub fn new(conf: WebhookConfig, http: HttpClientConfig, renderer: Arc<Renderer>) -> Self {
        Self {
            conf,
            http,
            renderer,
        }
    }
}

/// The JSON object sent to generic webhook endpoints.
#[derive(Serialize)]
pub struct WebhookMessage<'a> {
    pub version: &'static str,
    #[serde(rename = "groupKey")]
    pub group_key: &'a str,
    #[serde(flatten)]
    pub data: &'a TemplateData,
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn notify(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<(), NotifyError> {
        let group_key = ctx.require_group_key()?;
        let data = self
            .renderer
            .data(&ctx.receiver_name, &ctx.group_labels, alerts, now_unix());
        let msg = WebhookMessage {
            version: "4",
            group_key,
            data: &data,
        };

        let client = http::build_client(&self.http)?;
        let req = http::apply_auth(
            client
                .post(&self.conf.url)
                .header(CONTENT_TYPE, http::CONTENT_TYPE_JSON)
                .header(USER_AGENT, http::USER_AGENT)
                .json(&msg),
            &self.http,
        );
        let resp = http::send(req, ctx).await?;
        classify(resp.status().as_u16(), &self.conf.url)
    }
}

/// Webhooks answer 2xx on success; 5xx is assumed recoverable, anything
/// else is not.
pub fn classify(status: u16, url: &str) -> Result<(), NotifyError> {
    if status / 100 == 2 {
        return Ok(());
    }
    let message = format!("unexpected status code {status} from {url}");
    if status / 100 == 5 {
        Err(NotifyError::retryable(message))
    } else {
        Err(NotifyError::fatal(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alertmux_common::alert::LabelSet;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn sample_alert() -> Alert {
        let mut labels: LabelSet = BTreeMap::new();
        labels.insert("alertname".into(), "X".into());
        Alert {
            labels,
            annotations: BTreeMap::new(),
            starts_at: 100,
            ends_at: 0,
            generator_url: String::new(),
        }
    }

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

    #[test]
    fn message_body_matches_protocol_version_4() {
        let renderer = Renderer::new("http://am.example.com");
        let context = ctx();
        let data = renderer.data(
            &context.receiver_name,
            &context.group_labels,
            &[sample_alert()],
            1000,
        );
        let msg = WebhookMessage {
            version: "4",
            group_key: &context.group_key,
            data: &data,
        };
        let body = serde_json::to_value(&msg).unwrap();
        assert_eq!(body["version"], "4");
        assert_eq!(body["groupKey"], "g");
        assert_eq!(body["status"], "firing");
        assert_eq!(body["receiver"], "team-x");
        assert_eq!(body["groupLabels"]["alertname"], "X");
        assert_eq!(body["externalURL"], "http://am.example.com");
        assert_eq!(body["alerts"].as_array().unwrap().len(), 1);
        assert_eq!(body["alerts"][0]["status"], "firing");
    }

    #[test]
    fn classifier_accepts_2xx() {
        assert!(classify(200, "u").is_ok());
        assert!(classify(204, "u").is_ok());
    }

    #[test]
    fn classifier_retries_5xx() {
        let err = classify(502, "u").unwrap_err();
        assert!(err.retryable);
    }

    #[test]
    fn classifier_fails_4xx() {
        let err = classify(400, "u").unwrap_err();
        assert!(!err.retryable);
    }
}
