use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use alertmux_common::alert::{batch_status, Alert, AlertStatus};
use alertmux_common::now_unix;
use alertmux_common::text::sha256hex;

use super::http;
use super::{Notifier, NotifyContext, NotifyError};
use crate::receivers::{HttpClientConfig, PagerdutyConfig};
use crate::template::Renderer;

const API_V1_URL: &str = "https://events.pagerduty.com/generic/2010-04-15/create_event.json";

const EVENT_TRIGGER: &str = "trigger";
const EVENT_RESOLVE: &str = "resolve";

const SUMMARY_LIMIT: usize = 1024;

pub struct PagerdutyNotifier {
    conf: PagerdutyConfig,
    http: HttpClientConfig,
    renderer: Arc<Renderer>,
    /// Set when `service_key` selects the legacy v1 events API.
    api_v1: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct PagerdutyMessage {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub routing_key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub service_key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dedup_key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub incident_key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub event_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub event_action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<PagerdutyPayload>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_url: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<PagerdutyImageMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<PagerdutyLinkMessage>,
}

#[derive(Debug, Serialize)]
pub struct PagerdutyPayload {
    pub summary: String,
    pub source: String,
    pub severity: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub class: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub component: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_details: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct PagerdutyImageMessage {
    pub src: String,
    pub alt: String,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct PagerdutyLinkMessage {
    pub href: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct PagerdutyApiResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl PagerdutyNotifier {
    pub fn new(conf: PagerdutyConfig, http: HttpClientConfig, renderer: Arc<Renderer>) -> Self {
        let api_v1 = if conf.service_key.is_empty() {
            None
        } else {
            Some(API_V1_URL.to_string())
        };
        Self {
            conf,
            http,
            renderer,
            api_v1,
        }
    }

    fn event_type(&self, alerts: &[Alert]) -> &'static str {
        match batch_status(alerts, now_unix()) {
            AlertStatus::Resolved => EVENT_RESOLVE,
            AlertStatus::Firing => EVENT_TRIGGER,
        }
    }

    fn build_v1_message(
        &self,
        ctx: &NotifyContext,
        alerts: &[Alert],
        event_type: &str,
    ) -> Result<PagerdutyMessage, NotifyError> {
        let key = ctx.require_group_key()?;
        let data = self
            .renderer
            .data(&ctx.receiver_name, &ctx.group_labels, alerts, now_unix());
        let mut tmpl = self.renderer.latched(&data);

        let mut details = BTreeMap::new();
        for (k, v) in &self.conf.details {
            details.insert(k.clone(), tmpl.text(v));
        }

        let mut msg = PagerdutyMessage {
            service_key: tmpl.text(&self.conf.service_key),
            event_type: event_type.to_string(),
            incident_key: sha256hex(key),
            description: tmpl.text(&self.conf.description),
            details,
            ..Default::default()
        };
        if event_type == EVENT_TRIGGER {
            msg.client = tmpl.text(&self.conf.client);
            msg.client_url = tmpl.text(&self.conf.client_url);
        }
        tmpl.finish()?;
        Ok(msg)
    }

    fn build_v2_message(
        &self,
        ctx: &NotifyContext,
        alerts: &[Alert],
        event_action: &str,
    ) -> Result<PagerdutyMessage, NotifyError> {
        let key = ctx.require_group_key()?;
        let data = self
            .renderer
            .data(&ctx.receiver_name, &ctx.group_labels, alerts, now_unix());
        let mut tmpl = self.renderer.latched(&data);

        let severity = if self.conf.severity.is_empty() {
            "error".to_string()
        } else {
            tmpl.text(&self.conf.severity)
        };

        let mut summary = tmpl.text(&self.conf.description);
        if summary.chars().count() > SUMMARY_LIMIT {
            summary = summary.chars().take(SUMMARY_LIMIT - 6).collect::<String>() + " [...]";
        }

        let mut details = BTreeMap::new();
        for (k, v) in &self.conf.details {
            details.insert(k.clone(), tmpl.text(v));
        }

        let msg = PagerdutyMessage {
            routing_key: tmpl.text(&self.conf.routing_key),
            event_action: event_action.to_string(),
            dedup_key: sha256hex(key),
            client: tmpl.text(&self.conf.client),
            client_url: tmpl.text(&self.conf.client_url),
            images: self
                .conf
                .images
                .iter()
                .map(|img| PagerdutyImageMessage {
                    src: tmpl.text(&img.src),
                    alt: tmpl.text(&img.alt),
                    text: tmpl.text(&img.text),
                })
                .collect(),
            links: self
                .conf
                .links
                .iter()
                .map(|link| PagerdutyLinkMessage {
                    href: tmpl.text(&link.href),
                    text: tmpl.text(&link.text),
                })
                .collect(),
            payload: Some(PagerdutyPayload {
                summary,
                source: tmpl.text(&self.conf.client),
                severity,
                class: tmpl.text(&self.conf.class),
                component: tmpl.text(&self.conf.component),
                group: tmpl.text(&self.conf.group),
                custom_details: details,
            }),
            ..Default::default()
        };
        tmpl.finish()?;
        Ok(msg)
    }
}

#[async_trait]
impl Notifier for PagerdutyNotifier {
    fn name(&self) -> &'static str {
        "pagerduty"
    }

    async fn notify(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<(), NotifyError> {
        let event_type = self.event_type(alerts);
        let client = http::build_client(&self.http)?;

        match &self.api_v1 {
            Some(url) => {
                let msg = self.build_v1_message(ctx, alerts, event_type)?;
                let resp = http::post_json(&client, url, &self.http, &msg, ctx).await?;
                let status = resp.status().as_u16();
                let body = resp.json::<PagerdutyApiResponse>().await.ok();
                classify_v1(status, body.as_ref())
            }
            None => {
                let msg = self.build_v2_message(ctx, alerts, event_type)?;
                let resp =
                    http::post_json(&client, &self.conf.url, &self.http, &msg, ctx).await?;
                let status = resp.status().as_u16();
                let body = resp.json::<PagerdutyApiResponse>().await.ok();
                classify_v2(status, body.as_ref())
            }
        }
    }
}

fn api_error(status: u16, body: Option<&PagerdutyApiResponse>) -> String {
    if status == 400 {
        if let Some(body) = body {
            return format!("{}: {}", body.message, body.errors.join(","));
        }
    }
    format!("unexpected status code: {status}")
}

/// The v1 events API recovers on 403 (rate limiting) and 5xx.
pub fn classify_v1(status: u16, body: Option<&PagerdutyApiResponse>) -> Result<(), NotifyError> {
    if status / 100 == 2 {
        return Ok(());
    }
    let message = api_error(status, body);
    if status == 403 || status / 100 == 5 {
        Err(NotifyError::retryable(message))
    } else {
        Err(NotifyError::fatal(message))
    }
}

/// The v2 events API recovers on 429 (rate limiting) and 5xx.
pub fn classify_v2(status: u16, body: Option<&PagerdutyApiResponse>) -> Result<(), NotifyError> {
    if status / 100 == 2 {
        return Ok(());
    }
    let message = api_error(status, body);
    if status == 429 || status / 100 == 5 {
        Err(NotifyError::retryable(message))
    } else {
        Err(NotifyError::fatal(message))
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
            group_key: "grp".into(),
            receiver_name: "team-x".into(),
            group_labels,
            repeat_interval: Duration::from_secs(60),
            cancel: CancellationToken::new(),
        }
    }

    fn resolved_alert() -> Alert {
        let mut labels = LabelSet::new();
        labels.insert("alertname".into(), "X".into());
        Alert {
            labels,
            annotations: LabelSet::new(),
            starts_at: 100,
            ends_at: 200,
            generator_url: String::new(),
        }
    }

    fn notifier(conf: PagerdutyConfig) -> PagerdutyNotifier {
        PagerdutyNotifier::new(
            conf,
            HttpClientConfig::default(),
            Arc::new(Renderer::new("http://am.example.com")),
        )
    }

    fn v2_conf() -> PagerdutyConfig {
        serde_yaml::from_str("routing_key: rk\nurl: https://events.pagerduty.com/v2/enqueue\n")
            .unwrap()
    }

    #[test]
    fn service_key_selects_v1() {
        let n = notifier(serde_yaml::from_str("service_key: sk\n").unwrap());
        assert!(n.api_v1.is_some());
        let n = notifier(v2_conf());
        assert!(n.api_v1.is_none());
    }

    #[test]
    fn v2_resolve_message_has_hashed_dedup_key() {
        let n = notifier(v2_conf());
        let msg = n
            .build_v2_message(&ctx(), &[resolved_alert()], EVENT_RESOLVE)
            .unwrap();
        assert_eq!(msg.event_action, "resolve");
        assert_eq!(msg.dedup_key, sha256hex("grp"));
        assert_eq!(msg.payload.as_ref().unwrap().severity, "error");
    }

    #[test]
    fn v2_summary_truncated_to_1024_runes() {
        let mut conf = v2_conf();
        conf.description = "x".repeat(1500);
        let n = notifier(conf);
        let msg = n
            .build_v2_message(&ctx(), &[resolved_alert()], EVENT_RESOLVE)
            .unwrap();
        let summary = &msg.payload.unwrap().summary;
        assert_eq!(summary.chars().count(), 1024);
        assert!(summary.ends_with(" [...]"));
    }

    #[test]
    fn v1_trigger_hashes_incident_key_and_keeps_client() {
        let mut conf: PagerdutyConfig = serde_yaml::from_str("service_key: sk\n").unwrap();
        conf.client = "client".into();
        conf.client_url = "http://client".into();
        let n = notifier(conf);
        let msg = n
            .build_v1_message(&ctx(), &[resolved_alert()], EVENT_TRIGGER)
            .unwrap();
        assert_eq!(msg.incident_key, sha256hex("grp"));
        assert_eq!(msg.event_type, "trigger");
        assert_eq!(msg.client, "client");
    }

    #[test]
    fn v1_resolve_omits_client() {
        let n = notifier(serde_yaml::from_str("service_key: sk\nclient: c\n").unwrap());
        let msg = n
            .build_v1_message(&ctx(), &[resolved_alert()], EVENT_RESOLVE)
            .unwrap();
        assert!(msg.client.is_empty());
    }

    #[test]
    fn v1_classifier() {
        assert!(classify_v1(202, None).is_ok());
        assert!(classify_v1(403, None).unwrap_err().retryable);
        assert!(classify_v1(502, None).unwrap_err().retryable);
        assert!(!classify_v1(429, None).unwrap_err().retryable);
    }

    #[test]
    fn v2_classifier() {
        assert!(classify_v2(202, None).is_ok());
        assert!(classify_v2(429, None).unwrap_err().retryable);
        assert!(classify_v2(500, None).unwrap_err().retryable);
        assert!(!classify_v2(403, None).unwrap_err().retryable);
    }

    #[test]
    fn bad_request_surfaces_api_errors() {
        let body = PagerdutyApiResponse {
            status: "invalid event".into(),
            message: "Event object is invalid".into(),
            errors: vec!["Length of 'routing_key' is invalid".into()],
        };
        let err = classify_v2(400, Some(&body)).unwrap_err();
        assert!(!err.retryable);
        assert!(err.to_string().contains("Event object is invalid"));
        assert!(err.to_string().contains("routing_key"));
    }

    #[test]
    fn template_failure_is_fatal() {
        let mut conf = v2_conf();
        conf.description = "{{#each}}".into();
        let n = notifier(conf);
        let err = n
            .build_v2_message(&ctx(), &[resolved_alert()], EVENT_RESOLVE)
            .unwrap_err();
        assert!(!err.retryable);
    }
}
