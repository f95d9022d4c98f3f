//! Receiver integrations: templating, per-provider message construction,
//! transport, and the retry classification consulted by the pipeline.

pub mod email;
pub mod hipchat;
pub(crate) mod http;
pub mod opsgenie;
pub mod pagerduty;
pub mod pushover;
pub mod slack;
pub mod victorops;
pub mod webhook;
pub mod wechat;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use alertmux_common::alert::{Alert, LabelSet};

use crate::config::{ConfigError, GlobalConfig};
use crate::receivers::{HttpClientConfig, Receiver};
use crate::template::Renderer;

/// Group context handed to every integration by the dispatcher. The HTTP
/// request of a notification aborts when `cancel` fires.
#[derive(Clone)]
pub struct NotifyContext {
    pub group_key: String,
    pub receiver_name: String,
    pub group_labels: LabelSet,
    pub repeat_interval: Duration,
    pub cancel: CancellationToken,
}

impl NotifyContext {
    /// Missing group keys are a programmer error, never retried.
    pub fn require_group_key(&self) -> Result<&str, NotifyError> {
        if self.group_key.is_empty() {
            return Err(NotifyError::fatal("group key missing"));
        }
        Ok(&self.group_key)
    }
}

/// A notification failure plus the hint the Retry stage consults.
#[derive(Debug)]
pub struct NotifyError {
    pub retryable: bool,
    message: String,
}

impl NotifyError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notify: {}", self.message)
    }
}

impl std::error::Error for NotifyError {}

impl From<crate::template::TemplateError> for NotifyError {
    fn from(e: crate::template::TemplateError) -> Self {
        // Template errors never resolve on their own.
        NotifyError::fatal(e.to_string())
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;
    async fn notify(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<(), NotifyError>;
}

/// A notifier paired with its stable identity from the receiver config.
pub struct Integration {
    name: &'static str,
    index: usize,
    send_resolved: bool,
    notifier: Box<dyn Notifier>,
}

impl std::fmt::Debug for Integration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Integration")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("send_resolved", &self.send_resolved)
            .finish()
    }
}

impl Integration {
    pub fn new(
        name: &'static str,
        index: usize,
        send_resolved: bool,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        Self {
            name,
            index,
            send_resolved,
            notifier,
        }
    }

    pub fn id(&self) -> String {
        format!("{}[{}]", self.name, self.index)
    }

    pub fn send_resolved(&self) -> bool {
        self.send_resolved
    }

    pub async fn notify(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<(), NotifyError> {
        self.notifier.notify(ctx, alerts).await
    }
}

fn resolved_http(conf: &Option<HttpClientConfig>, global: &GlobalConfig) -> HttpClientConfig {
    conf.clone().unwrap_or_else(|| global.http_config.clone())
}

fn require(
    receiver: &str,
    field: &'static str,
    value: &str,
) -> Result<String, ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::MissingField {
            receiver: receiver.to_string(),
            field,
        });
    }
    Ok(value.to_string())
}

fn fallback(local: &str, global: &str) -> String {
    if local.is_empty() {
        global.to_string()
    } else {
        local.to_string()
    }
}

/// Build the integration list for one receiver, resolving global fallbacks.
pub fn build_receiver_integrations(
    rc: &Receiver,
    global: &GlobalConfig,
    renderer: Arc<Renderer>,
) -> Result<Vec<Integration>, ConfigError> {
    let mut out = Vec::new();

    for (i, c) in rc.webhook_configs.iter().enumerate() {
        let n = webhook::WebhookNotifier::new(
            c.clone(),
            resolved_http(&c.http_config, global),
            renderer.clone(),
        );
        out.push(Integration::new("webhook", i, c.send_resolved, Box::new(n)));
    }
    for (i, c) in rc.email_configs.iter().enumerate() {
        let mut c = c.clone();
        c.smarthost = require(
            &rc.name,
            "smarthost",
            &fallback(&c.smarthost, &global.smtp_smarthost),
        )?;
        c.from = require(&rc.name, "from", &fallback(&c.from, &global.smtp_from))?;
        c.auth_username = fallback(&c.auth_username, &global.smtp_auth_username);
        c.auth_password = fallback(&c.auth_password, &global.smtp_auth_password);
        let send_resolved = c.send_resolved;
        let n = email::EmailNotifier::new(c, renderer.clone());
        out.push(Integration::new("email", i, send_resolved, Box::new(n)));
    }
    for (i, c) in rc.pagerduty_configs.iter().enumerate() {
        let mut c = c.clone();
        c.url = fallback(&c.url, &global.pagerduty_url);
        if c.service_key.is_empty() && c.routing_key.is_empty() {
            return Err(ConfigError::MissingField {
                receiver: rc.name.clone(),
                field: "service_key or routing_key",
            });
        }
        let send_resolved = c.send_resolved;
        let http = resolved_http(&c.http_config, global);
        let n = pagerduty::PagerdutyNotifier::new(c, http, renderer.clone());
        out.push(Integration::new("pagerduty", i, send_resolved, Box::new(n)));
    }
    for (i, c) in rc.slack_configs.iter().enumerate() {
        let mut c = c.clone();
        c.api_url = require(
            &rc.name,
            "api_url",
            &fallback(&c.api_url, global.slack_api_url.as_deref().unwrap_or("")),
        )?;
        let send_resolved = c.send_resolved;
        let http = resolved_http(&c.http_config, global);
        let n = slack::SlackNotifier::new(c, http, renderer.clone());
        out.push(Integration::new("slack", i, send_resolved, Box::new(n)));
    }
    for (i, c) in rc.hipchat_configs.iter().enumerate() {
        let mut c = c.clone();
        c.api_url = fallback(&c.api_url, &global.hipchat_api_url);
        c.auth_token = require(
            &rc.name,
            "auth_token",
            &fallback(&c.auth_token, &global.hipchat_auth_token),
        )?;
        require(&rc.name, "room_id", &c.room_id)?;
        let send_resolved = c.send_resolved;
        let http = resolved_http(&c.http_config, global);
        let n = hipchat::HipchatNotifier::new(c, http, renderer.clone());
        out.push(Integration::new("hipchat", i, send_resolved, Box::new(n)));
    }
    for (i, c) in rc.opsgenie_configs.iter().enumerate() {
        let mut c = c.clone();
        c.api_url = fallback(&c.api_url, &global.opsgenie_api_url);
        require(&rc.name, "api_key", &c.api_key)?;
        let send_resolved = c.send_resolved;
        let http = resolved_http(&c.http_config, global);
        let n = opsgenie::OpsGenieNotifier::new(c, http, renderer.clone());
        out.push(Integration::new("opsgenie", i, send_resolved, Box::new(n)));
    }
    for (i, c) in rc.victorops_configs.iter().enumerate() {
        let mut c = c.clone();
        c.api_url = fallback(&c.api_url, &global.victorops_api_url);
        require(&rc.name, "api_key", &c.api_key)?;
        require(&rc.name, "routing_key", &c.routing_key)?;
        let send_resolved = c.send_resolved;
        let http = resolved_http(&c.http_config, global);
        let n = victorops::VictorOpsNotifier::new(c, http, renderer.clone());
        out.push(Integration::new("victorops", i, send_resolved, Box::new(n)));
    }
    for (i, c) in rc.pushover_configs.iter().enumerate() {
        require(&rc.name, "user_key", &c.user_key)?;
        require(&rc.name, "token", &c.token)?;
        let http = resolved_http(&c.http_config, global);
        let n = pushover::PushoverNotifier::new(c.clone(), http, renderer.clone());
        out.push(Integration::new("pushover", i, c.send_resolved, Box::new(n)));
    }
    for (i, c) in rc.wechat_configs.iter().enumerate() {
        let mut c = c.clone();
        c.api_url = fallback(&c.api_url, &global.wechat_api_url);
        require(&rc.name, "corp_id", &c.corp_id)?;
        require(&rc.name, "api_secret", &c.api_secret)?;
        let send_resolved = c.send_resolved;
        let http = resolved_http(&c.http_config, global);
        let n = wechat::WechatNotifier::new(c, http, renderer.clone());
        out.push(Integration::new("wechat", i, send_resolved, Box::new(n)));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renderer() -> Arc<Renderer> {
        Arc::new(Renderer::new("http://am.example.com"))
    }

    #[test]
    fn builds_integrations_in_declaration_order() {
        let yaml = r#"
name: team-x
webhook_configs:
  - url: http://example.com/a
  - url: http://example.com/b
opsgenie_configs:
  - api_key: k
"#;
        let rc: Receiver = serde_yaml::from_str(yaml).unwrap();
        let ints =
            build_receiver_integrations(&rc, &GlobalConfig::default(), renderer()).unwrap();
        let ids: Vec<String> = ints.iter().map(|i| i.id()).collect();
        assert_eq!(ids, vec!["webhook[0]", "webhook[1]", "opsgenie[0]"]);
    }

    #[test]
    fn slack_without_api_url_is_rejected() {
        let yaml = "name: team-x\nslack_configs:\n  - channel: '#x'\n";
        let rc: Receiver = serde_yaml::from_str(yaml).unwrap();
        let err =
            build_receiver_integrations(&rc, &GlobalConfig::default(), renderer()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { .. }));
    }

    #[test]
    fn slack_api_url_falls_back_to_global() {
        let yaml = "name: team-x\nslack_configs:\n  - channel: '#x'\n";
        let rc: Receiver = serde_yaml::from_str(yaml).unwrap();
        let global = GlobalConfig {
            slack_api_url: Some("https://hooks.slack.com/services/T/B/x".into()),
            ..Default::default()
        };
        let ints = build_receiver_integrations(&rc, &global, renderer()).unwrap();
        assert_eq!(ints.len(), 1);
    }

    #[test]
    fn pagerduty_requires_some_key() {
        let yaml = "name: team-x\npagerduty_configs:\n  - severity: warning\n";
        let rc: Receiver = serde_yaml::from_str(yaml).unwrap();
        assert!(
            build_receiver_integrations(&rc, &GlobalConfig::default(), renderer()).is_err()
        );
    }

    #[test]
    fn missing_group_key_is_fatal() {
        let ctx = NotifyContext {
            group_key: String::new(),
            receiver_name: "r".into(),
            group_labels: LabelSet::new(),
            repeat_interval: Duration::from_secs(60),
            cancel: CancellationToken::new(),
        };
        let err = ctx.require_group_key().unwrap_err();
        assert!(!err.retryable);
    }
}
