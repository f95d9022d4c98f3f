//! Per-provider receiver configuration. A receiver binds a name to any
//! number of provider-specific sinks; every entry becomes one integration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::config::duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Receiver {
    pub name: String,
    #[serde(default)]
    pub webhook_configs: Vec<WebhookConfig>,
    #[serde(default)]
    pub email_configs: Vec<EmailConfig>,
    #[serde(default)]
    pub pagerduty_configs: Vec<PagerdutyConfig>,
    #[serde(default)]
    pub slack_configs: Vec<SlackConfig>,
    #[serde(default)]
    pub hipchat_configs: Vec<HipchatConfig>,
    #[serde(default)]
    pub opsgenie_configs: Vec<OpsGenieConfig>,
    #[serde(default)]
    pub victorops_configs: Vec<VictorOpsConfig>,
    #[serde(default)]
    pub pushover_configs: Vec<PushoverConfig>,
    #[serde(default)]
    pub wechat_configs: Vec<WechatConfig>,
}

/// Outbound HTTP settings, resolved per receiver with the global section as
/// fallback. A fresh client is built from this on every notify call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpClientConfig {
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub tls_config: TlsClientConfig,
    #[serde(default, deserialize_with = "duration::optional")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsClientConfig {
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default = "yes")]
    pub send_resolved: bool,
    #[serde(default)]
    pub http_config: Option<HttpClientConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    pub to: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub smarthost: String,
    #[serde(default)]
    pub auth_username: String,
    #[serde(default)]
    pub auth_password: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_email_html")]
    pub html: String,
    #[serde(default)]
    pub send_resolved: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PagerdutyConfig {
    #[serde(default)]
    pub service_key: String,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_client")]
    pub client: String,
    #[serde(default = "default_client_url")]
    pub client_url: String,
    #[serde(default = "default_subject")]
    pub description: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub component: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
    #[serde(default)]
    pub images: Vec<PagerdutyImage>,
    #[serde(default)]
    pub links: Vec<PagerdutyLink>,
    #[serde(default = "yes")]
    pub send_resolved: bool,
    #[serde(default)]
    pub http_config: Option<HttpClientConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PagerdutyImage {
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub alt: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PagerdutyLink {
    #[serde(default)]
    pub href: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackConfig {
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default = "default_slack_username")]
    pub username: String,
    #[serde(default)]
    pub color: String,
    #[serde(default = "default_subject")]
    pub title: String,
    #[serde(default)]
    pub title_link: String,
    #[serde(default)]
    pub pretext: String,
    #[serde(default = "default_slack_text")]
    pub text: String,
    #[serde(default = "default_subject")]
    pub fallback: String,
    #[serde(default)]
    pub callback_id: String,
    #[serde(default)]
    pub icon_emoji: String,
    #[serde(default)]
    pub icon_url: String,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub thumb_url: String,
    #[serde(default)]
    pub footer: String,
    #[serde(default)]
    pub link_names: bool,
    #[serde(default)]
    pub short_fields: bool,
    #[serde(default)]
    pub fields: Vec<SlackField>,
    #[serde(default)]
    pub actions: Vec<SlackAction>,
    #[serde(default)]
    pub send_resolved: bool,
    #[serde(default)]
    pub http_config: Option<HttpClientConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackField {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub short: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackAction {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub style: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub confirm: Option<SlackConfirmationField>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackConfirmationField {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub ok_text: String,
    #[serde(default)]
    pub dismiss_text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HipchatConfig {
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub notify: bool,
    #[serde(default = "default_subject")]
    pub message: String,
    #[serde(default = "default_hipchat_format")]
    pub message_format: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub send_resolved: bool,
    #[serde(default)]
    pub http_config: Option<HttpClientConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpsGenieConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_url: String,
    #[serde(default = "default_subject")]
    pub message: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub teams: String,
    #[serde(default)]
    pub tags: String,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub priority: String,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
    #[serde(default = "yes")]
    pub send_resolved: bool,
    #[serde(default)]
    pub http_config: Option<HttpClientConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VictorOpsConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default = "default_victorops_type")]
    pub message_type: String,
    #[serde(default = "default_subject")]
    pub entity_display_name: String,
    #[serde(default = "default_subject")]
    pub state_message: String,
    #[serde(default = "default_monitoring_tool")]
    pub monitoring_tool: String,
    #[serde(default)]
    pub custom_fields: BTreeMap<String, String>,
    #[serde(default = "yes")]
    pub send_resolved: bool,
    #[serde(default)]
    pub http_config: Option<HttpClientConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushoverConfig {
    #[serde(default)]
    pub user_key: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_subject")]
    pub title: String,
    #[serde(default = "default_pushover_message")]
    pub message: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub url_title: String,
    #[serde(default)]
    pub sound: String,
    #[serde(default)]
    pub priority: String,
    #[serde(default = "default_pushover_retry", deserialize_with = "duration::required")]
    pub retry: Duration,
    #[serde(default = "default_pushover_expire", deserialize_with = "duration::required")]
    pub expire: Duration,
    #[serde(default)]
    pub html: bool,
    #[serde(default = "yes")]
    pub send_resolved: bool,
    #[serde(default)]
    pub http_config: Option<HttpClientConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WechatConfig {
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub corp_id: String,
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub to_user: String,
    #[serde(default)]
    pub to_party: String,
    #[serde(default)]
    pub to_tag: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default = "default_subject")]
    pub message: String,
    #[serde(default)]
    pub send_resolved: bool,
    #[serde(default)]
    pub http_config: Option<HttpClientConfig>,
}

fn yes() -> bool {
    true
}

fn default_subject() -> String {
    "[{{status}}] {{groupLabels.alertname}}".into()
}

fn default_slack_text() -> String {
    "{{#each alerts}}{{this.labels.alertname}} is {{this.status}}\n{{/each}}".into()
}

fn default_slack_username() -> String {
    "alertmux".into()
}

fn default_client() -> String {
    "alertmux".into()
}

fn default_client_url() -> String {
    "{{externalURL}}".into()
}

fn default_email_html() -> String {
    "<h2>[{{status}}] {{groupLabels.alertname}}</h2>\
     <ul>{{#each alerts}}<li>{{this.labels.alertname}} is {{this.status}}</li>{{/each}}</ul>"
        .into()
}

fn default_hipchat_format() -> String {
    "text".into()
}

fn default_victorops_type() -> String {
    "CRITICAL".into()
}

fn default_monitoring_tool() -> String {
    "alertmux".into()
}

fn default_pushover_message() -> String {
    "{{#each alerts}}{{this.labels.alertname}} is {{this.status}}\n{{/each}}".into()
}

fn default_pushover_retry() -> Duration {
    Duration::from_secs(60)
}

fn default_pushover_expire() -> Duration {
    Duration::from_secs(3600)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receiver_with_many_kinds() {
        let yaml = r#"
name: everything
webhook_configs:
  - url: http://example.com/hook
slack_configs:
  - channel: '#alerts'
pushover_configs:
  - user_key: u
    token: t
    retry: 2m
"#;
        let r: Receiver = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(r.name, "everything");
        assert!(r.webhook_configs[0].send_resolved);
        assert!(!r.slack_configs[0].send_resolved);
        assert_eq!(r.pushover_configs[0].retry, Duration::from_secs(120));
        assert_eq!(r.pushover_configs[0].expire, Duration::from_secs(3600));
    }

    #[test]
    fn http_config_parses_auth_and_timeout() {
        let yaml = r#"
bearer_token: secret
proxy_url: http://proxy:3128
tls_config:
  insecure_skip_verify: true
timeout: 5s
"#;
        let hc: HttpClientConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(hc.bearer_token.as_deref(), Some("secret"));
        assert!(hc.tls_config.insecure_skip_verify);
        assert_eq!(hc.timeout, Some(Duration::from_secs(5)));
    }
}
