//! Tenant receiver configuration: the YAML document stored per tenant,
//! describing routing, receivers, inhibit rules and template files.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::receivers::Receiver;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid receiver config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("no receivers defined")]
    NoReceivers,
    #[error("duplicate receiver name {0:?}")]
    DuplicateReceiver(String),
    #[error("route references undefined receiver {0:?}")]
    UnknownReceiver(String),
    #[error("root route must name a receiver")]
    MissingRootReceiver,
    #[error("invalid duration {0:?}")]
    BadDuration(String),
    #[error("invalid label matcher regex {0:?}: {1}")]
    BadRegex(String, regex::Error),
    #[error("receiver {receiver:?}: missing {field}")]
    MissingField {
        receiver: String,
        field: &'static str,
    },
}

/// Parse and validate a tenant's receiver configuration.
pub fn load(text: &str) -> Result<AmConfig, ConfigError> {
    let cfg: AmConfig = serde_yaml::from_str(text)?;
    cfg.validate()?;
    Ok(cfg)
}

#[derive(Debug, Clone, Deserialize)]
pub struct AmConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    pub route: RouteConfig,
    #[serde(default)]
    pub receivers: Vec<Receiver>,
    #[serde(default)]
    pub inhibit_rules: Vec<InhibitRuleConfig>,
    #[serde(default)]
    pub templates: Vec<String>,
}

impl AmConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.receivers.is_empty() {
            return Err(ConfigError::NoReceivers);
        }
        let mut names = std::collections::HashSet::new();
        for r in &self.receivers {
            if !names.insert(r.name.as_str()) {
                return Err(ConfigError::DuplicateReceiver(r.name.clone()));
            }
        }
        if self.route.receiver.is_none() {
            return Err(ConfigError::MissingRootReceiver);
        }
        validate_route(&self.route, &names)?;
        for rule in &self.inhibit_rules {
            for value in rule.source_match_re.values().chain(rule.target_match_re.values()) {
                regex::Regex::new(value)
                    .map_err(|e| ConfigError::BadRegex(value.clone(), e))?;
            }
        }
        Ok(())
    }
}

fn validate_route(
    route: &RouteConfig,
    receivers: &std::collections::HashSet<&str>,
) -> Result<(), ConfigError> {
    if let Some(name) = &route.receiver {
        if !receivers.contains(name.as_str()) {
            return Err(ConfigError::UnknownReceiver(name.clone()));
        }
    }
    for value in route.match_re.values() {
        regex::Regex::new(value).map_err(|e| ConfigError::BadRegex(value.clone(), e))?;
    }
    for child in &route.routes {
        validate_route(child, receivers)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    #[serde(
        default = "default_resolve_timeout",
        deserialize_with = "duration::required"
    )]
    pub resolve_timeout: Duration,
    #[serde(default)]
    pub http_config: crate::receivers::HttpClientConfig,

    #[serde(default)]
    pub smtp_smarthost: String,
    #[serde(default)]
    pub smtp_from: String,
    #[serde(default)]
    pub smtp_auth_username: String,
    #[serde(default)]
    pub smtp_auth_password: String,

    #[serde(default)]
    pub slack_api_url: Option<String>,
    #[serde(default = "default_pagerduty_url")]
    pub pagerduty_url: String,
    #[serde(default = "default_opsgenie_api_url")]
    pub opsgenie_api_url: String,
    #[serde(default = "default_victorops_api_url")]
    pub victorops_api_url: String,
    #[serde(default = "default_hipchat_api_url")]
    pub hipchat_api_url: String,
    #[serde(default)]
    pub hipchat_auth_token: String,
    #[serde(default = "default_wechat_api_url")]
    pub wechat_api_url: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            resolve_timeout: default_resolve_timeout(),
            http_config: Default::default(),
            smtp_smarthost: String::new(),
            smtp_from: String::new(),
            smtp_auth_username: String::new(),
            smtp_auth_password: String::new(),
            slack_api_url: None,
            pagerduty_url: default_pagerduty_url(),
            opsgenie_api_url: default_opsgenie_api_url(),
            victorops_api_url: default_victorops_api_url(),
            hipchat_api_url: default_hipchat_api_url(),
            hipchat_auth_token: String::new(),
            wechat_api_url: default_wechat_api_url(),
        }
    }
}

fn default_resolve_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_pagerduty_url() -> String {
    "https://events.pagerduty.com/v2/enqueue".into()
}

fn default_opsgenie_api_url() -> String {
    "https://api.opsgenie.com/".into()
}

fn default_victorops_api_url() -> String {
    "https://alert.victorops.com/integrations/generic/20131114/alert/".into()
}

fn default_hipchat_api_url() -> String {
    "https://api.hipchat.com/".into()
}

fn default_wechat_api_url() -> String {
    "https://qyapi.weixin.qq.com/cgi-bin/".into()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteConfig {
    #[serde(default)]
    pub receiver: Option<String>,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(rename = "match", default)]
    pub match_eq: BTreeMap<String, String>,
    #[serde(default)]
    pub match_re: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "duration::optional")]
    pub group_wait: Option<Duration>,
    #[serde(default, deserialize_with = "duration::optional")]
    pub group_interval: Option<Duration>,
    #[serde(default, deserialize_with = "duration::optional")]
    pub repeat_interval: Option<Duration>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InhibitRuleConfig {
    #[serde(default)]
    pub source_match: BTreeMap<String, String>,
    #[serde(default)]
    pub source_match_re: BTreeMap<String, String>,
    #[serde(default)]
    pub target_match: BTreeMap<String, String>,
    #[serde(default)]
    pub target_match_re: BTreeMap<String, String>,
    #[serde(default)]
    pub equal: Vec<String>,
}

/// Parse a prometheus-style duration string: `100ms`, `30s`, `5m`, `4h`,
/// `5d`, or combinations like `1h30m`.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ConfigError::BadDuration(s.to_string()));
    }
    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut chars = s.chars().peekable();
    let mut saw_unit = false;
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let mut unit = String::from(c);
        if c == 'm' && chars.peek() == Some(&'s') {
            chars.next();
            unit.push('s');
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| ConfigError::BadDuration(s.to_string()))?;
        digits.clear();
        saw_unit = true;
        total += match unit.as_str() {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            "d" => Duration::from_secs(value * 86400),
            _ => return Err(ConfigError::BadDuration(s.to_string())),
        };
    }
    if !digits.is_empty() || !saw_unit {
        return Err(ConfigError::BadDuration(s.to_string()));
    }
    Ok(total)
}

/// Serde adapters turning duration strings into [`Duration`] at parse time.
pub(crate) mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn required<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }

    pub fn optional<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.map(|s| super::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
