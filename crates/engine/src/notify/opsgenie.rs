use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;

use alertmux_common::alert::{batch_status, Alert, AlertStatus};
use alertmux_common::text::{sha256hex, truncate};
use alertmux_common::now_unix;

use super::http;
use super::{Notifier, NotifyContext, NotifyError};
use crate::receivers::{HttpClientConfig, OpsGenieConfig};
use crate::template::Renderer;

const MESSAGE_LIMIT: usize = 130;

pub struct OpsGenieNotifier {
    conf: OpsGenieConfig,
    http: HttpClientConfig,
    renderer: Arc<Renderer>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum OpsGenieMessage {
    Create(OpsGenieCreateMessage),
    Close(OpsGenieCloseMessage),
}

#[derive(Debug, Serialize)]
pub struct OpsGenieCreateMessage {
    pub alias: String,
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub details: BTreeMap<String, String>,
    pub source: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub teams: Vec<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub note: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub priority: String,
}

#[derive(Debug, Serialize)]
pub struct OpsGenieCloseMessage {
    pub source: String,
}

impl OpsGenieNotifier {
    pub fn new(conf: OpsGenieConfig, http: HttpClientConfig, renderer: Arc<Renderer>) -> Self {
        Self {
            conf,
            http,
            renderer,
        }
    }

    /// Build the request target and body: firing batches open an alert,
    /// resolved batches close the aliased one.
    fn build_request(
        &self,
        ctx: &NotifyContext,
        alerts: &[Alert],
    ) -> Result<(String, OpsGenieMessage, String), NotifyError> {
        let key = ctx.require_group_key()?;
        let alias = sha256hex(key);
        let data = self
            .renderer
            .data(&ctx.receiver_name, &ctx.group_labels, alerts, now_unix());
        let mut tmpl = self.renderer.latched(&data);

        let mut api_url = url::Url::parse(&self.conf.api_url)
            .map_err(|e| NotifyError::fatal(format!("invalid opsgenie api url: {e}")))?;

        let msg = match batch_status(alerts, now_unix()) {
            AlertStatus::Resolved => {
                {
                    let mut path = api_url.path().trim_end_matches('/').to_string();
                    path.push_str(&format!("/v2/alerts/{alias}/close"));
                    api_url.set_path(&path);
                }
                api_url
                    .query_pairs_mut()
                    .append_pair("identifierType", "alias");
                OpsGenieMessage::Close(OpsGenieCloseMessage {
                    source: tmpl.text(&self.conf.source),
                })
            }
            AlertStatus::Firing => {
                {
                    let mut path = api_url.path().trim_end_matches('/').to_string();
                    path.push_str("/v2/alerts");
                    api_url.set_path(&path);
                }
                let (message, _) = truncate(&tmpl.text(&self.conf.message), MESSAGE_LIMIT);

                let mut details = BTreeMap::new();
                for (k, v) in &self.conf.details {
                    details.insert(k.clone(), tmpl.text(v));
                }
                let teams = safe_split(&tmpl.text(&self.conf.teams), ',')
                    .into_iter()
                    .map(|name| {
                        let mut team = BTreeMap::new();
                        team.insert("name".to_string(), name);
                        team
                    })
                    .collect();
                let tags = safe_split(&tmpl.text(&self.conf.tags), ',');

                OpsGenieMessage::Create(OpsGenieCreateMessage {
                    alias,
                    message,
                    description: tmpl.text(&self.conf.description),
                    details,
                    source: tmpl.text(&self.conf.source),
                    teams,
                    tags,
                    note: tmpl.text(&self.conf.note),
                    priority: tmpl.text(&self.conf.priority),
                })
            }
        };
        let api_key = tmpl.text(&self.conf.api_key);
        tmpl.finish()?;
        Ok((api_url.to_string(), msg, api_key))
    }
}

#[async_trait]
impl Notifier for OpsGenieNotifier {
    fn name(&self) -> &'static str {
        "opsgenie"
    }

    async fn notify(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<(), NotifyError> {
        let (api_url, msg, api_key) = self.build_request(ctx, alerts)?;
        let client = http::build_client(&self.http)?;
        let req = http::apply_auth(
            client
                .post(&api_url)
                .header(CONTENT_TYPE, http::CONTENT_TYPE_JSON)
                .header(AUTHORIZATION, format!("GenieKey {api_key}"))
                .json(&msg),
            &self.http,
        );
        let resp = http::send(req, ctx).await?;
        classify(resp.status().as_u16())
    }
}

/// Split on `sep`, dropping empty entries.
fn safe_split(s: &str, sep: char) -> Vec<String> {
    s.trim()
        .split(sep)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// OpsGenie recovers on 429 (rate limiting) and 5xx.
pub fn classify(status: u16) -> Result<(), NotifyError> {
    let message = format!("unexpected status code {status}");
    if status / 100 == 5 || status == 429 {
        Err(NotifyError::retryable(message))
    } else if status / 100 != 2 {
        Err(NotifyError::fatal(message))
    } else {
        Ok(())
    }
}
