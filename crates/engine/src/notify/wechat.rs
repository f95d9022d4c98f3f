use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use alertmux_common::alert::Alert;
use alertmux_common::now_unix;

use super::http;
use super::{Notifier, NotifyContext, NotifyError};
use crate::receivers::{HttpClientConfig, WechatConfig};
use crate::template::Renderer;

const TOKEN_LIFETIME: Duration = Duration::from_secs(2 * 60 * 60);

/// Body code signalling an expired access token.
const CODE_TOKEN_EXPIRED: i64 = 42001;

pub struct WechatNotifier {
    conf: WechatConfig,
    http: HttpClientConfig,
    renderer: Arc<Renderer>,
    token: Mutex<Option<CachedToken>>,
}

struct CachedToken {
    value: String,
    fetched_at: Instant,
}

#[derive(Debug, Deserialize)]
struct WechatToken {
    #[serde(default)]
    access_token: String,
}

#[derive(Debug, Serialize)]
pub struct WechatMessage {
    pub text: WechatMessageContent,
    #[serde(rename = "touser", skip_serializing_if = "String::is_empty")]
    pub to_user: String,
    #[serde(rename = "toparty", skip_serializing_if = "String::is_empty")]
    pub to_party: String,
    #[serde(rename = "totag", skip_serializing_if = "String::is_empty")]
    pub to_tag: String,
    #[serde(rename = "agentid", skip_serializing_if = "String::is_empty")]
    pub agent_id: String,
    #[serde(rename = "msgtype")]
    pub kind: &'static str,
    pub safe: &'static str,
}

#[derive(Debug, Serialize)]
pub struct WechatMessageContent {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct WechatResponse {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub error: String,
}

impl WechatNotifier {
    pub fn new(conf: WechatConfig, http: HttpClientConfig, renderer: Arc<Renderer>) -> Self {
        Self {
            conf,
            http,
            renderer,
            token: Mutex::new(None),
        }
    }

    /// Fetch or reuse the cached access token. The cache lock is held across
    /// the refresh so concurrent expiries trigger a single `gettoken` call.
    async fn access_token(
        &self,
        client: &reqwest::Client,
        ctx: &NotifyContext,
        corp_id: &str,
        corp_secret: &str,
    ) -> Result<String, NotifyError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = &*cached {
            if token.fetched_at.elapsed() < TOKEN_LIFETIME {
                return Ok(token.value.clone());
            }
        }

        let mut token_url = url::Url::parse(&self.conf.api_url)
            .map_err(|e| NotifyError::fatal(format!("invalid wechat api url: {e}")))?;
        {
            let mut path = token_url.path().trim_end_matches('/').to_string();
            path.push_str("/gettoken");
            token_url.set_path(&path);
        }
        token_url
            .query_pairs_mut()
            .append_pair("corpsecret", corp_secret)
            .append_pair("corpid", corp_id);

        let req = http::apply_auth(
            client
                .get(token_url.as_str())
                .header(CONTENT_TYPE, http::CONTENT_TYPE_JSON),
            &self.http,
        );
        let resp = http::send(req, ctx).await?;
        let token: WechatToken = resp
            .json()
            .await
            .map_err(|e| NotifyError::fatal(format!("failed to decode token response: {e}")))?;
        if token.access_token.is_empty() {
            return Err(NotifyError::fatal(format!(
                "invalid api secret for corp id {corp_id}"
            )));
        }
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            fetched_at: Instant::now(),
        });
        Ok(token.access_token)
    }

    /// Classify the `message/send` response; an expired-token body code
    /// clears the cache so the next attempt re-authenticates.
    async fn handle_send_response(&self, status: u16, body: &[u8]) -> Result<(), NotifyError> {
        if status != 200 {
            return Err(NotifyError::retryable(format!(
                "unexpected status code {status}"
            )));
        }
        let resp: WechatResponse = serde_json::from_slice(body)
            .map_err(|e| NotifyError::retryable(format!("failed to decode response: {e}")))?;
        if resp.code == 0 {
            return Ok(());
        }
        if resp.code == CODE_TOKEN_EXPIRED {
            self.token.lock().await.take();
            return Err(NotifyError::retryable(resp.error));
        }
        Err(NotifyError::fatal(resp.error))
    }
}

#[async_trait]
impl Notifier for WechatNotifier {
    fn name(&self) -> &'static str {
        "wechat"
    }

    async fn notify(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<(), NotifyError> {
        ctx.require_group_key()?;
        let data = self
            .renderer
            .data(&ctx.receiver_name, &ctx.group_labels, alerts, now_unix());
        let mut tmpl = self.renderer.latched(&data);

        let corp_id = tmpl.text(&self.conf.corp_id);
        let corp_secret = tmpl.text(&self.conf.api_secret);
        let msg = WechatMessage {
            text: WechatMessageContent {
                content: tmpl.text(&self.conf.message),
            },
            to_user: tmpl.text(&self.conf.to_user),
            to_party: tmpl.text(&self.conf.to_party),
            to_tag: tmpl.text(&self.conf.to_tag),
            agent_id: tmpl.text(&self.conf.agent_id),
            kind: "text",
            safe: "0",
        };
        tmpl.finish()?;

        let client = http::build_client(&self.http)?;
        let access_token = self
            .access_token(&client, ctx, &corp_id, &corp_secret)
            .await?;

        let mut send_url = url::Url::parse(&self.conf.api_url)
            .map_err(|e| NotifyError::fatal(format!("invalid wechat api url: {e}")))?;
        {
            let mut path = send_url.path().trim_end_matches('/').to_string();
            path.push_str("/message/send");
            send_url.set_path(&path);
        }
        send_url
            .query_pairs_mut()
            .append_pair("access_token", &access_token);

        let resp = http::post_json(&client, send_url.as_str(), &self.http, &msg, ctx).await?;
        let status = resp.status().as_u16();
        let body = resp
            .bytes()
            .await
            .map_err(|e| NotifyError::retryable(http::redact_url(&e)))?;
        self.handle_send_response(status, &body).await
    }
}
