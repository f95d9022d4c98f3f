use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use alertmux_common::alert::Alert;
use alertmux_common::now_unix;

use super::http;
use super::{Notifier, NotifyContext, NotifyError};
use crate::receivers::{HipchatConfig, HttpClientConfig};
use crate::template::Renderer;

pub struct HipchatNotifier {
    conf: HipchatConfig,
    http: HttpClientConfig,
    renderer: Arc<Renderer>,
}

#[derive(Debug, Serialize)]
pub struct HipchatRequest {
    pub from: String,
    pub notify: bool,
    pub message: String,
    pub message_format: String,
    pub color: String,
}

impl HipchatNotifier {
    pub fn new(conf: HipchatConfig, http: HttpClientConfig, renderer: Arc<Renderer>) -> Self {
        Self {
            conf,
            http,
            renderer,
        }
    }

    fn build_request(
        &self,
        ctx: &NotifyContext,
        alerts: &[Alert],
    ) -> Result<(String, HipchatRequest), NotifyError> {
        let data = self
            .renderer
            .data(&ctx.receiver_name, &ctx.group_labels, alerts, now_unix());
        let mut tmpl = self.renderer.latched(&data);

        let room_id = tmpl.text(&self.conf.room_id);
        let message = if self.conf.message_format == "html" {
            tmpl.html(&self.conf.message)
        } else {
            tmpl.text(&self.conf.message)
        };
        let req = HipchatRequest {
            from: tmpl.text(&self.conf.from),
            notify: self.conf.notify,
            message,
            message_format: self.conf.message_format.clone(),
            color: tmpl.text(&self.conf.color),
        };
        tmpl.finish()?;

        let mut api_url = url::Url::parse(&self.conf.api_url)
            .map_err(|e| NotifyError::fatal(format!("invalid hipchat api url: {e}")))?;
        {
            let mut path = api_url.path().trim_end_matches('/').to_string();
            path.push_str(&format!("/v2/room/{room_id}/notification"));
            api_url.set_path(&path);
        }
        api_url
            .query_pairs_mut()
            .append_pair("auth_token", &self.conf.auth_token);
        Ok((api_url.to_string(), req))
    }
}

#[async_trait]
impl Notifier for HipchatNotifier {
    fn name(&self) -> &'static str {
        "hipchat"
    }

    async fn notify(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<(), NotifyError> {
        let (api_url, req) = self.build_request(ctx, alerts)?;
        let client = http::build_client(&self.http)?;
        let resp = http::post_json(&client, &api_url, &self.http, &req, ctx).await?;
        classify(resp.status().as_u16())
    }
}

/// Hipchat recovers on 429 (rate limiting) and 5xx.
pub fn classify(status: u16) -> Result<(), NotifyError> {
    if status / 100 == 2 {
        return Ok(());
    }
    let message = format!("unexpected status code {status}");
    if status == 429 || status / 100 == 5 {
        Err(NotifyError::retryable(message))
    } else {
        Err(NotifyError::fatal(message))
    }
}
