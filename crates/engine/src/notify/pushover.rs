use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;

use alertmux_common::alert::Alert;
use alertmux_common::text::truncate;
use alertmux_common::now_unix;

use super::http;
use super::{Notifier, NotifyContext, NotifyError};
use crate::receivers::{HttpClientConfig, PushoverConfig};
use crate::template::Renderer;

const API_URL: &str = "https://api.pushover.net/1/messages.json";

const TITLE_LIMIT: usize = 250;
const MESSAGE_LIMIT: usize = 1024;
const URL_LIMIT: usize = 512;

pub struct PushoverNotifier {
    conf: PushoverConfig,
    http: HttpClientConfig,
    renderer: Arc<Renderer>,
    api_url: String,
}

impl PushoverNotifier {
    pub fn new(conf: PushoverConfig, http: HttpClientConfig, renderer: Arc<Renderer>) -> Self {
        Self {
            conf,
            http,
            renderer,
            api_url: API_URL.to_string(),
        }
    }

    /// All parameters travel in the query string over an empty-body POST.
    fn build_parameters(
        &self,
        ctx: &NotifyContext,
        alerts: &[Alert],
    ) -> Result<Vec<(&'static str, String)>, NotifyError> {
        ctx.require_group_key()?;
        let data = self
            .renderer
            .data(&ctx.receiver_name, &ctx.group_labels, alerts, now_unix());
        let mut tmpl = self.renderer.latched(&data);

        let mut parameters = Vec::new();
        parameters.push(("token", tmpl.text(&self.conf.token)));
        parameters.push(("user", tmpl.text(&self.conf.user_key)));

        let (title, _) = truncate(&tmpl.text(&self.conf.title), TITLE_LIMIT);
        parameters.push(("title", title));

        let message = if self.conf.html {
            parameters.push(("html", "1".to_string()));
            tmpl.html(&self.conf.message)
        } else {
            tmpl.text(&self.conf.message)
        };
        let (message, _) = truncate(&message, MESSAGE_LIMIT);
        let mut message = message.trim().to_string();
        if message.is_empty() {
            // Pushover rejects empty messages.
            message = "(no details)".to_string();
        }
        parameters.push(("message", message));

        let (supplementary_url, _) = truncate(&tmpl.text(&self.conf.url), URL_LIMIT);
        parameters.push(("url", supplementary_url));
        parameters.push(("url_title", tmpl.text(&self.conf.url_title)));
        parameters.push(("priority", tmpl.text(&self.conf.priority)));
        parameters.push(("retry", self.conf.retry.as_secs().to_string()));
        parameters.push(("expire", self.conf.expire.as_secs().to_string()));
        parameters.push(("sound", tmpl.text(&self.conf.sound)));
        tmpl.finish()?;
        Ok(parameters)
    }
}

#[async_trait]
impl Notifier for PushoverNotifier {
    fn name(&self) -> &'static str {
        "pushover"
    }

    async fn notify(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<(), NotifyError> {
        let parameters = self.build_parameters(ctx, alerts)?;
        let mut api_url = url::Url::parse(&self.api_url)
            .map_err(|e| NotifyError::fatal(format!("invalid pushover api url: {e}")))?;
        for (key, value) in &parameters {
            api_url.query_pairs_mut().append_pair(key, value);
        }

        let client = http::build_client(&self.http)?;
        // The URL embeds the token and user key; it must never be logged.
        let req = http::apply_auth(
            client
                .post(api_url.as_str())
                .header(CONTENT_TYPE, "text/plain"),
            &self.http,
        );
        let resp = http::send(req, ctx).await?;
        classify(resp.status().as_u16())
    }
}

/// Pushover documents 2xx as success and 4xx as user error; only 5xx is
/// assumed recoverable.
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
