//! Shared HTTP plumbing for the provider integrations. Clients are built
//! per notify call from the tenant's HTTP config; requests abort when the
//! notification context is cancelled.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;

use super::{NotifyContext, NotifyError};
use crate::receivers::HttpClientConfig;

pub(crate) const CONTENT_TYPE_JSON: &str = "application/json";
pub(crate) const USER_AGENT: &str = concat!("Alertmanager/", env!("CARGO_PKG_VERSION"));

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn build_client(hc: &HttpClientConfig) -> Result<Client, NotifyError> {
    let mut builder = Client::builder().timeout(hc.timeout.unwrap_or(DEFAULT_TIMEOUT));
    if hc.tls_config.insecure_skip_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(proxy) = &hc.proxy_url {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| NotifyError::fatal(format!("invalid proxy url: {e}")))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| NotifyError::fatal(format!("failed to build http client: {e}")))
}

pub(crate) fn apply_auth(req: RequestBuilder, hc: &HttpClientConfig) -> RequestBuilder {
    let req = match &hc.bearer_token {
        Some(token) => req.bearer_auth(token),
        None => req,
    };
    match &hc.basic_auth {
        Some(auth) => req.basic_auth(&auth.username, Some(&auth.password)),
        None => req,
    }
}

/// Send a prepared request, aborting on context cancellation. Transport
/// failures are retryable and never leak the target URL.
pub(crate) async fn send(req: RequestBuilder, ctx: &NotifyContext) -> Result<Response, NotifyError> {
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(NotifyError::fatal("notification cancelled")),
        resp = req.send() => resp.map_err(|e| NotifyError::retryable(redact_url(&e))),
    }
}

pub(crate) async fn post_json<T: Serialize + ?Sized>(
    client: &Client,
    url: &str,
    hc: &HttpClientConfig,
    body: &T,
    ctx: &NotifyContext,
) -> Result<Response, NotifyError> {
    let req = apply_auth(
        client
            .post(url)
            .header(CONTENT_TYPE, CONTENT_TYPE_JSON)
            .json(body),
        hc,
    );
    send(req, ctx).await
}

/// Replace any URL carried by a transport error with `<redacted>`; query
/// strings routinely embed tokens that must not reach the logs.
pub(crate) fn redact_url(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    if let Some(url) = err.url() {
        if message.contains(url.as_str()) {
            message = message.replace(url.as_str(), "<redacted>");
        } else {
            message = format!("{message} (url: <redacted>)");
        }
    }
    message
}
