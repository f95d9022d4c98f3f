use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use alertmux_common::alert::Alert;
use alertmux_common::now_unix;

use super::{Notifier, NotifyContext, NotifyError};
use crate::receivers::EmailConfig;
use crate::template::Renderer;

pub struct EmailNotifier {
    conf: EmailConfig,
    renderer: Arc<Renderer>,
}

impl EmailNotifier {
    pub fn new(conf: EmailConfig, renderer: Arc<Renderer>) -> Self {
        Self { conf, renderer }
    }

    fn subject_template(&self) -> &str {
        self.conf
            .headers
            .get("Subject")
            .map(String::as_str)
            .unwrap_or("[{{status}}] {{groupLabels.alertname}}")
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn notify(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<(), NotifyError> {
        let data = self
            .renderer
            .data(&ctx.receiver_name, &ctx.group_labels, alerts, now_unix());
        let mut tmpl = self.renderer.latched(&data);

        let to = tmpl.text(&self.conf.to);
        let subject = tmpl.text(self.subject_template());
        let body = tmpl.html(&self.conf.html);
        tmpl.finish()?;

        let email = Message::builder()
            .from(
                self.conf
                    .from
                    .parse()
                    .map_err(|e: lettre::address::AddressError| NotifyError::fatal(e.to_string()))?,
            )
            .to(to
                .parse()
                .map_err(|e: lettre::address::AddressError| NotifyError::fatal(e.to_string()))?)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(body)
            .map_err(|e| NotifyError::fatal(e.to_string()))?;

        let (host, port) = split_smarthost(&self.conf.smarthost)?;
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&host)
            .map_err(|e| NotifyError::fatal(format!("invalid smarthost: {e}")))?
            .port(port);
        if !self.conf.auth_username.is_empty() {
            builder = builder.credentials(Credentials::new(
                self.conf.auth_username.clone(),
                self.conf.auth_password.clone(),
            ));
        }
        let transport = builder.build();

        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(NotifyError::fatal("notification cancelled")),
            sent = transport.send(email) => {
                sent.map_err(|e| NotifyError::retryable(e.to_string()))?;
                Ok(())
            }
        }
    }
}

fn split_smarthost(smarthost: &str) -> Result<(String, u16), NotifyError> {
    let (host, port) = smarthost
        .rsplit_once(':')
        .ok_or_else(|| NotifyError::fatal(format!("invalid smarthost {smarthost:?}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| NotifyError::fatal(format!("invalid smarthost port in {smarthost:?}")))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smarthost_splits_host_and_port() {
        let (host, port) = split_smarthost("smtp.example.com:587").unwrap();
        assert_eq!(host, "smtp.example.com");
        assert_eq!(port, 587);
    }

    #[test]
    fn smarthost_without_port_rejected() {
        assert!(split_smarthost("smtp.example.com").is_err());
        assert!(split_smarthost("smtp.example.com:abc").is_err());
    }

    #[test]
    fn subject_defaults_when_header_absent() {
        let conf: EmailConfig =
            serde_yaml::from_str("to: a@b.com\nfrom: c@d.com\nsmarthost: h:25\n").unwrap();
        let n = EmailNotifier::new(conf, Arc::new(Renderer::new("")));
        assert_eq!(n.subject_template(), "[{{status}}] {{groupLabels.alertname}}");
    }

    #[test]
    fn subject_header_overrides_default() {
        let conf: EmailConfig = serde_yaml::from_str(
            "to: a@b.com\nfrom: c@d.com\nsmarthost: h:25\nheaders:\n  Subject: custom\n",
        )
        .unwrap();
        let n = EmailNotifier::new(conf, Arc::new(Renderer::new("")));
        assert_eq!(n.subject_template(), "custom");
    }
}
