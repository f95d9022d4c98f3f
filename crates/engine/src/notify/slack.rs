use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use alertmux_common::alert::Alert;
use alertmux_common::now_unix;

use super::http;
use super::{Notifier, NotifyContext, NotifyError};
use crate::receivers::{HttpClientConfig, SlackConfig};
use crate::template::Renderer;

pub struct SlackNotifier {
    conf: SlackConfig,
    http: HttpClientConfig,
    renderer: Arc<Renderer>,
}

#[derive(Debug, Serialize)]
pub struct SlackRequest {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub channel: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub icon_emoji: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub icon_url: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub link_names: bool,
    pub attachments: Vec<SlackAttachment>,
}

#[derive(Debug, Serialize)]
pub struct SlackAttachment {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title_link: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pretext: String,
    pub text: String,
    pub fallback: String,
    pub callback_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<SlackFieldMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<SlackActionMessage>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub image_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub thumb_url: String,
    pub footer: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub color: String,
    pub mrkdwn_in: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct SlackFieldMessage {
    pub title: String,
    pub value: String,
    pub short: bool,
}

#[derive(Debug, Serialize)]
pub struct SlackActionMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    pub url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub style: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm: Option<SlackConfirmationMessage>,
}

#[derive(Debug, Serialize)]
pub struct SlackConfirmationMessage {
    pub title: String,
    pub text: String,
    pub ok_text: String,
    pub dismiss_text: String,
}

impl SlackNotifier {
    pub fn new(conf: SlackConfig, http: HttpClientConfig, renderer: Arc<Renderer>) -> Self {
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
    ) -> Result<SlackRequest, NotifyError> {
        let data = self
            .renderer
            .data(&ctx.receiver_name, &ctx.group_labels, alerts, now_unix());
        let mut tmpl = self.renderer.latched(&data);

        let fields = self
            .conf
            .fields
            .iter()
            .map(|field| SlackFieldMessage {
                title: tmpl.text(&field.title),
                value: tmpl.text(&field.value),
                // Per-field short overrides the receiver-wide default.
                short: field.short.unwrap_or(self.conf.short_fields),
            })
            .collect();

        let actions = self
            .conf
            .actions
            .iter()
            .map(|action| SlackActionMessage {
                kind: tmpl.text(&action.kind),
                text: tmpl.text(&action.text),
                url: tmpl.text(&action.url),
                style: tmpl.text(&action.style),
                name: tmpl.text(&action.name),
                value: tmpl.text(&action.value),
                confirm: action.confirm.as_ref().map(|c| SlackConfirmationMessage {
                    title: tmpl.text(&c.title),
                    text: tmpl.text(&c.text),
                    ok_text: tmpl.text(&c.ok_text),
                    dismiss_text: tmpl.text(&c.dismiss_text),
                }),
            })
            .collect();

        let attachment = SlackAttachment {
            title: tmpl.text(&self.conf.title),
            title_link: tmpl.text(&self.conf.title_link),
            pretext: tmpl.text(&self.conf.pretext),
            text: tmpl.text(&self.conf.text),
            fallback: tmpl.text(&self.conf.fallback),
            callback_id: tmpl.text(&self.conf.callback_id),
            fields,
            actions,
            image_url: tmpl.text(&self.conf.image_url),
            thumb_url: tmpl.text(&self.conf.thumb_url),
            footer: tmpl.text(&self.conf.footer),
            color: tmpl.text(&self.conf.color),
            mrkdwn_in: vec!["fallback", "pretext", "text"],
        };

        let req = SlackRequest {
            channel: tmpl.text(&self.conf.channel),
            username: tmpl.text(&self.conf.username),
            icon_emoji: tmpl.text(&self.conf.icon_emoji),
            icon_url: tmpl.text(&self.conf.icon_url),
            link_names: self.conf.link_names,
            attachments: vec![attachment],
        };
        tmpl.finish()?;
        Ok(req)
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn notify(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<(), NotifyError> {
        let req = self.build_request(ctx, alerts)?;
        let client = http::build_client(&self.http)?;
        let resp = http::post_json(&client, &self.conf.api_url, &self.http, &req, ctx).await?;
        classify(resp.status().as_u16())
    }
}

/// Slack incoming webhooks recover on 5xx only.
pub fn classify(status: u16) -> Result<(), NotifyError> {
    if status / 100 == 2 {
        return Ok(());
    }
    let message = format!("unexpected status code {status}");
    if status / 100 == 5 {
        Err(NotifyError::retryable(message))
    } else {
        Err(NotifyError::fatal(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alertmux_common::alert::LabelSet;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> NotifyContext {
        let mut group_labels = LabelSet::new();
        group_labels.insert("alertname".into(), "HighLoad".into());
        NotifyContext {
            group_key: "g".into(),
            receiver_name: "team-x".into(),
            group_labels,
            repeat_interval: Duration::from_secs(60),
            cancel: CancellationToken::new(),
        }
    }

    fn firing_alert() -> Alert {
        let mut labels: LabelSet = BTreeMap::new();
        labels.insert("alertname".into(), "HighLoad".into());
        Alert {
            labels,
            annotations: BTreeMap::new(),
            starts_at: 100,
            ends_at: 0,
            generator_url: String::new(),
        }
    }

    fn notifier(conf: SlackConfig) -> SlackNotifier {
        SlackNotifier::new(
            conf,
            HttpClientConfig::default(),
            Arc::new(Renderer::new("")),
        )
    }

    #[test]
    fn single_attachment_with_mrkdwn_fields() {
        let conf: SlackConfig =
            serde_yaml::from_str("api_url: https://hooks.slack.com/services/x\n").unwrap();
        let req = notifier(conf).build_request(&ctx(), &[firing_alert()]).unwrap();
        assert_eq!(req.attachments.len(), 1);
        assert_eq!(
            req.attachments[0].mrkdwn_in,
            vec!["fallback", "pretext", "text"]
        );
        assert_eq!(req.attachments[0].title, "[firing] HighLoad");
    }

    #[test]
    fn field_short_overrides_receiver_default() {
        let conf: SlackConfig = serde_yaml::from_str(
            r#"
api_url: https://hooks.slack.com/services/x
short_fields: true
fields:
  - title: a
    value: v
  - title: b
    value: v
    short: false
"#,
        )
        .unwrap();
        let req = notifier(conf).build_request(&ctx(), &[firing_alert()]).unwrap();
        let fields = &req.attachments[0].fields;
        assert!(fields[0].short);
        assert!(!fields[1].short);
    }

    #[test]
    fn classifier() {
        assert!(classify(200).is_ok());
        assert!(classify(503).unwrap_err().retryable);
        assert!(!classify(404).unwrap_err().retryable);
    }
}
