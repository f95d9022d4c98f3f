//! Per-tenant rendering. Two handlebars registries back every templated
//! receiver field: a text registry that leaves output untouched and an HTML
//! registry with entity escaping, mirroring the text/HTML renderer split the
//! providers expect.

use std::path::Path;

use handlebars::Handlebars;
use serde::Serialize;
use thiserror::Error;

use alertmux_common::alert::{batch_status, Alert, AlertStatus, LabelSet};

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template render failed: {0}")]
    Render(#[from] handlebars::RenderError),
    #[error("invalid template: {0}")]
    Parse(#[from] Box<handlebars::TemplateError>),
    #[error("failed to read template file: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Renderer {
    text: Handlebars<'static>,
    html: Handlebars<'static>,
    pub external_url: String,
}

impl Renderer {
    pub fn new(external_url: impl Into<String>) -> Self {
        let mut text = Handlebars::new();
        text.register_escape_fn(handlebars::no_escape);
        let html = Handlebars::new();
        Self {
            text,
            html,
            external_url: external_url.into(),
        }
    }

    /// Register a template file under its file stem so field templates can
    /// reference it as a partial.
    pub fn register_file(&mut self, name: &str, path: &Path) -> Result<(), TemplateError> {
        let content = std::fs::read_to_string(path)?;
        self.register_source(name, &content)
    }

    pub fn register_source(&mut self, name: &str, content: &str) -> Result<(), TemplateError> {
        self.text
            .register_template_string(name, content)
            .map_err(Box::new)?;
        self.html
            .register_template_string(name, content)
            .map_err(Box::new)?;
        Ok(())
    }

    pub fn data(
        &self,
        receiver: &str,
        group_labels: &LabelSet,
        alerts: &[Alert],
        now: i64,
    ) -> TemplateData {
        let status = batch_status(alerts, now);
        let alert_data: Vec<AlertData> = alerts
            .iter()
            .map(|a| AlertData {
                status: a.status_at(now),
                labels: a.labels.clone(),
                annotations: a.annotations.clone(),
                starts_at: a.starts_at,
                ends_at: a.ends_at,
                generator_url: a.generator_url.clone(),
            })
            .collect();
        TemplateData {
            receiver: receiver.to_string(),
            status,
            alerts: alert_data,
            group_labels: group_labels.clone(),
            common_labels: common_pairs(alerts, |a| &a.labels),
            common_annotations: common_pairs(alerts, |a| &a.annotations),
            external_url: self.external_url.clone(),
        }
    }

    pub fn execute_text(&self, tmpl: &str, data: &TemplateData) -> Result<String, TemplateError> {
        Ok(self.text.render_template(tmpl, data)?)
    }

    pub fn execute_html(&self, tmpl: &str, data: &TemplateData) -> Result<String, TemplateError> {
        Ok(self.html.render_template(tmpl, data)?)
    }

    /// Begin a latched render pass over `data`.
    pub fn latched<'a>(&'a self, data: &'a TemplateData) -> Rendered<'a> {
        Rendered {
            renderer: self,
            data,
            err: None,
        }
    }
}

/// The record exposed to templates and serialized into webhook bodies.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateData {
    pub receiver: String,
    pub status: AlertStatus,
    pub alerts: Vec<AlertData>,
    #[serde(rename = "groupLabels")]
    pub group_labels: LabelSet,
    #[serde(rename = "commonLabels")]
    pub common_labels: LabelSet,
    #[serde(rename = "commonAnnotations")]
    pub common_annotations: LabelSet,
    #[serde(rename = "externalURL")]
    pub external_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertData {
    pub status: AlertStatus,
    pub labels: LabelSet,
    pub annotations: LabelSet,
    #[serde(rename = "startsAt")]
    pub starts_at: i64,
    #[serde(rename = "endsAt")]
    pub ends_at: i64,
    #[serde(rename = "generatorURL")]
    pub generator_url: String,
}

/// Latched renderer: the first failure wins, every later call yields an
/// empty string, and `finish` surfaces the captured error exactly once.
pub struct Rendered<'a> {
    renderer: &'a Renderer,
    data: &'a TemplateData,
    err: Option<TemplateError>,
}

impl Rendered<'_> {
    pub fn text(&mut self, tmpl: &str) -> String {
        if self.err.is_some() {
            return String::new();
        }
        match self.renderer.execute_text(tmpl, self.data) {
            Ok(s) => s,
            Err(e) => {
                self.err = Some(e);
                String::new()
            }
        }
    }

    pub fn html(&mut self, tmpl: &str) -> String {
        if self.err.is_some() {
            return String::new();
        }
        match self.renderer.execute_html(tmpl, self.data) {
            Ok(s) => s,
            Err(e) => {
                self.err = Some(e);
                String::new()
            }
        }
    }

    pub fn finish(self) -> Result<(), TemplateError> {
        match self.err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn common_pairs<F>(alerts: &[Alert], select: F) -> LabelSet
where
    F: Fn(&Alert) -> &LabelSet,
{
    let Some(first) = alerts.first() else {
        return LabelSet::new();
    };
    let mut common: LabelSet = select(first).clone();
    for alert in &alerts[1..] {
        let labels = select(alert);
        common.retain(|k, v| labels.get(k) == Some(v));
    }
    common
}
