//! Notification templates
//!
//! Output templates are arbitrary user strings rendered with minijinja. A
//! fresh environment is built per render since templates are not
//! pre-registered. Rendering to an empty (or whitespace-only) string is an
//! error: an empty push is never what the user meant.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::{Alarm, AlarmEvent};
use crate::notify::NotifyError;

/// Fields available to every output template
#[derive(Debug, Clone, Serialize)]
pub struct NotificationContext {
    pub alarm_name: String,
    pub alarm_message: String,
    pub alarm_id: String,

    /// Wall-clock time, e.g. `3:04PM`
    pub timestamp: String,
    pub timestamp_unix: i64,

    /// Formatted measurement values, `k=v` pairs
    pub value: String,
    pub group_id: String,
    pub error: String,
    pub event: AlarmEvent,
}

impl NotificationContext {
    pub fn new(
        alarm: &Alarm,
        event: AlarmEvent,
        value: impl Into<String>,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            alarm_name: alarm.name.clone(),
            alarm_message: alarm.message.clone(),
            alarm_id: alarm.id.to_string(),
            timestamp: now.format("%-I:%M%p").to_string(),
            timestamp_unix: now.timestamp(),
            value: value.into(),
            group_id: alarm.group.clone(),
            error: error.unwrap_or_default().to_string(),
            event,
        }
    }
}

#[derive(Debug, Default)]
pub struct TemplateRenderer {
    _private: (),
}

impl TemplateRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    fn build_env() -> minijinja::Environment<'static> {
        let mut env = minijinja::Environment::new();
        env.add_filter("round", round_filter);
        env
    }

    pub fn render(&self, template: &str, ctx: &NotificationContext) -> Result<String, NotifyError> {
        let env = Self::build_env();
        let rendered = env
            .render_str(template, ctx)
            .map_err(|e| NotifyError::Template(e.to_string()))?;

        if rendered.trim().is_empty() {
            return Err(NotifyError::Template(format!(
                "template '{template}' rendered to an empty message"
            )));
        }
        Ok(rendered)
    }

    /// Check syntax without rendering
    pub fn validate(&self, template: &str) -> Result<(), NotifyError> {
        Self::build_env()
            .template_from_str(template)
            .map(|_| ())
            .map_err(|e| NotifyError::Template(e.to_string()))
    }
}

fn round_filter(value: f64, decimals: Option<u32>) -> String {
    format!("{:.prec$}", value, prec = decimals.unwrap_or(0) as usize)
}
