//! Notification dispatch
//!
//! For one alarm event: select the enabled outputs subscribed to it, render
//! each output's template, push it through the output's channel and record
//! the attempt. Outputs are independent; a failing template or channel is
//! recorded and the next output is still attempted.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Client;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::error::AlarmResult;
use crate::evaluator::format_values;
use crate::model::{Alarm, AlarmEvent, Output, OutputFilter};
use crate::notify::{NotificationContext, Notifier, Notify, NotifyError, TemplateRenderer};
use crate::storage::AlarmRepository;

/// Result of pushing one output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    pub output_id: Uuid,
    pub success: bool,

    /// Empty on success, the failure otherwise
    pub message: String,
}

pub struct NotificationDispatcher {
    repository: Arc<dyn AlarmRepository>,
    renderer: TemplateRenderer,
    client: Client,
}

impl NotificationDispatcher {
    pub fn new(repository: Arc<dyn AlarmRepository>, client: Client) -> Self {
        Self {
            repository,
            renderer: TemplateRenderer::new(),
            client,
        }
    }

    /// Push `event` to every matching output of `alarm`.
    ///
    /// Only the output lookup can fail the whole dispatch; per-output failures
    /// end up in the returned outcomes and the output history.
    #[instrument(skip(self, alarm, values, error), fields(alarm_id = %alarm.id, event = %event))]
    pub async fn dispatch(
        &self,
        alarm: &Alarm,
        event: AlarmEvent,
        values: &BTreeMap<String, f64>,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> AlarmResult<Vec<PushOutcome>> {
        let outputs = self
            .repository
            .find_outputs_for_alarm(alarm.id, OutputFilter::for_event(event))
            .await?;
        debug!("pushing {} outputs", outputs.len());

        let context = NotificationContext::new(alarm, event, format_values(values), error, now);

        let mut outcomes = Vec::with_capacity(outputs.len());
        for output in &outputs {
            let outcome = match self.push(output, event, &context).await {
                Ok(()) => PushOutcome {
                    output_id: output.id,
                    success: true,
                    message: String::new(),
                },
                Err(e) => {
                    warn!(output = %output.name, "failed to push output: {e}");
                    PushOutcome {
                        output_id: output.id,
                        success: false,
                        message: e.to_string(),
                    }
                }
            };

            if let Err(e) = self
                .repository
                .mark_output_pushed(output.id, outcome.success, &outcome.message, now)
                .await
            {
                error!(output = %output.name, "failed to mark output push: {e}");
            }

            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    async fn push(
        &self,
        output: &Output,
        event: AlarmEvent,
        context: &NotificationContext,
    ) -> Result<(), NotifyError> {
        let text = self.renderer.render(output.template(event), context)?;
        Notifier::new(self.client.clone(), output.channel.config.clone())
            .notify(&text)
            .await
    }
}
