//! One evaluation pass over a batch of alarms
//!
//! For every alarm, in order:
//!
//! ```text
//! read series -> evaluate -> transition?
//!   Fire  -> repository.fire  -> dispatch fire
//!   Clear -> repository.clear -> dispatch clear
//!   Stay  -> nothing
//! soft error        -> skipped silently
//! user-facing error -> dispatch error
//! internal error    -> logged
//! always            -> update last run
//! ```
//!
//! Nothing spans the steps: a crash between them can leave an alarm fired but
//! not dispatched. The repository's fire/clear guards keep a repeated tick from
//! firing twice.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::dispatcher::NotificationDispatcher;
use crate::error::AlarmResult;
use crate::evaluator::{Valuation, format_values, valuate_series};
use crate::metrics::{
    ALARM_EVALUATE, ALARM_EVALUATION_TIME_US, ALARM_NOTIFICATION, ALARM_NOTIFICATION_CLEARED,
    ALARM_NOTIFICATION_ERROR, ALARM_NOTIFICATION_FIRED, MetricsSink,
};
use crate::model::{Alarm, AlarmEvent};
use crate::series::{Source, TimeSeriesReader};
use crate::state::Transition;
use crate::storage::AlarmRepository;

/// What happened to one alarm during a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Fired,
    Cleared,
    Unchanged,

    /// Not enough data yet
    Skipped,

    /// Condition could not be evaluated; an error notification was sent
    Errored,

    /// Internal failure, logged only
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// In visiting order
    pub outcomes: Vec<(Uuid, RunOutcome)>,
}

impl RunSummary {
    pub fn count(&self, outcome: RunOutcome) -> usize {
        self.outcomes.iter().filter(|(_, o)| *o == outcome).count()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

pub struct AlarmRunner {
    repository: Arc<dyn AlarmRepository>,
    reader: TimeSeriesReader,
    dispatcher: NotificationDispatcher,
    metrics: Arc<dyn MetricsSink>,
}

impl AlarmRunner {
    pub fn new(
        repository: Arc<dyn AlarmRepository>,
        reader: TimeSeriesReader,
        dispatcher: NotificationDispatcher,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            repository,
            reader,
            dispatcher,
            metrics,
        }
    }

    pub fn repository(&self) -> &Arc<dyn AlarmRepository> {
        &self.repository
    }

    /// Evaluate and dispatch every alarm sequentially.
    ///
    /// Failures stay inside the alarm they happened in.
    pub async fn run_alarms(&self, alarms: Vec<Alarm>) -> RunSummary {
        let mut summary = RunSummary::default();

        for alarm in &alarms {
            let outcome = self.run_alarm(alarm).await;
            summary.outcomes.push((alarm.id, outcome));
        }

        if !summary.is_empty() {
            info!(
                "ran {} alarms: {} fired, {} cleared, {} errored, {} failed",
                summary.len(),
                summary.count(RunOutcome::Fired),
                summary.count(RunOutcome::Cleared),
                summary.count(RunOutcome::Errored),
                summary.count(RunOutcome::Failed)
            );
        }
        summary
    }

    #[instrument(skip(self, alarm), fields(alarm_id = %alarm.id, alarm = %alarm.name))]
    pub async fn run_alarm(&self, alarm: &Alarm) -> RunOutcome {
        let started = Instant::now();

        let outcome = match self.valuate(alarm).await {
            Ok(valuation) => self.apply(alarm, valuation, Utc::now()).await,
            Err(e) if e.is_soft() => {
                debug!("skipping alarm: {e}");
                RunOutcome::Skipped
            }
            Err(e) if e.is_user_facing() => {
                warn!("alarm condition failed: {e}");
                let message = e.to_string();
                self.notify(alarm, AlarmEvent::Error, &Valuation::default(), Some(&message))
                    .await;
                self.metrics.counter_increase(ALARM_NOTIFICATION_ERROR, 1);
                self.metrics.counter_increase(ALARM_NOTIFICATION, 1);
                RunOutcome::Errored
            }
            Err(e) => {
                error!("failure running alarm: {e}");
                RunOutcome::Failed
            }
        };

        self.metrics.counter_increase(ALARM_EVALUATE, 1);
        self.metrics.counter_increase(
            ALARM_EVALUATION_TIME_US,
            u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
        );

        if let Err(e) = self.repository.update_last_run(alarm.id, Utc::now()).await {
            error!("failed to update last run: {e}");
        }

        outcome
    }

    /// Read the alarm's window and evaluate its condition
    pub async fn valuate(&self, alarm: &Alarm) -> AlarmResult<Valuation> {
        let expression = alarm.expression()?;
        let (from, to) = alarm.window(Utc::now());
        let trigger = alarm.filter.trigger;

        let batch = self
            .reader
            .read(
                Source::Group(alarm.group.clone()),
                &alarm.filter.filters,
                from,
                to,
                trigger,
            )
            .await?;

        valuate_series(&expression, &batch, trigger)
    }

    async fn apply(&self, alarm: &Alarm, valuation: Valuation, now: DateTime<Utc>) -> RunOutcome {
        let transition = alarm.state().transition(valuation.fired);
        let Some(event) = transition.event() else {
            return RunOutcome::Unchanged;
        };

        let changed = match transition {
            Transition::Fire => {
                debug!("alarm fired");
                self.repository
                    .fire(alarm.id, &format_values(&valuation.values), now)
                    .await
                    .map(|_| RunOutcome::Fired)
            }
            _ => {
                debug!("alarm cleared");
                self.repository
                    .clear(alarm.id, now)
                    .await
                    .map(|_| RunOutcome::Cleared)
            }
        };

        let outcome = match changed {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("failed to {event} alarm: {e}");
                return RunOutcome::Failed;
            }
        };

        self.notify(alarm, event, &valuation, None).await;

        let counter = match event {
            AlarmEvent::Fire => ALARM_NOTIFICATION_FIRED,
            _ => ALARM_NOTIFICATION_CLEARED,
        };
        self.metrics.counter_increase(counter, 1);
        self.metrics.counter_increase(ALARM_NOTIFICATION, 1);

        outcome
    }

    async fn notify(&self, alarm: &Alarm, event: AlarmEvent, valuation: &Valuation, error: Option<&str>) {
        if let Err(e) = self
            .dispatcher
            .dispatch(alarm, event, &valuation.values, error, Utc::now())
            .await
        {
            error!("failed to push outputs: {e}");
        }
    }
}
