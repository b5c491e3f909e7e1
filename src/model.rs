//! Alarm, history and output records
//!
//! `Alarm` owns its compiled expression: the rewritten condition is parsed
//! once on first use and cached for the lifetime of the value, so each tick
//! only binds variables.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AlarmError, AlarmResult, ExpressionError};
use crate::expression::Expression;
use crate::filter::{self, Filter};
use crate::notify::ChannelConfig;
use crate::series::{aggregate, retention};
use crate::state::AlarmState;
use crate::util::{chrono_duration, duration_secs};

/// Parsed condition stored alongside the alarm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmFilter {
    pub filters: Vec<Filter>,

    /// Condition with every filter replaced by its simplified identifier
    pub expression: String,

    /// Debounce window: consecutive points that must all match before firing
    pub trigger: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alarm {
    pub id: Uuid,
    pub owner: String,
    pub name: String,
    pub info: String,
    pub message: String,
    pub group: String,
    pub enabled: bool,
    pub fired: bool,
    pub filter: AlarmFilter,
    #[serde(with = "duration_secs")]
    pub run_interval: Duration,
    pub last_run: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Oldest first. Only loaded on demand by the repository.
    #[serde(default)]
    pub history: Vec<AlarmHistory>,

    #[serde(skip)]
    pub(crate) compiled: OnceLock<Result<Arc<Expression>, ExpressionError>>,
}

impl Alarm {
    /// Compiled boolean expression, parsed on first access
    pub fn expression(&self) -> AlarmResult<Arc<Expression>> {
        self.compiled
            .get_or_init(|| Expression::parse(&self.filter.expression).map(Arc::new))
            .clone()
            .map_err(AlarmError::from)
    }

    pub fn state(&self) -> AlarmState {
        if self.fired {
            AlarmState::Fired
        } else {
            AlarmState::Idle
        }
    }

    /// Enabled and `now >= last_run + max(run_interval, min_interval)`.
    /// A next run past the representable range is never due.
    pub fn is_due(&self, now: DateTime<Utc>, min_interval: Duration) -> bool {
        let wait = self.run_interval.max(min_interval);
        self.enabled
            && self
                .last_run
                .checked_add_signed(chrono_duration(wait))
                .is_some_and(|next| now >= next)
    }

    /// Time window the debounce evaluation looks at
    pub fn window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let trigger = u32::try_from(self.filter.trigger).unwrap_or(u32::MAX);
        let span = self.run_interval.saturating_mul(trigger);
        let from = now
            .checked_sub_signed(chrono_duration(span))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        (from, now)
    }

    pub fn open_history(&self) -> Option<&AlarmHistory> {
        self.history.iter().find(|entry| !entry.cleared)
    }

    /// Open a new history entry. Fails if one is already open.
    pub fn fire(&mut self, value: impl Into<String>, at: DateTime<Utc>) -> AlarmResult<AlarmHistory> {
        if self.open_history().is_some() {
            return Err(AlarmError::Conflict(self.id.to_string()));
        }

        let entry = AlarmHistory::open(self.id, value, at);
        self.history.push(entry.clone());
        self.fired = true;
        self.updated_at = at;
        Ok(entry)
    }

    /// Close the open history entry. Fails if there is none.
    pub fn clear(&mut self, at: DateTime<Utc>) -> AlarmResult<AlarmHistory> {
        let id = self.id;
        let entry = self
            .history
            .iter_mut()
            .find(|entry| !entry.cleared)
            .ok_or_else(|| AlarmError::NotFound(format!("open history entry for alarm {id}")))?;

        entry.cleared = true;
        entry.cleared_at = Some(at);
        let entry = entry.clone();

        self.fired = false;
        self.updated_at = at;
        Ok(entry)
    }

    pub(crate) fn from_parts(
        id: Uuid,
        owner: String,
        new: NewAlarm,
        filter: AlarmFilter,
        compiled: OnceLock<Result<Arc<Expression>, ExpressionError>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            owner,
            name: new.name,
            info: new.info,
            message: new.message,
            group: new.group,
            enabled: new.enabled,
            fired: false,
            filter,
            run_interval: Duration::from_secs(new.interval),
            last_run: now,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
            compiled,
        }
    }
}

impl PartialEq for Alarm {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.owner == other.owner
            && self.name == other.name
            && self.info == other.info
            && self.message == other.message
            && self.group == other.group
            && self.enabled == other.enabled
            && self.fired == other.fired
            && self.filter == other.filter
            && self.run_interval == other.run_interval
            && self.last_run == other.last_run
            && self.history == other.history
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmHistory {
    pub id: Uuid,
    pub alarm_id: Uuid,

    /// Formatted measurement snapshot at fire time
    pub value: String,
    pub cleared: bool,
    pub fired_at: DateTime<Utc>,
    pub cleared_at: Option<DateTime<Utc>>,
}

impl AlarmHistory {
    pub fn open(alarm_id: Uuid, value: impl Into<String>, fired_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            alarm_id,
            value: value.into(),
            cleared: false,
            fired_at,
            cleared_at: None,
        }
    }
}

/// User input for a new alarm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAlarm {
    pub name: String,
    #[serde(default)]
    pub info: String,
    pub group: String,
    #[serde(default)]
    pub message: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Evaluation cadence in seconds
    pub interval: u64,

    /// Consecutive positive evaluations before firing
    pub trigger: usize,

    /// Condition, e.g. `mean(temperature) - max(humidity) > 10`
    pub filter: String,
}

/// Longest accepted evaluation cadence: one year
pub const MAX_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

fn default_enabled() -> bool {
    true
}

impl NewAlarm {
    /// Validate, parse and compile into a storable alarm
    pub fn into_alarm(self, owner: impl Into<String>) -> AlarmResult<Alarm> {
        if self.name.trim().is_empty() {
            return Err(AlarmError::Validation("name is required".to_string()));
        }
        if self.interval == 0 || self.interval > MAX_INTERVAL_SECS {
            return Err(AlarmError::Validation(format!(
                "interval must be between 1 and {MAX_INTERVAL_SECS} seconds"
            )));
        }
        if self.trigger == 0 || self.trigger > retention::MAX_POINTS {
            return Err(AlarmError::Validation(format!(
                "trigger must be between 1 and {}",
                retention::MAX_POINTS
            )));
        }

        let parsed = filter::parse_condition(&self.filter)?;
        for filter in &parsed.filters {
            aggregate::validate_filter(filter)?;
        }
        let expression = Expression::parse(&parsed.expression)
            .map_err(|e| AlarmError::Parse(format!("'{}': {e}", self.filter)))?;

        let alarm_filter = AlarmFilter {
            filters: parsed.filters,
            expression: parsed.expression,
            trigger: self.trigger,
        };

        Ok(Alarm::from_parts(
            Uuid::new_v4(),
            owner.into(),
            self,
            alarm_filter,
            OnceLock::from(Ok(Arc::new(expression))),
            Utc::now(),
        ))
    }
}

/// Event class a notification is sent for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmEvent {
    Fire,
    Clear,
    Error,
}

impl fmt::Display for AlarmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlarmEvent::Fire => "fire",
            AlarmEvent::Clear => "clear",
            AlarmEvent::Error => "error",
        })
    }
}

/// Configured notification transport, owned by a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputChannel {
    pub id: Uuid,
    pub owner: String,
    pub name: String,
    pub config: ChannelConfig,
}

impl OutputChannel {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, config: ChannelConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            name: name.into(),
            config,
        }
    }
}

/// Binds an alarm to a channel with per-event templates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub id: Uuid,
    pub alarm_id: Uuid,
    pub name: String,
    pub fire_template: String,
    pub clear_template: String,
    pub error_template: String,
    pub channel: OutputChannel,
    pub enabled: bool,
    pub on_fire: bool,
    pub on_clear: bool,
    pub on_error: bool,
    pub last_pushed: Option<DateTime<Utc>>,
}

impl Output {
    /// Enabled output subscribed to every event class
    pub fn new(alarm_id: Uuid, name: impl Into<String>, channel: OutputChannel) -> Self {
        Self {
            id: Uuid::new_v4(),
            alarm_id,
            name: name.into(),
            fire_template: "{{ alarm_name }} fired: {{ value }}".to_string(),
            clear_template: "{{ alarm_name }} cleared".to_string(),
            error_template: "{{ alarm_name }} failed: {{ error }}".to_string(),
            channel,
            enabled: true,
            on_fire: true,
            on_clear: true,
            on_error: true,
            last_pushed: None,
        }
    }

    pub fn template(&self, event: AlarmEvent) -> &str {
        match event {
            AlarmEvent::Fire => &self.fire_template,
            AlarmEvent::Clear => &self.clear_template,
            AlarmEvent::Error => &self.error_template,
        }
    }

    pub fn subscribed(&self, event: AlarmEvent) -> bool {
        match event {
            AlarmEvent::Fire => self.on_fire,
            AlarmEvent::Clear => self.on_clear,
            AlarmEvent::Error => self.on_error,
        }
    }
}

/// Selects outputs for an event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputFilter {
    pub only_enabled: bool,
    pub event: Option<AlarmEvent>,
}

impl OutputFilter {
    /// Enabled outputs subscribed to `event`
    pub fn for_event(event: AlarmEvent) -> Self {
        Self {
            only_enabled: true,
            event: Some(event),
        }
    }

    pub fn matches(&self, output: &Output) -> bool {
        if self.only_enabled && !output.enabled {
            return false;
        }
        self.event.is_none_or(|event| output.subscribed(event))
    }
}

/// Record of one push attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputHistory {
    pub output_id: Uuid,
    pub success: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}
