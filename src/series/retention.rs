//! Retention policies and grouping-interval resolution
//!
//! Policies are ordered by ascending duration. A read picks the first policy
//! whose duration covers `now - from`, then groups points so that the result
//! never exceeds [`MAX_POINTS`] and never samples finer than the policy keeps.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AlarmError, AlarmResult};
use crate::util::duration_secs;

/// Hard cap on points per series, whatever the caller asks for
pub const MAX_POINTS: usize = 300;

const DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub name: String,

    /// How long data is kept
    #[serde(with = "duration_secs")]
    pub duration: Duration,

    /// Granularity of the stored data; zero for raw points
    #[serde(with = "duration_secs")]
    pub sampling_rate: Duration,
}

impl RetentionPolicy {
    pub fn new(name: impl Into<String>, duration: Duration, sampling_rate: Duration) -> Self {
        Self {
            name: name.into(),
            duration,
            sampling_rate,
        }
    }
}

pub fn default_retentions() -> Vec<RetentionPolicy> {
    vec![
        RetentionPolicy::new("1-day", Duration::from_secs(DAY), Duration::ZERO),
        RetentionPolicy::new(
            "6-months",
            Duration::from_secs(182 * DAY),
            Duration::from_secs(30 * 60),
        ),
        RetentionPolicy::new(
            "3-years",
            Duration::from_secs(3 * 365 * DAY),
            Duration::from_secs(DAY),
        ),
    ]
}

/// Policies must be strictly ascending by duration
pub fn validate_order(policies: &[RetentionPolicy]) -> AlarmResult<()> {
    if policies.is_empty() {
        return Err(AlarmError::Validation(
            "no retention policies defined".to_string(),
        ));
    }
    for pair in policies.windows(2) {
        if pair[0].duration >= pair[1].duration {
            return Err(AlarmError::Validation(format!(
                "retention '{}' must be shorter than '{}'",
                pair[0].name, pair[1].name
            )));
        }
    }
    Ok(())
}

/// First policy whose duration covers `now - from`
pub fn select_policy<'a>(
    policies: &'a [RetentionPolicy],
    from: DateTime<Utc>,
    now: DateTime<Utc>,
) -> AlarmResult<&'a RetentionPolicy> {
    let requested = (now - from).to_std().unwrap_or(Duration::ZERO);

    policies
        .iter()
        .find(|policy| policy.duration >= requested)
        .ok_or(AlarmError::Range { requested })
}

/// `max((to - from) / min(n, max_points), sampling_rate)`, at least one second
pub fn group_by_interval(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    n: usize,
    max_points: usize,
    policy: &RetentionPolicy,
) -> Duration {
    let points = n.clamp(1, max_points.max(1)) as u32;
    let span = (to - from).to_std().unwrap_or(Duration::ZERO);
    let interval = span / points;

    let interval = if interval < policy.sampling_rate {
        debug!(
            "querying with interval of {:?}, but retention '{}' keeps {:?}, using the latter",
            interval, policy.name, policy.sampling_rate
        );
        policy.sampling_rate
    } else {
        interval
    };

    interval.max(Duration::from_secs(1))
}
