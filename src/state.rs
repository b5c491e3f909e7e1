//! Fire/clear state machine
//!
//! `Idle --true--> Fired` opens a history entry, `Fired --false--> Idle`
//! closes it. Self-transitions are no-ops. The decision is pure; applying it
//! (and guarding the open-history invariant) is the repository's job.

use serde::{Deserialize, Serialize};

use crate::model::AlarmEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmState {
    Idle,
    Fired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Fire,
    Clear,
    Stay,
}

impl AlarmState {
    pub fn transition(self, condition: bool) -> Transition {
        match (self, condition) {
            (AlarmState::Idle, true) => Transition::Fire,
            (AlarmState::Fired, false) => Transition::Clear,
            _ => Transition::Stay,
        }
    }
}

impl Transition {
    /// Notification event emitted by this transition, if any
    pub fn event(self) -> Option<AlarmEvent> {
        match self {
            Transition::Fire => Some(AlarmEvent::Fire),
            Transition::Clear => Some(AlarmEvent::Clear),
            Transition::Stay => None,
        }
    }
}
