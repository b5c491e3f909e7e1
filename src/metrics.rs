//! Counters reported by the evaluation loop

use std::collections::HashMap;
use std::sync::Mutex;

pub const ALARM_EVALUATE: &str = "alarm_evaluate";
pub const ALARM_NOTIFICATION: &str = "alarm_notification";
pub const ALARM_NOTIFICATION_FIRED: &str = "alarm_notification_fired";
pub const ALARM_NOTIFICATION_CLEARED: &str = "alarm_notification_cleared";
pub const ALARM_NOTIFICATION_ERROR: &str = "alarm_notification_error";
pub const ALARM_EVALUATION_TIME_US: &str = "alarm_evaluation_time_us";

pub trait MetricsSink: Send + Sync {
    fn counter_increase(&self, name: &str, value: u64);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn counter_increase(&self, _name: &str, _value: u64) {}
}

/// Keeps counters in memory
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .map(|counters| counters.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counters
            .lock()
            .map(|counters| counters.clone())
            .unwrap_or_default()
    }
}

impl MetricsSink for MemoryMetrics {
    fn counter_increase(&self, name: &str, value: u64) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(name.to_string()).or_insert(0) += value;
        }
    }
}
