//! Time-series points, retention resolution and the batch reader
//!
//! A [`Batch`] maps each filter's simplified identifier to a time-ascending
//! [`Series`]. The reader aligns the series of one batch on their shared
//! timestamps; the evaluator never resamples.

pub mod aggregate;
pub mod reader;
pub mod retention;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use reader::{SeriesQuery, TimeSeriesReader, assemble_batch};
pub use retention::RetentionPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl Point {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

pub type Series = Vec<Point>;

pub type Batch = BTreeMap<String, Series>;

/// Whose measurements a query reads
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Device(String),
    Group(String),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Device(device) => write!(f, "device '{device}'"),
            Source::Group(group) => write!(f, "group '{group}'"),
        }
    }
}
