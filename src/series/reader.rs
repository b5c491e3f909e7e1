//! Time-series reader
//!
//! Resolves the retention policy and grouping interval for a request, issues
//! one sub-query per filter and assembles the results into a [`Batch`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, trace};

use crate::error::{AlarmError, AlarmResult};
use crate::filter::Filter;
use crate::series::retention::{self, RetentionPolicy};
use crate::series::{Batch, Series, Source};
use crate::storage::MeasurementStore;

/// Fully resolved query handed to a [`MeasurementStore`]
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesQuery {
    pub source: Source,
    pub filters: Vec<Filter>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,

    /// Grouping interval, never below one second
    pub interval: Duration,

    /// Maximum points per series, never above the configured cap
    pub limit: usize,

    /// Name of the retention policy the query reads from
    pub retention: String,
}

pub struct TimeSeriesReader {
    store: Arc<dyn MeasurementStore>,
    retentions: Vec<RetentionPolicy>,
    max_points: usize,
}

impl TimeSeriesReader {
    pub fn new(store: Arc<dyn MeasurementStore>, retentions: Vec<RetentionPolicy>) -> Self {
        Self {
            store,
            retentions,
            max_points: retention::MAX_POINTS,
        }
    }

    /// Lower the per-series cap; values above [`retention::MAX_POINTS`] are clamped
    pub fn with_max_points(mut self, max_points: usize) -> Self {
        self.max_points = max_points.clamp(1, retention::MAX_POINTS);
        self
    }

    /// Resolve retention policy, interval and limit for a read at `now`
    pub fn plan(
        &self,
        source: Source,
        filters: &[Filter],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        n: usize,
        now: DateTime<Utc>,
    ) -> AlarmResult<SeriesQuery> {
        if from > to {
            return Err(AlarmError::Validation(
                "query time range has to be positive".to_string(),
            ));
        }

        let policy = retention::select_policy(&self.retentions, from, now)?;
        let interval = retention::group_by_interval(from, to, n, self.max_points, policy);

        Ok(SeriesQuery {
            source,
            filters: filters.to_vec(),
            from,
            to,
            interval,
            limit: n.min(self.max_points),
            retention: policy.name.clone(),
        })
    }

    /// Read `n` aligned points per filter between `from` and `to`
    #[instrument(skip(self, filters), fields(source = %source, filters = filters.len()))]
    pub async fn read(
        &self,
        source: Source,
        filters: &[Filter],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        n: usize,
    ) -> AlarmResult<Batch> {
        let query = self.plan(source, filters, from, to, n, Utc::now())?;
        debug!(
            "reading {} filters from '{}' grouped by {:?}",
            query.filters.len(),
            query.retention,
            query.interval
        );

        let results = self.store.query(&query).await?;
        assemble_batch(&query.filters, results)
    }
}

/// Key sub-query results by simplified identifier; results follow filter order.
///
/// Every filter gets an entry, empty when the store had no points for it.
/// Series are aligned: only timestamps present in every series are kept, so
/// equal tail indices always refer to the same bucket.
pub fn assemble_batch(filters: &[Filter], results: Vec<Series>) -> AlarmResult<Batch> {
    if filters.len() != results.len() {
        return Err(AlarmError::Consistency {
            expected: filters.len(),
            actual: results.len(),
        });
    }

    let mut batch: Batch = filters
        .iter()
        .map(Filter::simplified)
        .zip(results)
        .collect();
    align(&mut batch);
    Ok(batch)
}

fn align(batch: &mut Batch) {
    let mut series = batch.values();
    let Some(first) = series.next() else {
        return;
    };

    let mut common: BTreeSet<DateTime<Utc>> = first.iter().map(|p| p.timestamp).collect();
    for other in series {
        let timestamps: BTreeSet<DateTime<Utc>> = other.iter().map(|p| p.timestamp).collect();
        common.retain(|ts| timestamps.contains(ts));
    }

    for (name, series) in batch.iter_mut() {
        let before = series.len();
        series.retain(|point| common.contains(&point.timestamp));
        if series.len() < before {
            trace!("dropped {} unaligned points from '{name}'", before - series.len());
        }
    }
}
