//! Selectors and transformations over raw measurement points
//!
//! Backends without a native query engine use [`execute`] to turn raw points
//! into the grouped series a filter describes:
//!
//! 1. keep points inside `[from, to]`, with `from` moved back by the buckets
//!    the transformation consumes before its first output
//! 2. bucket them by the grouping interval, aligned to the Unix epoch
//! 3. reduce each bucket with the selector; empty buckets are dropped
//! 4. apply the transformation, if any, and drop outputs before `from`'s bucket
//! 5. keep the most recent `limit` points

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::{AlarmError, AlarmResult};
use crate::filter::Filter;
use crate::series::{Point, Series, SeriesQuery};
use crate::util::chrono_duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    Mean,
    Max,
    Min,
    Sum,
    Count,
    First,
    Last,
    Median,
    Spread,
    Stddev,
}

impl FromStr for Selector {
    type Err = AlarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "mean" => Selector::Mean,
            "max" => Selector::Max,
            "min" => Selector::Min,
            "sum" => Selector::Sum,
            "count" => Selector::Count,
            "first" => Selector::First,
            "last" => Selector::Last,
            "median" => Selector::Median,
            "spread" => Selector::Spread,
            "stddev" => Selector::Stddev,
            other => return Err(AlarmError::Parse(format!("unknown selector '{other}'"))),
        })
    }
}

impl Selector {
    /// Reduce one bucket. `values` are in time order.
    pub fn apply(self, values: &[f64]) -> Option<f64> {
        let first = *values.first()?;
        let count = values.len() as f64;

        match self {
            Selector::Mean => Some(values.iter().sum::<f64>() / count),
            Selector::Max => Some(values.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
            Selector::Min => Some(values.iter().copied().fold(f64::INFINITY, f64::min)),
            Selector::Sum => Some(values.iter().sum()),
            Selector::Count => Some(count),
            Selector::First => Some(first),
            Selector::Last => values.last().copied(),
            Selector::Median => {
                let mut sorted = values.to_vec();
                sorted.sort_by(f64::total_cmp);
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    Some((sorted[mid - 1] + sorted[mid]) / 2.0)
                } else {
                    Some(sorted[mid])
                }
            }
            Selector::Spread => {
                let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                Some(max - min)
            }
            Selector::Stddev => {
                // sample deviation, undefined for a single point
                if values.len() < 2 {
                    return None;
                }
                let mean = values.iter().sum::<f64>() / count;
                let variance =
                    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1.0);
                Some(variance.sqrt())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transformation {
    /// Rate of change per `param` seconds (default 1)
    Derivative,
    NonNegativeDerivative,
    Difference,
    /// Mean over the last `param` points (default 2)
    MovingAverage,
    CumulativeSum,
}

impl FromStr for Transformation {
    type Err = AlarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "derivative" => Transformation::Derivative,
            "non_negative_derivative" => Transformation::NonNegativeDerivative,
            "difference" => Transformation::Difference,
            "moving_average" => Transformation::MovingAverage,
            "cumulative_sum" => Transformation::CumulativeSum,
            other => {
                return Err(AlarmError::Parse(format!(
                    "unknown transformation '{other}'"
                )));
            }
        })
    }
}

impl Transformation {
    fn takes_parameter(self) -> bool {
        matches!(
            self,
            Transformation::Derivative
                | Transformation::NonNegativeDerivative
                | Transformation::MovingAverage
        )
    }

    /// Input buckets consumed before the first output point
    pub fn lookback(self, param: Option<i64>) -> u32 {
        match self {
            Transformation::Derivative
            | Transformation::NonNegativeDerivative
            | Transformation::Difference => 1,
            Transformation::MovingAverage => {
                u32::try_from(param.unwrap_or(2).max(1) - 1).unwrap_or(u32::MAX)
            }
            Transformation::CumulativeSum => 0,
        }
    }

    pub fn apply(self, series: &[Point], param: Option<i64>) -> Series {
        match self {
            Transformation::Derivative | Transformation::NonNegativeDerivative => {
                let unit = param.unwrap_or(1).max(1) as f64;
                series
                    .windows(2)
                    .filter_map(|pair| {
                        let elapsed = (pair[1].timestamp - pair[0].timestamp).num_milliseconds();
                        if elapsed <= 0 {
                            return None;
                        }
                        let rate = (pair[1].value - pair[0].value) * unit * 1000.0 / elapsed as f64;
                        if self == Transformation::NonNegativeDerivative && rate < 0.0 {
                            return None;
                        }
                        Some(Point::new(pair[1].timestamp, rate))
                    })
                    .collect()
            }
            Transformation::Difference => series
                .windows(2)
                .map(|pair| Point::new(pair[1].timestamp, pair[1].value - pair[0].value))
                .collect(),
            Transformation::MovingAverage => {
                let window = param.unwrap_or(2).max(1) as usize;
                series
                    .windows(window)
                    .map(|points| {
                        let sum: f64 = points.iter().map(|p| p.value).sum();
                        Point::new(points[window - 1].timestamp, sum / window as f64)
                    })
                    .collect()
            }
            Transformation::CumulativeSum => {
                let mut total = 0.0;
                series
                    .iter()
                    .map(|point| {
                        total += point.value;
                        Point::new(point.timestamp, total)
                    })
                    .collect()
            }
        }
    }
}

/// Reject filters naming unknown functions or carrying unusable parameters
pub fn validate_filter(filter: &Filter) -> AlarmResult<()> {
    Selector::from_str(&filter.selector)?;

    let Some(name) = &filter.transformation else {
        return Ok(());
    };
    let transformation = Transformation::from_str(name)?;

    match filter.param {
        Some(_) if !transformation.takes_parameter() => Err(AlarmError::Parse(format!(
            "'{name}' does not take a parameter"
        ))),
        Some(param) if param < 1 => Err(AlarmError::Parse(format!(
            "'{name}' parameter must be positive, got {param}"
        ))),
        _ => Ok(()),
    }
}

/// Group raw points by an epoch-aligned interval of `interval_secs`
pub fn bucket(
    raw: &[Point],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    interval_secs: i64,
) -> BTreeMap<i64, Vec<f64>> {
    let interval_secs = interval_secs.max(1);
    let mut buckets: BTreeMap<i64, Vec<f64>> = BTreeMap::new();

    for point in raw.iter().filter(|p| p.timestamp >= from && p.timestamp <= to) {
        let start = point.timestamp.timestamp().div_euclid(interval_secs) * interval_secs;
        buckets.entry(start).or_default().push(point.value);
    }

    buckets
}

/// Raw-point range a filter reads: the query window, widened by the
/// transformation's lookback in grouping intervals
pub fn raw_range(filter: &Filter, query: &SeriesQuery) -> (DateTime<Utc>, DateTime<Utc>) {
    let lookback = filter
        .transformation
        .as_deref()
        .and_then(|name| Transformation::from_str(name).ok())
        .map_or(0, |transformation| transformation.lookback(filter.param));

    let widen = chrono_duration(query.interval.saturating_mul(lookback));
    let from = query
        .from
        .checked_sub_signed(widen)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    (from, query.to)
}

/// Run one filter of a query against raw, time-ordered points
///
/// `raw` may start earlier than the query window; see [`raw_range`].
pub fn execute(filter: &Filter, raw: &[Point], query: &SeriesQuery) -> AlarmResult<Series> {
    let selector = Selector::from_str(&filter.selector)?;
    let transformation = filter
        .transformation
        .as_deref()
        .map(Transformation::from_str)
        .transpose()?;

    let interval_secs = i64::try_from(query.interval.as_secs())
        .unwrap_or(i64::MAX)
        .max(1);
    let (from, to) = raw_range(filter, query);
    let grouped: Series = bucket(raw, from, to, interval_secs)
        .into_iter()
        .filter_map(|(start, values)| {
            let timestamp = DateTime::from_timestamp(start, 0)?;
            selector
                .apply(&values)
                .map(|value| Point::new(timestamp, value))
        })
        .collect();

    let mut series = match transformation {
        Some(transformation) => {
            let first_bucket = query.from.timestamp().div_euclid(interval_secs) * interval_secs;
            let mut series = transformation.apply(&grouped, filter.param);
            series.retain(|point| point.timestamp.timestamp() >= first_bucket);
            series
        }
        None => grouped,
    };

    if series.len() > query.limit {
        series.drain(..series.len() - query.limit);
    }

    Ok(series)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::Source;
    use chrono::TimeZone;
    use std::time::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn points(values: &[(i64, f64)]) -> Series {
        values.iter().map(|&(t, v)| Point::new(at(t), v)).collect()
    }

    #[test]
    fn test_selectors() {
        let values = [4.0, 1.0, 3.0, 2.0];
        assert_eq!(Selector::Mean.apply(&values), Some(2.5));
        assert_eq!(Selector::Max.apply(&values), Some(4.0));
        assert_eq!(Selector::Min.apply(&values), Some(1.0));
        assert_eq!(Selector::Sum.apply(&values), Some(10.0));
        assert_eq!(Selector::Count.apply(&values), Some(4.0));
        assert_eq!(Selector::First.apply(&values), Some(4.0));
        assert_eq!(Selector::Last.apply(&values), Some(2.0));
        assert_eq!(Selector::Median.apply(&values), Some(2.5));
        assert_eq!(Selector::Median.apply(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(Selector::Spread.apply(&values), Some(3.0));
        assert_eq!(Selector::Stddev.apply(&[2.0, 4.0]), Some(2.0_f64.sqrt()));
        assert_eq!(Selector::Stddev.apply(&[2.0]), None);
        assert_eq!(Selector::Mean.apply(&[]), None);
    }

    #[test]
    fn test_transformations() {
        let series = points(&[(0, 1.0), (10, 3.0), (20, 2.0), (30, 6.0)]);

        let derivative = Transformation::Derivative.apply(&series, Some(10));
        let values: Vec<f64> = derivative.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![2.0, -1.0, 4.0]);
        assert_eq!(derivative[0].timestamp, at(10));

        let values: Vec<f64> = Transformation::NonNegativeDerivative
            .apply(&series, None)
            .iter()
            .map(|p| p.value)
            .collect();
        assert_eq!(values, vec![0.2, 0.4]);

        let values: Vec<f64> = Transformation::Difference
            .apply(&series, None)
            .iter()
            .map(|p| p.value)
            .collect();
        assert_eq!(values, vec![2.0, -1.0, 4.0]);

        let values: Vec<f64> = Transformation::MovingAverage
            .apply(&series, Some(2))
            .iter()
            .map(|p| p.value)
            .collect();
        assert_eq!(values, vec![2.0, 2.5, 4.0]);

        let values: Vec<f64> = Transformation::CumulativeSum
            .apply(&series, None)
            .iter()
            .map(|p| p.value)
            .collect();
        assert_eq!(values, vec![1.0, 4.0, 6.0, 12.0]);
    }

    #[test]
    fn test_validate_filter() {
        assert!(validate_filter(&Filter::simple("mean", "t")).is_ok());
        assert!(validate_filter(&Filter::transformed("derivative", "max", "t", Some(60))).is_ok());
        assert!(validate_filter(&Filter::simple("avg", "t")).is_err());
        assert!(validate_filter(&Filter::transformed("diff", "mean", "t", Some(10))).is_err());
        assert!(validate_filter(&Filter::transformed("difference", "mean", "t", Some(10))).is_err());
        assert!(validate_filter(&Filter::transformed("moving_average", "mean", "t", Some(0))).is_err());
    }

    #[test]
    fn test_execute_groups_and_trims() {
        let base = at(0).timestamp();
        let offset = 60 - base.rem_euclid(60);
        let raw: Series = (0..10)
            .map(|i| Point::new(at(offset + i * 30), i as f64))
            .collect();

        let query = SeriesQuery {
            source: Source::Group("g".into()),
            filters: vec![Filter::simple("max", "t")],
            from: at(0),
            to: at(offset + 1000),
            interval: Duration::from_secs(60),
            limit: 3,
            retention: "1-day".into(),
        };

        let series = execute(&query.filters[0], &raw, &query).unwrap();
        let values: Vec<f64> = series.iter().map(|p| p.value).collect();
        // five buckets of two points each; the last three remain
        assert_eq!(values, vec![5.0, 7.0, 9.0]);
        assert!(series.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(series[0].timestamp.timestamp() % 60, 0);
    }

    #[test]
    fn test_execute_drops_points_outside_range() {
        let raw = points(&[(0, 1.0), (100, 50.0)]);
        let query = SeriesQuery {
            source: Source::Device("d".into()),
            filters: vec![Filter::simple("sum", "t")],
            from: at(50),
            to: at(200),
            interval: Duration::from_secs(1),
            limit: 10,
            retention: "1-day".into(),
        };
        let series = execute(&query.filters[0], &raw, &query).unwrap();
        assert_eq!(series, points(&[(100, 50.0)]));
    }

    #[test]
    fn test_transformed_filter_reads_lookback() {
        let base = at(0).timestamp();
        let offset = 60 - base.rem_euclid(60);
        // one point per minute, 10 minutes, rising by 2 each minute
        let raw: Series = (0..10)
            .map(|i| Point::new(at(offset + i * 60), 2.0 * i as f64))
            .collect();

        let query = |filter: Filter| SeriesQuery {
            source: Source::Group("g".into()),
            filters: vec![filter],
            from: at(offset + 7 * 60),
            to: at(offset + 9 * 60 + 30),
            interval: Duration::from_secs(60),
            limit: 3,
            retention: "1-day".into(),
        };

        let derivative = query(Filter::transformed("derivative", "mean", "t", Some(60)));
        let (from, to) = raw_range(&derivative.filters[0], &derivative);
        assert_eq!(from, at(offset + 6 * 60));
        assert_eq!(to, derivative.to);
        let series = execute(&derivative.filters[0], &raw, &derivative).unwrap();
        assert_eq!(series.iter().map(|p| p.value).collect::<Vec<_>>(), vec![2.0, 2.0, 2.0]);
        assert_eq!(series[0].timestamp, at(offset + 7 * 60));

        let moving = query(Filter::transformed("moving_average", "mean", "t", Some(3)));
        let series = execute(&moving.filters[0], &raw, &moving).unwrap();
        assert_eq!(series.iter().map(|p| p.value).collect::<Vec<_>>(), vec![12.0, 14.0, 16.0]);

        let difference = query(Filter::transformed("difference", "mean", "t", None));
        let series = execute(&difference.filters[0], &raw, &difference).unwrap();
        assert_eq!(series.len(), 3);

        // plain selectors keep the window as is
        let plain = query(Filter::simple("mean", "t"));
        assert_eq!(raw_range(&plain.filters[0], &plain).0, plain.from);
        assert_eq!(execute(&plain.filters[0], &raw, &plain).unwrap().len(), 3);
    }
}
