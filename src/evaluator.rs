//! Debounced series evaluation
//!
//! An alarm fires only when the last `limit` aligned points of every series
//! all satisfy the condition. Evaluation stops at the first point that does
//! not; values are snapshotted from the last point only.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{AlarmError, AlarmResult};
use crate::expression::Expression;
use crate::series::Batch;

/// Outcome of one evaluation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Valuation {
    pub fired: bool,

    /// Value of every identifier at the last evaluated point; empty unless fired
    pub values: BTreeMap<String, f64>,
}

impl Valuation {
    fn not_fired() -> Self {
        Self::default()
    }
}

/// Evaluate `expression` over the most recent `limit` points of each series.
///
/// Fails with [`AlarmError::InsufficientData`] when the batch is empty or any
/// series is shorter than `limit`, and with [`AlarmError::Expression`] when
/// the expression cannot be evaluated at some point.
pub fn valuate_series(expression: &Expression, batch: &Batch, limit: usize) -> AlarmResult<Valuation> {
    if limit == 0 {
        return Err(AlarmError::Validation(
            "trigger must be at least 1".to_string(),
        ));
    }

    let available = batch.values().map(Vec::len).min().unwrap_or(0);
    if available < limit {
        return Err(AlarmError::InsufficientData {
            needed: limit,
            available,
        });
    }

    for ts in 0..limit {
        let lookup = |name: &str| {
            batch
                .get(name)
                .map(|series| series[series.len() - limit + ts].value)
        };

        if !expression.evaluate_bool(lookup)? {
            return Ok(Valuation::not_fired());
        }
    }

    let values = batch
        .iter()
        .filter_map(|(name, series)| series.last().map(|point| (name.clone(), point.value)))
        .collect();

    Ok(Valuation {
        fired: true,
        values,
    })
}

/// `k=v` pairs with two decimals, space separated, in identifier order
pub fn format_values(values: &BTreeMap<String, f64>) -> String {
    values
        .iter()
        .map(|(name, value)| format!("{name}={value:.2}"))
        .collect::<Vec<_>>()
        .join(" ")
}
