//! Expression filter parser
//!
//! Turns a free-text alarm condition into structured [`Filter`] descriptors and
//! a rewritten expression in which every filter is replaced by its simplified
//! identifier:
//!
//! ```text
//! mean(temperature) - derivative(max(temperature),10) > 10
//!   → filters:    mean(temperature), derivative(max(temperature),10)
//!   → expression: mean_temperature-derivative_max_temperature>10
//! ```
//!
//! The condition is stripped of whitespace and split on operator characters.
//! Every candidate is matched against the transformed pattern first, then the
//! simple pattern. Candidates matching neither are dropped and reported in
//! [`ParsedCondition::dropped`].

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AlarmError, AlarmResult};

/// `mean(temperature)`
static SELECTOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z_]\w*)\((\w+)\)$").expect("selector pattern is valid")
});

/// `moving_average(mean(usage_system),10)`
static SELECTOR_AND_TRANSFORMATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z_]\w*)\(([A-Za-z_]\w*)\((\w+)\),?(\d+)?\)$")
        .expect("transformation pattern is valid")
});

static OPERATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-+=><*/%&|!]").expect("operator pattern is valid"));

/// How a filter renders: `sel(key)`, `tr(sel(key))` or `tr(sel(key),param)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    Simple,
    Transformed,
    TransformedParameter,
}

/// One clause of a user condition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    /// Aggregation function, e.g. `mean` or `max`
    pub selector: String,

    /// Optional transformation applied to the aggregated series, e.g. `derivative`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformation: Option<String>,

    /// Time-series field name
    pub key: String,

    /// Optional integer parameter of the transformation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<i64>,
}

impl Filter {
    pub fn simple(selector: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            transformation: None,
            key: key.into(),
            param: None,
        }
    }

    pub fn transformed(
        transformation: impl Into<String>,
        selector: impl Into<String>,
        key: impl Into<String>,
        param: Option<i64>,
    ) -> Self {
        Self {
            selector: selector.into(),
            transformation: Some(transformation.into()),
            key: key.into(),
            param,
        }
    }

    pub fn kind(&self) -> FilterKind {
        match (&self.transformation, self.param) {
            (None, _) => FilterKind::Simple,
            (Some(_), None) => FilterKind::Transformed,
            (Some(_), Some(_)) => FilterKind::TransformedParameter,
        }
    }

    /// Original form, as the user wrote it (without whitespace)
    pub fn original(&self) -> String {
        self.to_string()
    }

    /// Form with the key quoted, for storage-engine queries
    pub fn escaped(&self) -> String {
        self.render(&format!("\"{}\"", self.key))
    }

    /// Variable name the filter is bound to inside the expression
    pub fn simplified(&self) -> String {
        match &self.transformation {
            None => format!("{}_{}", self.selector, self.key),
            Some(transformation) => format!("{}_{}_{}", transformation, self.selector, self.key),
        }
    }

    fn render(&self, key: &str) -> String {
        match (self.kind(), &self.transformation, self.param) {
            (FilterKind::Transformed, Some(transformation), _) => {
                format!("{transformation}({}({key}))", self.selector)
            }
            (FilterKind::TransformedParameter, Some(transformation), Some(param)) => {
                format!("{transformation}({}({key}),{param})", self.selector)
            }
            _ => format!("{}({key})", self.selector),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(&self.key))
    }
}

/// Result of parsing a user condition
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCondition {
    /// Distinct filters in order of first appearance
    pub filters: Vec<Filter>,

    /// Condition with whitespace removed and filters replaced by their identifiers
    pub expression: String,

    /// Candidates that matched no filter pattern (numeric literals excluded)
    pub dropped: Vec<String>,
}

/// Parse a condition such as `mean(temperature) - derivative(max(temperature),10) > 10`.
///
/// Fails with [`AlarmError::Parse`] when no filter is found, when a parameter
/// overflows, or when two different filters share a simplified identifier.
pub fn parse_condition(input: &str) -> AlarmResult<ParsedCondition> {
    let stripped: String = input.chars().filter(|c| !c.is_whitespace()).collect();

    let mut filters: Vec<Filter> = Vec::new();
    let mut dropped = Vec::new();

    for candidate in OPERATORS.split(&stripped).filter(|c| !c.is_empty()) {
        match match_candidate(candidate)? {
            Some(filter) => {
                if !filters.contains(&filter) {
                    filters.push(filter);
                }
            }
            None if candidate.parse::<f64>().is_ok() => {}
            None => dropped.push(candidate.to_string()),
        }
    }

    if filters.is_empty() {
        return Err(AlarmError::Parse("filters can't be empty".to_string()));
    }

    let mut identifiers: HashMap<String, &Filter> = HashMap::new();
    for filter in &filters {
        if let Some(other) = identifiers.insert(filter.simplified(), filter) {
            return Err(AlarmError::Parse(format!(
                "'{other}' and '{filter}' both resolve to '{}'",
                filter.simplified()
            )));
        }
    }

    if !dropped.is_empty() {
        debug!("dropped {} unmatched tokens: {:?}", dropped.len(), dropped);
    }

    // Longest first, so `max(t)` is not rewritten inside `derivative(max(t),10)`
    let mut by_length: Vec<&Filter> = filters.iter().collect();
    by_length.sort_by_key(|f| std::cmp::Reverse(f.original().len()));

    let mut expression = stripped;
    for filter in by_length {
        expression = expression.replace(&filter.original(), &filter.simplified());
    }

    Ok(ParsedCondition {
        filters,
        expression,
        dropped,
    })
}

fn match_candidate(candidate: &str) -> AlarmResult<Option<Filter>> {
    if let Some(captures) = SELECTOR_AND_TRANSFORMATION.captures(candidate) {
        let param = match captures.get(4) {
            Some(param) => Some(
                param
                    .as_str()
                    .parse::<i64>()
                    .map_err(|_| AlarmError::Parse(format!("'{}' not integer", param.as_str())))?,
            ),
            None => None,
        };
        return Ok(Some(Filter::transformed(
            &captures[1],
            &captures[2],
            &captures[3],
            param,
        )));
    }

    Ok(SELECTOR
        .captures(candidate)
        .map(|captures| Filter::simple(&captures[1], &captures[2])))
}
