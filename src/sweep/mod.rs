//! Value sweep expansion.
//!
//! A sweep is read from a generic YAML node and expanded into the ordered
//! list of literal strings a template location should take. Two shapes are
//! accepted: a three-number `[start, stop, step]` half-open range, or a
//! single nested list enumerating literal values.
pub mod combine;

use crate::error::SweepError;
use serde_yaml::Value;
use std::collections::BTreeSet;

pub use combine::{combine, Combination, SweepSet};

/// Upper bound on the number of values one sweep may produce.
pub const MAX_SWEEP_VALUES: usize = 100_000;

/// Ordered literal values produced by one sweep.
pub type ValueSequence = Vec<String>;

/// A declared sweep, before expansion.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepSpec {
    /// `[start, stop, step)` where every bound was written as an integer.
    IntRange { start: i64, stop: i64, step: i64 },
    /// `[start, stop, step)` with at least one non-integer bound.
    FloatRange { start: f64, stop: f64, step: f64 },
    /// Literal values, in declared order.
    Enumeration(Vec<String>),
}

impl SweepSpec {
    /// Interpret a YAML node as a sweep specification.
    pub fn from_node(node: &Value) -> Result<Self, SweepError> {
        let Value::Sequence(items) = node else {
            return Err(SweepError::malformed(format!(
                "expected a list, got {}",
                describe_node(node)
            )));
        };

        if items.len() == 3 && items.iter().all(Value::is_number) {
            let ints: Option<Vec<i64>> = items.iter().map(Value::as_i64).collect();
            if let Some(ints) = ints {
                return Ok(SweepSpec::IntRange {
                    start: ints[0],
                    stop: ints[1],
                    step: ints[2],
                });
            }
            let floats: Option<Vec<f64>> = items.iter().map(Value::as_f64).collect();
            let floats =
                floats.ok_or_else(|| SweepError::malformed("range bounds must be numeric"))?;
            if floats.iter().any(|value| !value.is_finite()) {
                return Err(SweepError::malformed("range bounds must be finite"));
            }
            return Ok(SweepSpec::FloatRange {
                start: floats[0],
                stop: floats[1],
                step: floats[2],
            });
        }

        if let [Value::Sequence(values)] = items.as_slice() {
            let literals = values
                .iter()
                .map(scalar_literal)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(SweepSpec::Enumeration(literals));
        }

        Err(SweepError::malformed(format!(
            "a sweep is either [start, stop, step] or [[values...]], got a list of {} element(s)",
            items.len()
        )))
    }
}

/// Expand a sweep into literal values, optionally prefixed with `prepend`.
///
/// Ranges are half-open and walk toward `stop` in `step` increments. A step
/// pointing away from `stop` produces nothing (with a warning). Exceeding
/// [`MAX_SWEEP_VALUES`] is an error, never a truncation.
pub fn expand(spec: &SweepSpec, prepend: Option<&str>) -> Result<ValueSequence, SweepError> {
    let values = match spec {
        SweepSpec::IntRange { start, stop, step } => expand_int_range(*start, *stop, *step)?,
        SweepSpec::FloatRange { start, stop, step } => expand_float_range(*start, *stop, *step)?,
        SweepSpec::Enumeration(values) => expand_enumeration(values),
    };
    Ok(match prepend.filter(|prefix| !prefix.is_empty()) {
        Some(prefix) => values
            .into_iter()
            .map(|value| format!("{prefix} {value}"))
            .collect(),
        None => values,
    })
}

fn expand_int_range(start: i64, stop: i64, step: i64) -> Result<ValueSequence, SweepError> {
    let span = i128::from(stop) - i128::from(start);
    if span == 0 {
        tracing::warn!(start, stop, "empty range: start equals stop");
        return Ok(Vec::new());
    }
    if step == 0 {
        return Err(SweepError::malformed(format!(
            "range [{start}, {stop}) has a zero step"
        )));
    }
    if span.signum() != i128::from(step).signum() {
        tracing::warn!(start, stop, step, "range step points away from stop; no values produced");
        return Ok(Vec::new());
    }

    let mut values = Vec::new();
    let mut current = i128::from(start);
    let stop = i128::from(stop);
    let step = i128::from(step);
    while (step > 0 && current < stop) || (step < 0 && current > stop) {
        if values.len() == MAX_SWEEP_VALUES {
            return Err(SweepError::TooManyValues {
                limit: MAX_SWEEP_VALUES,
            });
        }
        values.push(current.to_string());
        current += step;
    }
    Ok(values)
}

fn expand_float_range(start: f64, stop: f64, step: f64) -> Result<ValueSequence, SweepError> {
    let span = stop - start;
    if span == 0.0 {
        tracing::warn!(start, stop, "empty range: start equals stop");
        return Ok(Vec::new());
    }
    if step == 0.0 {
        return Err(SweepError::malformed(format!(
            "range [{start}, {stop}) has a zero step"
        )));
    }
    if span.signum() != step.signum() {
        tracing::warn!(start, stop, step, "range step points away from stop; no values produced");
        return Ok(Vec::new());
    }

    let mut values = Vec::new();
    for index in 0u32.. {
        // Multiply rather than accumulate so rounding error does not drift.
        let current = start + f64::from(index) * step;
        let inside = if step > 0.0 {
            current < stop
        } else {
            current > stop
        };
        if !inside {
            break;
        }
        if values.len() == MAX_SWEEP_VALUES {
            return Err(SweepError::TooManyValues {
                limit: MAX_SWEEP_VALUES,
            });
        }
        values.push(format_float(current));
    }
    Ok(values)
}

fn expand_enumeration(values: &[String]) -> ValueSequence {
    if values.is_empty() {
        tracing::warn!("empty value list; this sweep produces no variants");
        return Vec::new();
    }
    let mut seen = BTreeSet::new();
    let duplicates: BTreeSet<&str> = values
        .iter()
        .filter(|value| !seen.insert(value.as_str()))
        .map(String::as_str)
        .collect();
    if !duplicates.is_empty() {
        tracing::warn!(?duplicates, "value list repeats literals; duplicates are kept");
    }
    values.to_vec()
}

/// Print a float in its shortest form after rounding away accumulated error.
fn format_float(value: f64) -> String {
    let scaled = value * 1e12;
    let rounded = if scaled.is_finite() {
        scaled.round() / 1e12
    } else {
        value
    };
    // Adding zero folds -0.0 into 0.0.
    format!("{}", rounded + 0.0)
}

fn scalar_literal(node: &Value) -> Result<String, SweepError> {
    match node {
        Value::String(text) => Ok(text.clone()),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(flag) => Ok(flag.to_string()),
        other => Err(SweepError::malformed(format!(
            "value lists may only contain scalars, got {}",
            describe_node(other)
        ))),
    }
}

fn describe_node(node: &Value) -> &'static str {
    match node {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

#[cfg(test)]
#[path = "sweep_tests.rs"]
mod tests;
