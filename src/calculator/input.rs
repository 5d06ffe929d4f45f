//! Calculation inputs, normalisation, and cache fingerprints.
//!
//! An input is a finite field->scalar mapping. Before a cache key is derived
//! the input is normalised: `BTreeMap` ordering sorts fields by name and
//! numeric values are rounded to 2 decimal places, so floating-point jitter
//! below a cent never causes a cache miss.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A finite mapping from field name to scalar value.
///
/// `BTreeMap` keeps fields sorted by name, which makes the serialised form
/// canonical.
pub type CalcInput = BTreeMap<String, CalcValue>;

/// Scalar value of a single input field.
///
/// Serialises untagged, so inputs read and write as plain JSON objects.
/// `Timestamp` carries epoch milliseconds; on deserialisation an integer
/// always reads back as `Integer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CalcValue {
    Boolean(bool),
    Integer(i64),
    Number(f64),
    Text(String),
    Timestamp(i64),
}

impl CalcValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CalcValue::Number(n) => Some(*n),
            CalcValue::Integer(i) => Some(*i as f64),
            CalcValue::Timestamp(t) => Some(*t as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CalcValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CalcValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The value with numbers rounded to 2 decimal places.
    pub fn normalized(&self) -> CalcValue {
        match self {
            CalcValue::Number(n) => CalcValue::Number(round2(*n)),
            other => other.clone(),
        }
    }
}

impl From<f64> for CalcValue {
    fn from(v: f64) -> Self {
        CalcValue::Number(v)
    }
}

impl From<i64> for CalcValue {
    fn from(v: i64) -> Self {
        CalcValue::Integer(v)
    }
}

impl From<bool> for CalcValue {
    fn from(v: bool) -> Self {
        CalcValue::Boolean(v)
    }
}

impl From<&str> for CalcValue {
    fn from(v: &str) -> Self {
        CalcValue::Text(v.to_string())
    }
}

impl From<String> for CalcValue {
    fn from(v: String) -> Self {
        CalcValue::Text(v)
    }
}

/// Round to 2 decimal places (cent precision).
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Copy of the input with every numeric value rounded to 2 decimal places.
pub fn normalize(input: &CalcInput) -> CalcInput {
    input
        .iter()
        .map(|(k, v)| (k.clone(), v.normalized()))
        .collect()
}

/// Build a `CalcInput` from field/value pairs.
pub fn build_input<K, I>(pairs: I) -> CalcInput
where
    K: Into<String>,
    I: IntoIterator<Item = (K, CalcValue)>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Cache fingerprint for a (calculator, normalised input) pair.
///
/// Keys are strings, not raw floats: the canonical JSON of the normalised
/// input (fields already sorted by the map) joined to the calculator id with
/// a unit separator.
pub fn fingerprint(calc_id: &str, normalized: &CalcInput) -> String {
    let canonical =
        serde_json::to_string(normalized).unwrap_or_else(|_| "{}".to_string());
    format!("{calc_id}\u{1f}{canonical}")
}
