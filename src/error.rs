//! Error taxonomy for the calculation core.
//!
//! Two classes: programmer errors (`RegistryError`, surfaced synchronously at
//! registration) and runtime errors (`EngineError`, delivered through the
//! result channel of a calculation).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable validation error codes.
///
/// Calculators attach a localised message per code; the engine itself only
/// ever matches on the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationCode {
    RequiredField,
    InvalidNumber,
    MinValue,
    MaxValue,
    InvalidRange,
    InvalidFormat,
}

impl ValidationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationCode::RequiredField => "REQUIRED_FIELD",
            ValidationCode::InvalidNumber => "INVALID_NUMBER",
            ValidationCode::MinValue => "MIN_VALUE",
            ValidationCode::MaxValue => "MAX_VALUE",
            ValidationCode::InvalidRange => "INVALID_RANGE",
            ValidationCode::InvalidFormat => "INVALID_FORMAT",
        }
    }

    /// User-facing German message for this code.
    ///
    /// The calculator suite ships German-first; callers embed the field label
    /// via [`ValidationError::new`].
    pub fn german_message(&self) -> &'static str {
        match self {
            ValidationCode::RequiredField => "Dieses Feld ist erforderlich",
            ValidationCode::InvalidNumber => "Bitte geben Sie eine gültige Zahl ein",
            ValidationCode::MinValue => "Der Wert ist zu klein",
            ValidationCode::MaxValue => "Der Wert ist zu groß",
            ValidationCode::InvalidRange => "Die Werte ergeben keinen gültigen Bereich",
            ValidationCode::InvalidFormat => "Ungültiges Format",
        }
    }
}

impl std::fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub code: ValidationCode,
    pub message: String,
}

impl ValidationError {
    /// Build an error with the default German message for the code.
    pub fn new(field: impl Into<String>, code: ValidationCode) -> Self {
        Self {
            field: field.into(),
            code,
            message: code.german_message().to_string(),
        }
    }

    /// Build an error with a calculator-specific message.
    pub fn with_message(
        field: impl Into<String>,
        code: ValidationCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            code,
            message: message.into(),
        }
    }
}

/// Runtime errors returned to callers of the engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// No calculator registered under the requested id.
    #[error("unknown calculator: {calc_id}")]
    UnknownCalculator { calc_id: String },

    /// The calculator's validator rejected the input.
    #[error("validation failed ({} error(s))", .0.len())]
    ValidationFailed(Vec<ValidationError>),

    /// The debounced call was replaced by a newer call before firing.
    /// Non-fatal: coalescing worked as designed.
    #[error("superseded by a newer input")]
    Superseded,

    /// The caller (or a higher layer) cancelled the request.
    #[error("cancelled")]
    Cancelled,

    /// The worker did not respond within the timeout.
    #[error("calculation timed out after {limit_ms} ms")]
    Timeout { limit_ms: u64 },

    /// The worker crashed or reported a failure.
    #[error("worker error: {message}")]
    WorkerError { message: String },

    /// A single value exceeded the cache memory cap. Non-fatal: the result
    /// is still returned, it is just not memoised.
    #[error("value too large for result cache")]
    CacheFull,
}

impl EngineError {
    pub fn unknown_calculator(calc_id: impl Into<String>) -> Self {
        EngineError::UnknownCalculator {
            calc_id: calc_id.into(),
        }
    }

    pub fn worker(message: impl Into<String>) -> Self {
        EngineError::WorkerError {
            message: message.into(),
        }
    }

    /// True for outcomes callers are expected to tolerate (a newer input
    /// replaced this one, or the caller itself cancelled).
    pub fn is_non_fatal(&self) -> bool {
        matches!(self, EngineError::Superseded | EngineError::Cancelled)
    }
}

/// Programmer errors raised at calculator registration time.
///
/// Never retried, never swallowed: a failing registration is a bug in the
/// embedding application.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("calculator id must not be empty")]
    EmptyId,

    #[error("calculator id already registered: {id}")]
    DuplicateId { id: String },

    #[error("calculator {id} has an empty name")]
    EmptyName { id: String },

    #[error("calculator {id} declares no input fields")]
    EmptySchema { id: String },

    #[error("calculator {id} declares no result shape")]
    EmptyResultShape { id: String },

    #[error("calculator {id} declares complexity {value}, expected 1..=10")]
    InvalidComplexity { id: String, value: u8 },
}
