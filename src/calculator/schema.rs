//! Declarative input schemas and schema-driven validation.
//!
//! Calculators declare an ordered field list; presence, kind, and range
//! checks are derived from it so individual calculators only add cross-field
//! rules on top.

use serde::{Deserialize, Serialize};

use super::input::{CalcInput, CalcValue};
use crate::error::{ValidationCode, ValidationError};

/// Data kind of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Number,
    Integer,
    Text,
    Boolean,
    Timestamp,
}

/// A single declared input field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    /// German UI label, also used in validation messages.
    pub label: String,
    pub kind: FieldKind,
    pub required: bool,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Closed enumeration for text fields.
    pub choices: Option<Vec<String>>,
}

impl FieldSpec {
    fn new(name: &str, label: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            kind,
            required: true,
            min: None,
            max: None,
            choices: None,
        }
    }

    pub fn number(name: &str, label: &str) -> Self {
        Self::new(name, label, FieldKind::Number)
    }

    pub fn integer(name: &str, label: &str) -> Self {
        Self::new(name, label, FieldKind::Integer)
    }

    pub fn text(name: &str, label: &str) -> Self {
        Self::new(name, label, FieldKind::Text)
    }

    pub fn boolean(name: &str, label: &str) -> Self {
        Self::new(name, label, FieldKind::Boolean)
    }

    pub fn timestamp(name: &str, label: &str) -> Self {
        Self::new(name, label, FieldKind::Timestamp)
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn choices(mut self, choices: &[&str]) -> Self {
        self.choices = Some(choices.iter().map(|c| c.to_string()).collect());
        self
    }

    fn kind_matches(&self, value: &CalcValue) -> bool {
        match self.kind {
            FieldKind::Number => matches!(value, CalcValue::Number(_) | CalcValue::Integer(_)),
            FieldKind::Integer => match value {
                CalcValue::Integer(_) => true,
                CalcValue::Number(n) => n.fract() == 0.0,
                _ => false,
            },
            FieldKind::Text => matches!(value, CalcValue::Text(_)),
            FieldKind::Boolean => matches!(value, CalcValue::Boolean(_)),
            FieldKind::Timestamp => {
                matches!(value, CalcValue::Timestamp(_) | CalcValue::Integer(_))
            }
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(
            self.kind,
            FieldKind::Number | FieldKind::Integer | FieldKind::Timestamp
        )
    }
}

/// Ordered list of declared fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputSchema {
    pub fields: Vec<FieldSpec>,
}

impl InputSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Presence, kind, range, and enumeration checks for every declared
    /// field. Fields present in the input but absent from the schema are
    /// ignored.
    pub fn validate(&self, input: &CalcInput) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for spec in &self.fields {
            let value = match input.get(&spec.name) {
                Some(v) => v,
                None => {
                    if spec.required {
                        errors.push(ValidationError::new(
                            &spec.name,
                            ValidationCode::RequiredField,
                        ));
                    }
                    continue;
                }
            };

            if !spec.kind_matches(value) {
                let code = if spec.is_numeric() {
                    ValidationCode::InvalidNumber
                } else {
                    ValidationCode::InvalidFormat
                };
                errors.push(ValidationError::with_message(
                    &spec.name,
                    code,
                    format!("{}: {}", spec.label, code.german_message()),
                ));
                continue;
            }

            if let Some(n) = value.as_f64() {
                if !n.is_finite() {
                    errors.push(ValidationError::new(
                        &spec.name,
                        ValidationCode::InvalidNumber,
                    ));
                    continue;
                }
                if let Some(min) = spec.min {
                    if n < min {
                        errors.push(ValidationError::with_message(
                            &spec.name,
                            ValidationCode::MinValue,
                            format!("{}: Der Wert muss mindestens {} betragen", spec.label, min),
                        ));
                        continue;
                    }
                }
                if let Some(max) = spec.max {
                    if n > max {
                        errors.push(ValidationError::with_message(
                            &spec.name,
                            ValidationCode::MaxValue,
                            format!("{}: Der Wert darf höchstens {} betragen", spec.label, max),
                        ));
                        continue;
                    }
                }
            }

            if let (Some(choices), Some(text)) = (&spec.choices, value.as_str()) {
                if !choices.iter().any(|c| c == text) {
                    errors.push(ValidationError::with_message(
                        &spec.name,
                        ValidationCode::InvalidFormat,
                        format!("{}: {}", spec.label, ValidationCode::InvalidFormat.german_message()),
                    ));
                }
            }
        }

        errors
    }
}
