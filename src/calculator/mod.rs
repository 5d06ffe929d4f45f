//! Calculator contracts: the `Calculator` trait, input model, schemas, the
//! registry, and the built-in German calculator suite.

pub mod builtin;
pub mod input;
pub mod registry;
pub mod schema;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use input::{build_input, fingerprint, normalize, round2, CalcInput, CalcValue};
pub use registry::CalculatorRegistry;
pub use schema::{FieldKind, FieldSpec, InputSchema};

use crate::error::ValidationError;

/// Closed set of calculator categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    CompoundInterest,
    Loan,
    Mortgage,
    Retirement,
    Investment,
    Tax,
    Insurance,
    Comparison,
    Analysis,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::CompoundInterest => "compound-interest",
            Category::Loan => "loan",
            Category::Mortgage => "mortgage",
            Category::Retirement => "retirement",
            Category::Investment => "investment",
            Category::Tax => "tax",
            Category::Insurance => "insurance",
            Category::Comparison => "comparison",
            Category::Analysis => "analysis",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptor of a calculator's result, sufficient for UI binding.
/// Opaque to the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultShape {
    /// Result keys the UI surfaces prominently, in display order.
    pub primary_metrics: Vec<String>,
    pub description: Option<String>,
}

impl ResultShape {
    pub fn metrics(names: &[&str]) -> Self {
        Self {
            primary_metrics: names.iter().map(|n| n.to_string()).collect(),
            description: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.primary_metrics.is_empty()
    }
}

/// A named, versioned, pure calculation plus its declared schema.
///
/// `validate` and `calculate` must be pure with respect to their inputs: the
/// engine memoises results per (id, normalised input) pair.
pub trait Calculator: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn description(&self) -> &str {
        ""
    }
    fn category(&self) -> Category;
    fn version(&self) -> &str {
        "1.0.0"
    }
    /// Integer 1-10 consumed by the adaptive-delay formula.
    fn complexity(&self) -> u8 {
        5
    }
    fn input_schema(&self) -> &InputSchema;
    fn result_shape(&self) -> &ResultShape;

    /// Empty vec means the input is acceptable.
    fn validate(&self, input: &CalcInput) -> Vec<ValidationError> {
        self.input_schema().validate(input)
    }

    fn calculate(&self, input: &CalcInput) -> anyhow::Result<Value>;
}

type ValidateFn = dyn Fn(&CalcInput) -> Vec<ValidationError> + Send + Sync;
type CalculateFn = dyn Fn(&CalcInput) -> anyhow::Result<Value> + Send + Sync;

/// Closure-backed [`Calculator`] for ad-hoc registration and tests.
///
/// Schema validation always runs; an optional extra validator adds
/// cross-field rules on top.
pub struct FnCalculator {
    id: String,
    name: String,
    description: String,
    category: Category,
    version: String,
    complexity: u8,
    schema: InputSchema,
    shape: ResultShape,
    validator: Option<Box<ValidateFn>>,
    calc: Box<CalculateFn>,
}

impl FnCalculator {
    pub fn new(
        id: &str,
        name: &str,
        category: Category,
        schema: InputSchema,
        shape: ResultShape,
        calc: impl Fn(&CalcInput) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            category,
            version: "1.0.0".to_string(),
            complexity: 5,
            schema,
            shape,
            validator: None,
            calc: Box::new(calc),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn with_complexity(mut self, complexity: u8) -> Self {
        self.complexity = complexity;
        self
    }

    /// Cross-field validator, run after (and in addition to) the schema
    /// checks.
    pub fn with_validator(
        mut self,
        validator: impl Fn(&CalcInput) -> Vec<ValidationError> + Send + Sync + 'static,
    ) -> Self {
        self.validator = Some(Box::new(validator));
        self
    }
}

impl Calculator for FnCalculator {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn category(&self) -> Category {
        self.category
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn complexity(&self) -> u8 {
        self.complexity
    }

    fn input_schema(&self) -> &InputSchema {
        &self.schema
    }

    fn result_shape(&self) -> &ResultShape {
        &self.shape
    }

    fn validate(&self, input: &CalcInput) -> Vec<ValidationError> {
        let mut errors = self.schema.validate(input);
        if let Some(validator) = &self.validator {
            errors.extend(validator(input));
        }
        errors
    }

    fn calculate(&self, input: &CalcInput) -> anyhow::Result<Value> {
        (self.calc)(input)
    }
}

impl std::fmt::Debug for FnCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnCalculator")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("category", &self.category)
            .field("version", &self.version)
            .field("complexity", &self.complexity)
            .finish()
    }
}
