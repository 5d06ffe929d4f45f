//! Calculator registry.
//!
//! Typed catalogue of calculator definitions keyed by id. Registration
//! enforces the structural contract up front; contract violations are
//! programmer errors and surface synchronously.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::Calculator;
use crate::error::RegistryError;

struct RegistryInner {
    by_id: HashMap<String, Arc<dyn Calculator>>,
    /// Registration order, drives enumeration and search result ordering.
    order: Vec<String>,
}

/// Mapping from calculator id to definition.
///
/// Effectively immutable after startup; registration is serialised with
/// respect to lookups by the interior lock.
pub struct CalculatorRegistry {
    inner: RwLock<RegistryInner>,
}

impl Default for CalculatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CalculatorRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                by_id: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    /// Register a calculator definition.
    ///
    /// Rejects empty ids/names, duplicate ids, empty schemas, empty result
    /// shapes, and complexity outside 1..=10. On rejection the registry is
    /// unchanged.
    pub fn register(&self, calculator: Arc<dyn Calculator>) -> Result<(), RegistryError> {
        let id = calculator.id().to_string();
        if id.trim().is_empty() {
            return Err(RegistryError::EmptyId);
        }
        if calculator.name().trim().is_empty() {
            return Err(RegistryError::EmptyName { id });
        }
        if calculator.input_schema().is_empty() {
            return Err(RegistryError::EmptySchema { id });
        }
        if calculator.result_shape().is_empty() {
            return Err(RegistryError::EmptyResultShape { id });
        }
        let complexity = calculator.complexity();
        if !(1..=10).contains(&complexity) {
            return Err(RegistryError::InvalidComplexity {
                id,
                value: complexity,
            });
        }

        let mut inner = self.inner.write();
        if inner.by_id.contains_key(&id) {
            return Err(RegistryError::DuplicateId { id });
        }
        info!(calc_id = %id, category = %calculator.category(), "registered calculator");
        inner.order.push(id.clone());
        inner.by_id.insert(id, calculator);
        Ok(())
    }

    /// Remove a calculator. Returns false when the id was not registered.
    pub fn deregister(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        if inner.by_id.remove(id).is_some() {
            inner.order.retain(|o| o != id);
            debug!(calc_id = %id, "deregistered calculator");
            true
        } else {
            false
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Calculator>> {
        self.inner.read().by_id.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().by_id.contains_key(id)
    }

    /// All calculators in registration order.
    pub fn list(&self) -> Vec<Arc<dyn Calculator>> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect()
    }

    /// Registered ids in registration order.
    pub fn ids(&self) -> Vec<String> {
        self.inner.read().order.clone()
    }

    /// Case-insensitive substring search over id, name, and description,
    /// in registration order.
    pub fn search(&self, query: &str) -> Vec<Arc<dyn Calculator>> {
        let needle = query.to_lowercase();
        self.list()
            .into_iter()
            .filter(|c| {
                c.id().to_lowercase().contains(&needle)
                    || c.name().to_lowercase().contains(&needle)
                    || c.description().to_lowercase().contains(&needle)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::{Category, FieldSpec, FnCalculator, InputSchema, ResultShape};
    use serde_json::json;

    fn calc(id: &str, name: &str) -> FnCalculator {
        FnCalculator::new(
            id,
            name,
            Category::Analysis,
            InputSchema::new(vec![FieldSpec::number("x", "Wert")]),
            ResultShape::metrics(&["y"]),
            |_| Ok(json!({"y": 1.0})),
        )
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = CalculatorRegistry::new();
        registry.register(Arc::new(calc("a", "Alpha"))).unwrap();
        assert!(registry.contains("a"));
        assert_eq!(registry.get("a").unwrap().name(), "Alpha");
        assert!(registry.get("b").is_none());
    }

    #[test]
    fn test_duplicate_id_rejected_registry_unchanged() {
        let registry = CalculatorRegistry::new();
        registry.register(Arc::new(calc("a", "Alpha"))).unwrap();
        let err = registry
            .register(Arc::new(calc("a", "Other")))
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateId { id: "a".into() });
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a").unwrap().name(), "Alpha");
    }

    #[test]
    fn test_empty_id_rejected() {
        let registry = CalculatorRegistry::new();
        let err = registry.register(Arc::new(calc("", "Alpha"))).unwrap_err();
        assert_eq!(err, RegistryError::EmptyId);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_empty_name_rejected() {
        let registry = CalculatorRegistry::new();
        let err = registry.register(Arc::new(calc("a", " "))).unwrap_err();
        assert_eq!(err, RegistryError::EmptyName { id: "a".into() });
    }

    #[test]
    fn test_empty_schema_rejected() {
        let registry = CalculatorRegistry::new();
        let bad = FnCalculator::new(
            "a",
            "Alpha",
            Category::Analysis,
            InputSchema::default(),
            ResultShape::metrics(&["y"]),
            |_| Ok(json!({})),
        );
        assert_eq!(
            registry.register(Arc::new(bad)).unwrap_err(),
            RegistryError::EmptySchema { id: "a".into() }
        );
    }

    #[test]
    fn test_empty_result_shape_rejected() {
        let registry = CalculatorRegistry::new();
        let bad = FnCalculator::new(
            "a",
            "Alpha",
            Category::Analysis,
            InputSchema::new(vec![FieldSpec::number("x", "Wert")]),
            ResultShape::default(),
            |_| Ok(json!({})),
        );
        assert_eq!(
            registry.register(Arc::new(bad)).unwrap_err(),
            RegistryError::EmptyResultShape { id: "a".into() }
        );
    }

    #[test]
    fn test_invalid_complexity_rejected() {
        let registry = CalculatorRegistry::new();
        let bad = calc("a", "Alpha").with_complexity(11);
        assert_eq!(
            registry.register(Arc::new(bad)).unwrap_err(),
            RegistryError::InvalidComplexity {
                id: "a".into(),
                value: 11
            }
        );
    }

    #[test]
    fn test_list_preserves_registration_order() {
        let registry = CalculatorRegistry::new();
        for id in ["zeta", "alpha", "mitte"] {
            registry.register(Arc::new(calc(id, id))).unwrap();
        }
        let ids: Vec<_> = registry.list().iter().map(|c| c.id().to_string()).collect();
        assert_eq!(ids, vec!["zeta", "alpha", "mitte"]);
    }

    #[test]
    fn test_search_case_insensitive_over_id_name_description() {
        let registry = CalculatorRegistry::new();
        registry
            .register(Arc::new(
                calc("zinseszins", "Zinseszinsrechner").with_description("Kapital mit Zinseszins"),
            ))
            .unwrap();
        registry
            .register(Arc::new(calc("kredit", "Kreditrechner")))
            .unwrap();

        assert_eq!(registry.search("ZINS").len(), 1);
        assert_eq!(registry.search("rechner").len(), 2);
        assert_eq!(registry.search("kapital").len(), 1);
        assert!(registry.search("hypothek").is_empty());
    }

    #[test]
    fn test_deregister() {
        let registry = CalculatorRegistry::new();
        registry.register(Arc::new(calc("a", "Alpha"))).unwrap();
        assert!(registry.deregister("a"));
        assert!(!registry.deregister("a"));
        assert!(registry.ids().is_empty());
    }
}
