//! rechner-core
//!
//! Real-time calculation core for the interactive financial calculator
//! suite. Accepts a continuous stream of input changes across many
//! calculator types and produces results with bounded latency and minimal
//! redundant work:
//!
//! - [`calculator::CalculatorRegistry`]: typed catalogue of calculators.
//! - [`cache::ResultCache`]: bounded TTL-aware LRU result cache.
//! - [`behavior::BehaviorAnalyzer`]: input-timing metrics.
//! - [`debounce::SmartDebouncer`]: adaptive per-calculator debouncing.
//! - [`worker::WorkerPool`]: background calculation workers.
//! - [`engine::RealtimeEngine`]: the facade composing the above.
//!
//! ```no_run
//! use rechner_core::{builtin, CalcValue, RealtimeEngine};
//!
//! # async fn demo() -> Result<(), rechner_core::EngineError> {
//! let engine = RealtimeEngine::with_defaults();
//! builtin::register_all(engine.registry()).expect("builtin suite registers");
//!
//! let input = rechner_core::build_input([
//!     ("principal", CalcValue::from(10_000.0)),
//!     ("monthly", CalcValue::from(100.0)),
//!     ("annual_rate", CalcValue::from(4.0)),
//!     ("years", CalcValue::from(10i64)),
//! ]);
//! let result = engine.calculate("compound-interest", &input).await?;
//! println!("{result}");
//! # Ok(())
//! # }
//! ```

pub mod behavior;
pub mod cache;
pub mod calculator;
pub mod config;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod worker;

pub use calculator::{
    build_input, builtin, CalcInput, CalcValue, Calculator, CalculatorRegistry, Category,
    FieldKind, FieldSpec, FnCalculator, InputSchema, ResultShape,
};
pub use config::{AnalyzerConfig, CacheConfig, EngineConfig, WorkerPoolConfig};
pub use engine::{EngineStats, RealtimeEngine};
pub use error::{EngineError, RegistryError, ValidationCode, ValidationError};
