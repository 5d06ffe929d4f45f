//! Realtime engine facade.
//!
//! Single public entry point composing registry, cache, behaviour analyzer,
//! debouncer, and worker pool:
//! validate -> cache probe -> debounce -> worker dispatch -> cache store, with
//! one in-process fallback attempt when the worker path fails.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::behavior::BehaviorAnalyzer;
use crate::cache::{CacheStats, ResultCache};
use crate::calculator::{fingerprint, normalize, CalcInput, Calculator, CalculatorRegistry};
use crate::config::EngineConfig;
use crate::debounce::{Job, SmartDebouncer};
use crate::error::EngineError;
use crate::worker::{PoolStats, WorkerPool};

#[derive(Default)]
struct EngineCounters {
    total: AtomicU64,
    errors: AtomicU64,
    cache_hits: AtomicU64,
}

/// Outcome of the shared validate/normalise/cache-probe front half.
enum Prepared {
    Hit(Value),
    Miss {
        calc: Arc<dyn Calculator>,
        key: String,
        input: CalcInput,
    },
}

/// Aggregate engine statistics.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub total_calculations: u64,
    pub errors: u64,
    pub cache_hits: u64,
    pub cache_hit_rate: f64,
    pub active_requests: usize,
    pub last_calculated_at: Option<DateTime<Utc>>,
}

/// The realtime calculation engine.
///
/// Owns all long-lived state; create once at startup (inside a tokio
/// runtime) and call [`shutdown`](Self::shutdown) when done.
pub struct RealtimeEngine {
    registry: Arc<CalculatorRegistry>,
    cache: Arc<ResultCache>,
    analyzer: Arc<BehaviorAnalyzer>,
    debouncer: SmartDebouncer,
    pool: Arc<WorkerPool>,
    counters: EngineCounters,
    last_calculated: Mutex<Option<DateTime<Utc>>>,
    maintenance: Vec<JoinHandle<()>>,
}

impl RealtimeEngine {
    /// Initialisation order: registry -> cache -> pool -> analyzer -> engine.
    pub fn new(config: EngineConfig) -> Self {
        let registry = Arc::new(CalculatorRegistry::new());
        let cache = Arc::new(ResultCache::new(config.cache.clone()));
        let pool = Arc::new(WorkerPool::new(config.pool.clone(), registry.clone()));
        let analyzer = Arc::new(BehaviorAnalyzer::new(config.analyzer.clone()));
        let debouncer = SmartDebouncer::new(analyzer.clone());

        let mut maintenance = Vec::new();
        if config.cache.auto_cleanup {
            let cache = cache.clone();
            let every = config.cache.cleanup_interval;
            maintenance.push(tokio::spawn(async move {
                let mut tick = interval(every);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tick.tick().await;
                    cache.cleanup();
                }
            }));
        }
        {
            let analyzer = analyzer.clone();
            let every = config.analyzer.tick_interval;
            maintenance.push(tokio::spawn(async move {
                let mut tick = interval(every);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tick.tick().await;
                    analyzer.tick();
                }
            }));
        }

        info!("realtime engine started");
        Self {
            registry,
            cache,
            analyzer,
            debouncer,
            pool,
            counters: EngineCounters::default(),
            last_calculated: Mutex::new(None),
            maintenance,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(EngineConfig::default())
    }

    /// Debounced calculation. The returned future resolves once the
    /// (possibly superseded) scheduled task has fired, with the cached
    /// result short-circuiting the whole pipeline.
    pub async fn calculate(&self, calc_id: &str, input: &CalcInput) -> Result<Value, EngineError> {
        let (calc, key, normalized) = match self.prepare(calc_id, input)? {
            Prepared::Hit(value) => return Ok(value),
            Prepared::Miss { calc, key, input } => (calc, key, input),
        };

        let complexity = calc.complexity();
        let job = self.make_job(calc, normalized, key);
        let rx = self.debouncer.schedule(calc_id, complexity, job);
        let result = match rx.await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Cancelled),
        };
        self.finish(result)
    }

    /// As [`calculate`](Self::calculate) but bypasses the debouncer; any
    /// pending debounced call for the calculator is superseded.
    pub async fn calculate_immediate(
        &self,
        calc_id: &str,
        input: &CalcInput,
    ) -> Result<Value, EngineError> {
        let (calc, key, normalized) = match self.prepare(calc_id, input)? {
            Prepared::Hit(value) => return Ok(value),
            Prepared::Miss { calc, key, input } => (calc, key, input),
        };

        let job = self.make_job(calc, normalized, key);
        let result = self.debouncer.execute_immediate(calc_id, job).await;
        self.finish(result)
    }

    /// Cancel the pending debounced calculation for a calculator, if any.
    pub fn cancel(&self, calc_id: &str) -> bool {
        self.debouncer.cancel(calc_id)
    }

    pub fn stats(&self) -> EngineStats {
        let cache_stats = self.cache.stats();
        EngineStats {
            total_calculations: self.counters.total.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_hit_rate: cache_stats.hit_rate,
            active_requests: self.pool.stats().active_requests,
            last_calculated_at: *self.last_calculated.lock(),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn reset_stats(&self) {
        self.counters.total.store(0, Ordering::Relaxed);
        self.counters.errors.store(0, Ordering::Relaxed);
        self.counters.cache_hits.store(0, Ordering::Relaxed);
        *self.last_calculated.lock() = None;
    }

    /// The calculator catalogue, for registration and lookup.
    pub fn registry(&self) -> &Arc<CalculatorRegistry> {
        &self.registry
    }

    pub fn analyzer(&self) -> &Arc<BehaviorAnalyzer> {
        &self.analyzer
    }

    /// Stop maintenance tasks, cancel pending debounces, and shut the pool
    /// down. In-flight requests fail with `Cancelled`.
    pub fn shutdown(&self) {
        for task in &self.maintenance {
            task.abort();
        }
        self.debouncer.cancel_all();
        self.pool.shutdown();
        info!("realtime engine shut down");
    }

    /// Shared front half of both calculate paths: lookup, validation,
    /// normalisation, cache probe.
    fn prepare(&self, calc_id: &str, input: &CalcInput) -> Result<Prepared, EngineError> {
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        let calc = match self.registry.get(calc_id) {
            Some(calc) => calc,
            None => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(EngineError::unknown_calculator(calc_id));
            }
        };

        let validation_errors = calc.validate(input);
        if !validation_errors.is_empty() {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            return Err(EngineError::ValidationFailed(validation_errors));
        }

        let normalized = normalize(input);
        let key = fingerprint(calc_id, &normalized);
        if let Some(value) = self.cache.get(&key) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            // The keystroke reflects user intent even when the result was
            // memoised.
            self.analyzer.record(calc_id, "input", None);
            self.touch();
            debug!(calc_id, "cache hit");
            return Ok(Prepared::Hit(value));
        }

        Ok(Prepared::Miss {
            calc,
            key,
            input: normalized,
        })
    }

    fn make_job(&self, calc: Arc<dyn Calculator>, input: CalcInput, key: String) -> Job {
        let pool = self.pool.clone();
        let cache = self.cache.clone();
        Box::new(move || {
            Box::pin(async move {
                let calc_id = calc.id().to_string();
                let value = match pool.submit(&calc_id, input.clone()).await {
                    Ok(value) => value,
                    Err(
                        worker_err @ (EngineError::Timeout { .. }
                        | EngineError::WorkerError { .. }),
                    ) => {
                        warn!(calc_id = %calc_id, error = %worker_err, "worker path failed, attempting in-process fallback");
                        match run_in_process(calc.as_ref(), &input) {
                            Ok(value) => value,
                            Err(_) => return Err(worker_err),
                        }
                    }
                    Err(other) => return Err(other),
                };
                if !cache.put(&key, value.clone()) {
                    debug!(calc_id = %calc_id, "result exceeded cache cap, not stored");
                }
                Ok(value)
            })
        })
    }

    fn finish(&self, result: Result<Value, EngineError>) -> Result<Value, EngineError> {
        match &result {
            Ok(_) => self.touch(),
            // Superseded and cancelled outcomes are the coalescing design
            // working, not failures.
            Err(e) if !e.is_non_fatal() => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {}
        }
        result
    }

    fn touch(&self) {
        *self.last_calculated.lock() = Some(Utc::now());
    }
}

/// Fallback execution on the caller's thread; panics surface as errors.
fn run_in_process(calc: &dyn Calculator, input: &CalcInput) -> Result<Value, EngineError> {
    match catch_unwind(AssertUnwindSafe(|| calc.calculate(input))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(EngineError::worker(format!(
            "in-process calculation failed: {e}"
        ))),
        Err(_) => Err(EngineError::worker("in-process calculation panicked")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::{
        build_input, builtin, CalcValue, Category, FieldSpec, FnCalculator, InputSchema,
        ResultShape,
    };
    use crate::error::ValidationCode;
    use serde_json::json;

    fn engine_with_builtins() -> RealtimeEngine {
        let engine = RealtimeEngine::with_defaults();
        builtin::register_all(engine.registry()).unwrap();
        engine
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_calculator() {
        let engine = RealtimeEngine::with_defaults();
        let err = engine
            .calculate_immediate("ghost", &CalcInput::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::UnknownCalculator {
                calc_id: "ghost".into()
            }
        );
        assert_eq!(engine.stats().errors, 1);
        engine.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_failure_reaches_no_worker() {
        // Invalid mortgage input fails fast with field details.
        let engine = engine_with_builtins();
        let input = build_input([
            ("price", CalcValue::from(-1.0)),
            ("down", CalcValue::from(0.0)),
            ("rate", CalcValue::from(3.0)),
        ]);
        let err = engine.calculate("mortgage", &input).await.unwrap_err();
        match err {
            EngineError::ValidationFailed(errors) => {
                assert!(errors
                    .iter()
                    .any(|e| e.field == "price" && e.code == ValidationCode::MinValue));
            }
            other => panic!("expected ValidationFailed, got {other:?}"),
        }
        assert_eq!(engine.pool_stats().submitted, 0);
        assert_eq!(engine.stats().errors, 1);
        engine.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_calculation_and_cache_hit() {
        let engine = engine_with_builtins();
        let input = build_input([
            ("amount", CalcValue::from(100_000.0)),
            ("rate", CalcValue::from(0.0)),
            ("years", CalcValue::from(10i64)),
        ]);

        let first = engine.calculate_immediate("loan", &input).await.unwrap();
        assert_eq!(first["monthly_payment"], 833.33);
        assert_eq!(engine.pool_stats().submitted, 1);

        // Identical input: must hit the cache, no new submission.
        let second = engine.calculate_immediate("loan", &input).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(engine.pool_stats().submitted, 1);

        let stats = engine.stats();
        assert_eq!(stats.total_calculations, 2);
        assert_eq!(stats.cache_hits, 1);
        assert!(stats.last_calculated_at.is_some());
        engine.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_not_counted_as_error() {
        let engine = Arc::new(engine_with_builtins());
        let input_a = build_input([
            ("amount", CalcValue::from(200_000.0)),
            ("rate", CalcValue::from(3.5)),
            ("years", CalcValue::from(20i64)),
        ]);
        let input_b = build_input([
            ("amount", CalcValue::from(250_000.0)),
            ("rate", CalcValue::from(3.5)),
            ("years", CalcValue::from(20i64)),
        ]);

        let first = {
            let engine = engine.clone();
            let input = input_a.clone();
            tokio::spawn(async move { engine.calculate("loan", &input).await })
        };
        tokio::task::yield_now().await;
        let second = {
            let engine = engine.clone();
            let input = input_b.clone();
            tokio::spawn(async move { engine.calculate("loan", &input).await })
        };
        tokio::task::yield_now().await;

        tokio::time::advance(std::time::Duration::from_millis(1100)).await;

        assert_eq!(first.await.unwrap().unwrap_err(), EngineError::Superseded);
        assert!(second.await.unwrap().is_ok());
        assert_eq!(engine.stats().errors, 0);
        engine.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_result_is_cached() {
        // A calculator that panics on its first invocation (the worker) and
        // succeeds on the retry (the in-process fallback).
        let engine = RealtimeEngine::with_defaults();
        let flaky_once = std::sync::atomic::AtomicBool::new(true);
        engine
            .registry()
            .register(Arc::new(FnCalculator::new(
                "flaky",
                "Flaky",
                Category::Analysis,
                InputSchema::new(vec![FieldSpec::number("x", "Wert")]),
                ResultShape::metrics(&["y"]),
                move |input| {
                    if flaky_once.swap(false, Ordering::SeqCst) {
                        panic!("first call explodes");
                    }
                    let x = input.get("x").and_then(|v| v.as_f64()).unwrap_or(0.0);
                    Ok(json!({"y": x + 1.0}))
                },
            )))
            .unwrap();

        let input = build_input([("x", CalcValue::from(41.0))]);
        let result = engine.calculate_immediate("flaky", &input).await.unwrap();
        assert_eq!(result["y"], 42.0);
        assert_eq!(engine.pool_stats().errors, 1);

        // The fallback result was cached.
        let again = engine.calculate_immediate("flaky", &input).await.unwrap();
        assert_eq!(again["y"], 42.0);
        assert_eq!(engine.stats().cache_hits, 1);
        engine.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending() {
        let engine = Arc::new(engine_with_builtins());
        let input = build_input([
            ("amount", CalcValue::from(200_000.0)),
            ("rate", CalcValue::from(3.5)),
            ("years", CalcValue::from(20i64)),
        ]);

        let pending = {
            let engine = engine.clone();
            let input = input.clone();
            tokio::spawn(async move { engine.calculate("loan", &input).await })
        };
        tokio::task::yield_now().await;

        assert!(engine.cancel("loan"));
        assert!(!engine.cancel("loan"));
        assert_eq!(pending.await.unwrap().unwrap_err(), EngineError::Cancelled);
        engine.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_stats_and_clear_cache() {
        let engine = engine_with_builtins();
        let input = build_input([
            ("amount", CalcValue::from(100_000.0)),
            ("rate", CalcValue::from(2.0)),
            ("years", CalcValue::from(5i64)),
        ]);
        engine.calculate_immediate("loan", &input).await.unwrap();
        assert_eq!(engine.stats().total_calculations, 1);

        engine.reset_stats();
        let stats = engine.stats();
        assert_eq!(stats.total_calculations, 0);
        assert!(stats.last_calculated_at.is_none());

        engine.clear_cache();
        assert_eq!(engine.cache_stats().item_count, 0);
        engine.shutdown();
    }
}
