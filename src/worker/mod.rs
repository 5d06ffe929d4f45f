//! Worker pool manager.
//!
//! Executes calculations off the caller's task with bounded parallelism.
//! Routing prefers ready workers whose affinity set contains the calculator,
//! then the least-loaded; a new worker is spawned when load demands it and
//! the cap allows. Health tracking replaces workers past the error
//! threshold, a janitor tick reaps idle workers and sweeps overdue requests,
//! and every request carries its own timeout.

pub mod messages;
mod worker;

pub use messages::{RequestKind, ResponseKind, WorkerRequest, WorkerResponse};

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::calculator::{CalcInput, CalculatorRegistry};
use crate::config::WorkerPoolConfig;
use crate::error::EngineError;

/// Response queue shared by all workers.
const RESPONSE_QUEUE: usize = 256;
/// Consecutive timeouts before a worker's error counter is charged.
const TIMEOUT_PATTERN: u32 = 2;

struct WorkerHandle {
    channels: worker::WorkerChannels,
    ready: bool,
    active: usize,
    completed: u64,
    errors: u64,
    consecutive_timeouts: u32,
    avg_latency_ms: f64,
    last_used: Instant,
    affinity: HashSet<String>,
}

struct Inflight {
    calc_id: String,
    worker_id: u32,
    submitted_at: Instant,
    tx: oneshot::Sender<Result<Value, EngineError>>,
    timeout_task: JoinHandle<()>,
}

struct PoolState {
    workers: HashMap<u32, WorkerHandle>,
    next_worker_id: u32,
    inflight: HashMap<Uuid, Inflight>,
}

#[derive(Default)]
struct PoolCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    cancelled: AtomicU64,
    spawned: AtomicU64,
    reaped: AtomicU64,
    replaced: AtomicU64,
}

/// Per-worker view for diagnostics.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub id: u32,
    pub ready: bool,
    pub active: usize,
    pub completed: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
    pub affinity: Vec<String>,
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub workers: usize,
    pub ready_workers: usize,
    pub active_requests: usize,
    pub submitted: u64,
    pub completed: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub spawned: u64,
    pub reaped: u64,
    pub replaced: u64,
    pub per_worker: Vec<WorkerSnapshot>,
}

struct PoolCore {
    config: WorkerPoolConfig,
    registry: Arc<CalculatorRegistry>,
    state: Mutex<PoolState>,
    resp_tx: mpsc::Sender<(u32, WorkerResponse)>,
    counters: PoolCounters,
}

/// Fixed-cap pool of background calculation workers.
pub struct WorkerPool {
    core: Arc<PoolCore>,
    dispatcher: JoinHandle<()>,
    janitor: JoinHandle<()>,
}

impl WorkerPool {
    /// Spawns the initial workers, the response dispatcher, and the janitor
    /// tick. Must be called within a tokio runtime.
    pub fn new(config: WorkerPoolConfig, registry: Arc<CalculatorRegistry>) -> Self {
        let (resp_tx, resp_rx) = mpsc::channel(RESPONSE_QUEUE);
        let core = Arc::new(PoolCore {
            config: config.clone(),
            registry,
            state: Mutex::new(PoolState {
                workers: HashMap::new(),
                next_worker_id: 0,
                inflight: HashMap::new(),
            }),
            resp_tx,
            counters: PoolCounters::default(),
        });

        {
            let mut state = core.state.lock();
            for _ in 0..config.initial_workers.min(config.max_workers) {
                core.spawn_worker_locked(&mut state);
            }
        }

        let dispatcher = tokio::spawn(run_dispatcher(core.clone(), resp_rx));
        let janitor = tokio::spawn(run_janitor(core.clone()));
        Self {
            core,
            dispatcher,
            janitor,
        }
    }

    /// Submit a calculation. Resolves with the worker's result, or with
    /// `Timeout`/`WorkerError`/`Cancelled` on the corresponding terminal
    /// state.
    pub async fn submit(&self, calc_id: &str, input: CalcInput) -> Result<Value, EngineError> {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();

        let req_tx = {
            let mut state = self.core.state.lock();
            let worker_id = self.core.select_worker_locked(&mut state, calc_id);
            let timeout_task = tokio::spawn(enforce_timeout(self.core.clone(), request_id));
            let now = Instant::now();
            state.inflight.insert(
                request_id,
                Inflight {
                    calc_id: calc_id.to_string(),
                    worker_id,
                    submitted_at: now,
                    tx,
                    timeout_task,
                },
            );
            let handle = state
                .workers
                .get_mut(&worker_id)
                .expect("selected worker exists");
            handle.active += 1;
            handle.last_used = now;
            handle.channels.req_tx.clone()
        };
        self.core.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let request = WorkerRequest::calculate(request_id, calc_id, input);
        if req_tx.send(request).await.is_err() {
            // The worker dropped its queue: treat as a crash.
            self.core
                .fail_request(request_id, EngineError::worker("worker queue closed"));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(EngineError::worker("worker pool shut down")),
        }
    }

    /// Cancel an in-flight request. The cancel message is broadcast to every
    /// worker; a worker that has already started may finish and have its
    /// result discarded.
    pub fn cancel_calculation(&self, request_id: Uuid) -> bool {
        let senders: Vec<mpsc::Sender<WorkerRequest>> = {
            let state = self.core.state.lock();
            if !state.inflight.contains_key(&request_id) {
                return false;
            }
            state
                .workers
                .values()
                .map(|w| w.channels.req_tx.clone())
                .collect()
        };
        for sender in senders {
            let _ = sender.try_send(WorkerRequest::cancel(request_id));
        }
        let cancelled = self.core.fail_request(request_id, EngineError::Cancelled);
        if cancelled {
            self.core.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        }
        cancelled
    }

    pub fn stats(&self) -> PoolStats {
        self.core.stats()
    }

    /// Run one maintenance pass now (normally driven by the janitor tick).
    pub fn run_maintenance(&self) {
        self.core.maintenance_pass();
    }

    /// Stop every worker and fail all in-flight requests with `Cancelled`.
    pub fn shutdown(&self) {
        self.dispatcher.abort();
        self.janitor.abort();

        let (inflight, workers) = {
            let mut state = self.core.state.lock();
            let inflight: Vec<Inflight> = state.inflight.drain().map(|(_, v)| v).collect();
            let workers: Vec<WorkerHandle> = state.workers.drain().map(|(_, v)| v).collect();
            (inflight, workers)
        };
        for entry in inflight {
            entry.timeout_task.abort();
            let _ = entry.tx.send(Err(EngineError::Cancelled));
        }
        for handle in workers {
            handle.channels.task.abort();
        }
        info!("worker pool shut down");
    }
}

impl PoolCore {
    fn spawn_worker_locked(&self, state: &mut PoolState) -> u32 {
        let worker_id = state.next_worker_id;
        state.next_worker_id += 1;
        let channels = worker::spawn(worker_id, self.registry.clone(), self.resp_tx.clone());
        state.workers.insert(
            worker_id,
            WorkerHandle {
                channels,
                ready: false,
                active: 0,
                completed: 0,
                errors: 0,
                consecutive_timeouts: 0,
                avg_latency_ms: 0.0,
                last_used: Instant::now(),
                affinity: HashSet::new(),
            },
        );
        self.counters.spawned.fetch_add(1, Ordering::Relaxed);
        debug!(worker_id, "spawned worker");
        worker_id
    }

    /// Routing policy: among ready workers, those whose affinity set holds
    /// the calculator are preferred outright; within the preferred set (or
    /// all ready workers when none has the affinity) the fewest active
    /// requests wins. When no worker has the affinity and every candidate
    /// is busy, a fresh worker is spawned while the cap allows.
    fn select_worker_locked(&self, state: &mut PoolState, calc_id: &str) -> u32 {
        let ready: Vec<u32> = state
            .workers
            .iter()
            .filter(|(_, w)| w.ready)
            .map(|(id, _)| *id)
            .collect();

        let candidates: Vec<u32> = if ready.is_empty() {
            // Startup: route to a spawned-but-not-yet-ready worker, the
            // request queues until its READY lands.
            state.workers.keys().copied().collect()
        } else {
            ready
        };

        let preferred: Vec<u32> = candidates
            .iter()
            .copied()
            .filter(|id| state.workers[id].affinity.contains(calc_id))
            .collect();
        let has_affinity = !preferred.is_empty();
        let pick_from = if has_affinity { preferred } else { candidates };

        let best = pick_from
            .iter()
            .copied()
            .min_by_key(|id| (state.workers[id].active, *id));

        match best {
            None => self.spawn_worker_locked(state),
            Some(id)
                if !has_affinity
                    && state.workers[&id].active > 0
                    && state.workers.len() < self.config.max_workers =>
            {
                self.spawn_worker_locked(state)
            }
            Some(id) => id,
        }
    }

    /// Terminate a request from outside the dispatcher (timeout, cancel,
    /// send failure). Returns false when the request already reached a
    /// terminal state.
    fn fail_request(&self, request_id: Uuid, error: EngineError) -> bool {
        let entry = {
            let mut state = self.state.lock();
            let entry = match state.inflight.remove(&request_id) {
                Some(entry) => entry,
                None => return false,
            };
            if let Some(handle) = state.workers.get_mut(&entry.worker_id) {
                handle.active = handle.active.saturating_sub(1);
                if matches!(error, EngineError::Timeout { .. }) {
                    handle.consecutive_timeouts += 1;
                    // A single timeout is not held against the worker, a
                    // pattern is.
                    if handle.consecutive_timeouts >= TIMEOUT_PATTERN {
                        handle.errors += 1;
                    }
                }
            }
            entry
        };
        entry.timeout_task.abort();
        if matches!(error, EngineError::Timeout { .. }) {
            self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
            warn!(request_id = %request_id, calc_id = %entry.calc_id, "calculation request timed out");
        }
        let _ = entry.tx.send(Err(error));
        true
    }

    /// Dispatcher path: a worker responded to an in-flight request.
    fn handle_completion(&self, worker_id: u32, response: WorkerResponse) {
        let entry = {
            let mut state = self.state.lock();
            let entry = match state.inflight.remove(&response.id) {
                Some(entry) => entry,
                // Already timed out or cancelled; the late result is
                // discarded.
                None => return,
            };
            let needs_replacement = match state.workers.get_mut(&worker_id) {
                Some(handle) => {
                    handle.active = handle.active.saturating_sub(1);
                    handle.last_used = Instant::now();
                    handle.consecutive_timeouts = 0;
                    handle.affinity.insert(entry.calc_id.clone());
                    if response.success {
                        handle.completed += 1;
                        let n = handle.completed as f64;
                        handle.avg_latency_ms +=
                            (response.duration_ms as f64 - handle.avg_latency_ms) / n;
                    } else {
                        handle.errors += 1;
                    }
                    handle.errors > self.config.error_threshold
                }
                None => false,
            };
            if needs_replacement {
                self.replace_worker_locked(&mut state, worker_id);
            }
            entry
        };

        entry.timeout_task.abort();
        if response.success {
            self.counters.completed.fetch_add(1, Ordering::Relaxed);
            let _ = entry
                .tx
                .send(Ok(response.result.unwrap_or(Value::Null)));
        } else {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            let message = response
                .error
                .unwrap_or_else(|| "worker reported failure".to_string());
            let _ = entry.tx.send(Err(EngineError::worker(message)));
        }
    }

    /// Terminate a worker past the error threshold and spawn its successor.
    /// The dead worker's remaining in-flight requests fail immediately.
    fn replace_worker_locked(&self, state: &mut PoolState, worker_id: u32) {
        let Some(handle) = state.workers.remove(&worker_id) else {
            return;
        };
        handle.channels.task.abort();
        warn!(worker_id, errors = handle.errors, "replacing unhealthy worker");

        let orphaned: Vec<Uuid> = state
            .inflight
            .iter()
            .filter(|(_, e)| e.worker_id == worker_id)
            .map(|(id, _)| *id)
            .collect();
        for request_id in orphaned {
            if let Some(entry) = state.inflight.remove(&request_id) {
                entry.timeout_task.abort();
                let _ = entry
                    .tx
                    .send(Err(EngineError::worker("worker replaced mid-flight")));
            }
        }

        self.counters.replaced.fetch_add(1, Ordering::Relaxed);
        self.spawn_worker_locked(state);
    }

    /// Janitor pass: fail overdue in-flight requests (backstop behind the
    /// per-request timers) and reap idle workers, never the last one.
    fn maintenance_pass(&self) {
        let overdue: Vec<Uuid> = {
            let state = self.state.lock();
            let now = Instant::now();
            state
                .inflight
                .iter()
                .filter(|(_, e)| now.duration_since(e.submitted_at) >= self.config.request_timeout)
                .map(|(id, _)| *id)
                .collect()
        };
        let limit_ms = self.config.request_timeout.as_millis() as u64;
        for request_id in overdue {
            self.fail_request(request_id, EngineError::Timeout { limit_ms });
        }

        let reaped: Vec<WorkerHandle> = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let mut idle: Vec<u32> = state
                .workers
                .iter()
                .filter(|(_, w)| {
                    w.active == 0 && now.duration_since(w.last_used) >= self.config.idle_timeout
                })
                .map(|(id, _)| *id)
                .collect();
            // Oldest first, and always keep one worker alive.
            idle.sort_by_key(|id| state.workers[id].last_used);
            let mut handles = Vec::new();
            for id in idle {
                if state.workers.len() <= 1 {
                    break;
                }
                if let Some(handle) = state.workers.remove(&id) {
                    info!(worker_id = id, "reaped idle worker");
                    handles.push(handle);
                }
            }
            handles
        };
        for handle in &reaped {
            handle.channels.task.abort();
        }
        if !reaped.is_empty() {
            self.counters
                .reaped
                .fetch_add(reaped.len() as u64, Ordering::Relaxed);
        }
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let per_worker: Vec<WorkerSnapshot> = {
            let mut workers: Vec<WorkerSnapshot> = state
                .workers
                .iter()
                .map(|(id, w)| WorkerSnapshot {
                    id: *id,
                    ready: w.ready,
                    active: w.active,
                    completed: w.completed,
                    errors: w.errors,
                    avg_latency_ms: w.avg_latency_ms,
                    affinity: w.affinity.iter().cloned().collect(),
                })
                .collect();
            workers.sort_by_key(|w| w.id);
            workers
        };

        PoolStats {
            workers: state.workers.len(),
            ready_workers: state.workers.values().filter(|w| w.ready).count(),
            active_requests: state.inflight.len(),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            spawned: self.counters.spawned.load(Ordering::Relaxed),
            reaped: self.counters.reaped.load(Ordering::Relaxed),
            replaced: self.counters.replaced.load(Ordering::Relaxed),
            per_worker,
        }
    }
}

async fn run_dispatcher(core: Arc<PoolCore>, mut resp_rx: mpsc::Receiver<(u32, WorkerResponse)>) {
    while let Some((worker_id, response)) = resp_rx.recv().await {
        match response.kind {
            ResponseKind::Ready => {
                let mut state = core.state.lock();
                if let Some(handle) = state.workers.get_mut(&worker_id) {
                    handle.ready = true;
                    debug!(worker_id, "worker reported ready");
                }
            }
            ResponseKind::Status => {
                debug!(worker_id, status = ?response.result, "worker status");
            }
            ResponseKind::Result | ResponseKind::Error => {
                core.handle_completion(worker_id, response);
            }
        }
    }
}

async fn run_janitor(core: Arc<PoolCore>) {
    let mut tick = interval(core.config.cleanup_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        core.maintenance_pass();
    }
}

async fn enforce_timeout(core: Arc<PoolCore>, request_id: Uuid) {
    tokio::time::sleep(core.config.request_timeout).await;
    let limit_ms = core.config.request_timeout.as_millis() as u64;
    core.fail_request(request_id, EngineError::Timeout { limit_ms });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::{
        build_input, CalcValue, Category, FieldSpec, FnCalculator, InputSchema, ResultShape,
    };
    use serde_json::json;
    use std::time::Duration;

    fn test_registry() -> Arc<CalculatorRegistry> {
        let registry = CalculatorRegistry::new();
        registry
            .register(Arc::new(FnCalculator::new(
                "doubler",
                "Doubler",
                Category::Analysis,
                InputSchema::new(vec![FieldSpec::number("x", "Wert")]),
                ResultShape::metrics(&["y"]),
                |input| {
                    let x = input.get("x").and_then(|v| v.as_f64()).unwrap_or(0.0);
                    Ok(json!({"y": x * 2.0}))
                },
            )))
            .unwrap();
        registry
            .register(Arc::new(FnCalculator::new(
                "panicker",
                "Panicker",
                Category::Analysis,
                InputSchema::new(vec![FieldSpec::number("x", "Wert")]),
                ResultShape::metrics(&["y"]),
                |_| panic!("deliberate test panic"),
            )))
            .unwrap();
        Arc::new(registry)
    }

    fn pool_config() -> WorkerPoolConfig {
        WorkerPoolConfig {
            initial_workers: 2,
            max_workers: 4,
            request_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            error_threshold: 5,
            cleanup_interval: Duration::from_secs(60),
        }
    }

    async fn wait_ready(pool: &WorkerPool, count: usize) {
        for _ in 0..100 {
            if pool.stats().ready_workers >= count {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("workers never became ready");
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_roundtrip() {
        let pool = WorkerPool::new(pool_config(), test_registry());
        wait_ready(&pool, 2).await;

        let input = build_input([("x", CalcValue::from(21.0))]);
        let result = pool.submit("doubler", input).await.unwrap();
        assert_eq!(result["y"], 42.0);

        let stats = pool.stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.active_requests, 0);
        pool.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_calculator_is_worker_error() {
        let pool = WorkerPool::new(pool_config(), test_registry());
        wait_ready(&pool, 2).await;

        let err = pool.submit("ghost", CalcInput::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::WorkerError { .. }));
        assert_eq!(pool.stats().errors, 1);
        pool.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_calculator_is_worker_error() {
        let pool = WorkerPool::new(pool_config(), test_registry());
        wait_ready(&pool, 2).await;

        let input = build_input([("x", CalcValue::from(1.0))]);
        let err = pool.submit("panicker", input).await.unwrap_err();
        match err {
            EngineError::WorkerError { message } => {
                assert!(message.contains("panicked"), "{message}");
            }
            other => panic!("expected WorkerError, got {other:?}"),
        }
        assert_eq!(pool.stats().errors, 1);
        pool.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_cap_never_exceeded() {
        // Saturate the pool far past the cap with concurrent
        // submissions.
        let pool = Arc::new(WorkerPool::new(pool_config(), test_registry()));
        wait_ready(&pool, 2).await;

        let mut handles = Vec::new();
        for i in 0..32 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let input = build_input([("x", CalcValue::from(i as f64))]);
                pool.submit("doubler", input).await
            }));
        }
        for _ in 0..8 {
            tokio::task::yield_now().await;
            assert!(pool.stats().workers <= 4);
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        let stats = pool.stats();
        assert!(stats.workers <= 4);
        assert_eq!(stats.completed, 32);
        pool.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_affinity_prefers_previous_worker() {
        // After a worker handled a calculator, an idle pool routes the next
        // submission for it back to the same worker.
        let pool = WorkerPool::new(pool_config(), test_registry());
        wait_ready(&pool, 2).await;

        let input = build_input([("x", CalcValue::from(1.0))]);
        pool.submit("doubler", input.clone()).await.unwrap();

        let first: Vec<u32> = pool
            .stats()
            .per_worker
            .iter()
            .filter(|w| w.completed == 1)
            .map(|w| w.id)
            .collect();
        assert_eq!(first.len(), 1);

        let input2 = build_input([("x", CalcValue::from(2.0))]);
        pool.submit("doubler", input2).await.unwrap();

        let snapshot = pool.stats();
        let veteran = snapshot
            .per_worker
            .iter()
            .find(|w| w.id == first[0])
            .unwrap();
        assert_eq!(veteran.completed, 2);
        assert!(veteran.affinity.contains(&"doubler".to_string()));
        pool.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_affinity_outranks_lighter_load() {
        // Affinity is a preference, not a tie-break: the worker that has
        // the calculator loaded wins even while busier than an idle worker
        // without it.
        let pool = WorkerPool::new(pool_config(), test_registry());
        wait_ready(&pool, 2).await;

        let mut state = pool.core.state.lock();
        let mut ids: Vec<u32> = state.workers.keys().copied().collect();
        ids.sort_unstable();
        let (veteran, idle) = (ids[0], ids[1]);
        {
            let handle = state.workers.get_mut(&veteran).unwrap();
            handle.affinity.insert("doubler".to_string());
            handle.active = 1;
        }

        assert_eq!(
            pool.core.select_worker_locked(&mut state, "doubler"),
            veteran
        );
        // Without affinity anywhere, load decides and the idle worker wins.
        assert_eq!(
            pool.core.select_worker_locked(&mut state, "panicker"),
            idle
        );
        drop(state);
        pool.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects_request() {
        // Simulated unresponsive worker: an in-flight entry that never
        // responds is failed by the per-request timer.
        let pool = WorkerPool::new(pool_config(), test_registry());
        wait_ready(&pool, 2).await;

        let (tx, rx) = oneshot::channel();
        let request_id = Uuid::new_v4();
        {
            let mut state = pool.core.state.lock();
            let worker_id = *state.workers.keys().next().unwrap();
            let timeout_task = tokio::spawn(enforce_timeout(pool.core.clone(), request_id));
            state.inflight.insert(
                request_id,
                Inflight {
                    calc_id: "doubler".into(),
                    worker_id,
                    submitted_at: Instant::now(),
                    tx,
                    timeout_task,
                },
            );
            state.workers.get_mut(&worker_id).unwrap().active += 1;
        }

        tokio::time::advance(Duration::from_secs(11)).await;
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err, EngineError::Timeout { limit_ms: 10_000 });
        assert_eq!(pool.stats().timeouts, 1);
        assert_eq!(pool.stats().active_requests, 0);
        pool.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_janitor_sweeps_overdue_requests() {
        let pool = WorkerPool::new(pool_config(), test_registry());
        wait_ready(&pool, 2).await;

        // Entry without a live timer: only the janitor can fail it.
        let (tx, rx) = oneshot::channel();
        let request_id = Uuid::new_v4();
        {
            let mut state = pool.core.state.lock();
            let worker_id = *state.workers.keys().next().unwrap();
            let timeout_task = tokio::spawn(async {});
            state.inflight.insert(
                request_id,
                Inflight {
                    calc_id: "doubler".into(),
                    worker_id,
                    submitted_at: Instant::now(),
                    tx,
                    timeout_task,
                },
            );
        }

        tokio::time::advance(Duration::from_secs(11)).await;
        pool.run_maintenance();

        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err, EngineError::Timeout { limit_ms: 10_000 });
        pool.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_reaping_keeps_last_worker() {
        let pool = WorkerPool::new(pool_config(), test_registry());
        wait_ready(&pool, 2).await;

        tokio::time::advance(Duration::from_secs(301)).await;
        pool.run_maintenance();

        let stats = pool.stats();
        assert_eq!(stats.workers, 1);
        assert_eq!(stats.reaped, 1);

        // Another pass must not reap the survivor.
        tokio::time::advance(Duration::from_secs(301)).await;
        pool.run_maintenance();
        assert_eq!(pool.stats().workers, 1);
        pool.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_threshold_replaces_worker() {
        let registry = test_registry();
        let config = WorkerPoolConfig {
            initial_workers: 1,
            error_threshold: 2,
            ..pool_config()
        };
        let pool = WorkerPool::new(config, registry);
        wait_ready(&pool, 1).await;

        let original_id = pool.stats().per_worker[0].id;
        for _ in 0..3 {
            let input = build_input([("x", CalcValue::from(1.0))]);
            let _ = pool.submit("panicker", input).await;
        }

        let stats = pool.stats();
        assert_eq!(stats.replaced, 1);
        assert_eq!(stats.workers, 1);
        assert_ne!(stats.per_worker[0].id, original_id);
        pool.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_calculation() {
        let pool = WorkerPool::new(pool_config(), test_registry());
        wait_ready(&pool, 2).await;

        // Unknown request id is a no-op.
        assert!(!pool.cancel_calculation(Uuid::new_v4()));

        let (tx, rx) = oneshot::channel();
        let request_id = Uuid::new_v4();
        {
            let mut state = pool.core.state.lock();
            let worker_id = *state.workers.keys().next().unwrap();
            let timeout_task = tokio::spawn(enforce_timeout(pool.core.clone(), request_id));
            state.inflight.insert(
                request_id,
                Inflight {
                    calc_id: "doubler".into(),
                    worker_id,
                    submitted_at: Instant::now(),
                    tx,
                    timeout_task,
                },
            );
        }

        assert!(pool.cancel_calculation(request_id));
        assert_eq!(rx.await.unwrap().unwrap_err(), EngineError::Cancelled);
        assert_eq!(pool.stats().cancelled, 1);
        pool.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_fails_inflight() {
        let pool = WorkerPool::new(pool_config(), test_registry());
        wait_ready(&pool, 2).await;

        let (tx, rx) = oneshot::channel();
        let request_id = Uuid::new_v4();
        {
            let mut state = pool.core.state.lock();
            let worker_id = *state.workers.keys().next().unwrap();
            let timeout_task = tokio::spawn(async {});
            state.inflight.insert(
                request_id,
                Inflight {
                    calc_id: "doubler".into(),
                    worker_id,
                    submitted_at: Instant::now(),
                    tx,
                    timeout_task,
                },
            );
        }

        pool.shutdown();
        assert_eq!(rx.await.unwrap().unwrap_err(), EngineError::Cancelled);
        assert_eq!(pool.stats().workers, 0);
    }
}
