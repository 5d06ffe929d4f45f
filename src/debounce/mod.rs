//! Smart debouncer.
//!
//! Coalesces bursts of calls per calculator into a single delayed execution.
//! Scheduling a new call supersedes any pending call for the same calculator;
//! simultaneous deadlines across calculators fire in priority order through a
//! shared due-heap drained under a fire lock.

pub mod strategy;

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::behavior::BehaviorAnalyzer;
use crate::error::EngineError;
pub use strategy::{effective_delay, strategy_for, DebounceStrategy, Priority};

/// Future produced by a scheduled job.
pub type JobFuture = Pin<Box<dyn Future<Output = Result<Value, EngineError>> + Send>>;
/// Deferred calculation, invoked at most once when its task fires.
pub type Job = Box<dyn FnOnce() -> JobFuture + Send>;

/// Result channel of a scheduled call.
pub type ResultReceiver = oneshot::Receiver<Result<Value, EngineError>>;

struct ScheduledTask {
    task_id: Uuid,
    timer: JoinHandle<()>,
}

struct PendingJob {
    calc_id: String,
    job: Job,
    tx: oneshot::Sender<Result<Value, EngineError>>,
}

/// Heap entry; the "greatest" entry is the one that must fire first:
/// earliest deadline, then highest priority, then earliest schedule order.
struct DueEntry {
    deadline: Instant,
    rank: u8,
    seq: u64,
    task_id: Uuid,
}

impl PartialEq for DueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for DueEntry {}

impl Ord for DueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then(self.rank.cmp(&other.rank))
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for DueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct DebounceState {
    /// At most one active task per calculator id.
    active: HashMap<String, ScheduledTask>,
    jobs: HashMap<Uuid, PendingJob>,
    due: BinaryHeap<DueEntry>,
    seq: u64,
}

#[derive(Default)]
struct DebouncerCounters {
    scheduled: AtomicU64,
    superseded: AtomicU64,
    fired: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    immediate: AtomicU64,
}

/// Point-in-time debouncer statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebouncerStats {
    pub scheduled: u64,
    pub superseded: u64,
    pub fired: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub immediate: u64,
    pub pending: usize,
}

struct DebouncerShared {
    analyzer: Arc<BehaviorAnalyzer>,
    state: Mutex<DebounceState>,
    /// Serialises firing so simultaneous deadlines resolve in heap order.
    fire_lock: tokio::sync::Mutex<()>,
    counters: DebouncerCounters,
}

/// Per-calculator cancellable delayed trigger with adaptive delay.
#[derive(Clone)]
pub struct SmartDebouncer {
    shared: Arc<DebouncerShared>,
}

impl SmartDebouncer {
    pub fn new(analyzer: Arc<BehaviorAnalyzer>) -> Self {
        Self {
            shared: Arc::new(DebouncerShared {
                analyzer,
                state: Mutex::new(DebounceState {
                    active: HashMap::new(),
                    jobs: HashMap::new(),
                    due: BinaryHeap::new(),
                    seq: 0,
                }),
                fire_lock: tokio::sync::Mutex::new(()),
                counters: DebouncerCounters::default(),
            }),
        }
    }

    /// Schedule a job after the calculator's effective delay. Any pending
    /// task for the same calculator is superseded: its receiver yields
    /// `Err(Superseded)`.
    ///
    /// The returned receiver yields the job's result once the task fires.
    pub fn schedule(&self, calc_id: &str, complexity: u8, job: Job) -> ResultReceiver {
        self.shared.analyzer.record(calc_id, "input", None);
        self.shared.counters.scheduled.fetch_add(1, Ordering::Relaxed);

        let strategy = strategy_for(calc_id);
        let snapshot = self.shared.analyzer.snapshot();
        let familiarity = self.shared.analyzer.familiarity(calc_id);
        let delay_ms = effective_delay(&strategy, complexity, &snapshot, familiarity);
        let deadline = Instant::now() + std::time::Duration::from_millis(delay_ms);

        let (tx, rx) = oneshot::channel();
        let task_id = Uuid::new_v4();

        let mut state = self.shared.state.lock();
        if let Some(previous) = remove_task_locked(&mut state, calc_id) {
            self.shared.counters.superseded.fetch_add(1, Ordering::Relaxed);
            trace!(calc_id, "superseded pending debounce task");
            let _ = previous.tx.send(Err(EngineError::Superseded));
        }

        state.seq += 1;
        let seq = state.seq;
        state.due.push(DueEntry {
            deadline,
            rank: strategy.priority.rank(),
            seq,
            task_id,
        });
        state.jobs.insert(
            task_id,
            PendingJob {
                calc_id: calc_id.to_string(),
                job,
                tx,
            },
        );

        let debouncer = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            debouncer.fire_due().await;
        });
        state.active.insert(calc_id.to_string(), ScheduledTask { task_id, timer });
        debug!(calc_id, delay_ms, "scheduled debounced calculation");

        rx
    }

    /// Cancel any pending task for the calculator and run the job now.
    pub async fn execute_immediate(
        &self,
        calc_id: &str,
        job: Job,
    ) -> Result<Value, EngineError> {
        self.shared.analyzer.record(calc_id, "input", None);
        self.shared.counters.immediate.fetch_add(1, Ordering::Relaxed);

        let previous = {
            let mut state = self.shared.state.lock();
            remove_task_locked(&mut state, calc_id)
        };
        if let Some(previous) = previous {
            self.shared.counters.superseded.fetch_add(1, Ordering::Relaxed);
            let _ = previous.tx.send(Err(EngineError::Superseded));
        }

        let result = job().await;
        if result.is_err() {
            self.shared.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Cancel the pending task for one calculator, if any. Its receiver
    /// yields `Err(Cancelled)`.
    pub fn cancel(&self, calc_id: &str) -> bool {
        let previous = {
            let mut state = self.shared.state.lock();
            remove_task_locked(&mut state, calc_id)
        };
        match previous {
            Some(previous) => {
                self.shared.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                debug!(calc_id, "cancelled pending debounce task");
                let _ = previous.tx.send(Err(EngineError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Cancel every pending task.
    pub fn cancel_all(&self) -> usize {
        let pending: Vec<String> = self.shared.state.lock().active.keys().cloned().collect();
        pending.iter().filter(|id| self.cancel(id)).count()
    }

    pub fn stats(&self) -> DebouncerStats {
        let counters = &self.shared.counters;
        DebouncerStats {
            scheduled: counters.scheduled.load(Ordering::Relaxed),
            superseded: counters.superseded.load(Ordering::Relaxed),
            fired: counters.fired.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
            immediate: counters.immediate.load(Ordering::Relaxed),
            pending: self.shared.state.lock().active.len(),
        }
    }

    /// Drain and execute every due task, most urgent first.
    ///
    /// Execution is serialised under the fire lock, so when deadlines
    /// coincide the heap order (deadline, priority, schedule order) is also
    /// the resolution order.
    async fn fire_due(&self) {
        let _guard = self.shared.fire_lock.lock().await;
        loop {
            let pending = {
                let mut state = self.shared.state.lock();
                let now = Instant::now();
                let mut next = None;
                while let Some(top) = state.due.peek() {
                    if top.deadline > now {
                        break;
                    }
                    let top = state.due.pop().expect("peeked entry");
                    // Superseded and cancelled tasks leave stale heap
                    // entries behind; skip them.
                    if let Some(job) = state.jobs.remove(&top.task_id) {
                        if let Some(active) = state.active.get(&job.calc_id) {
                            if active.task_id == top.task_id {
                                state.active.remove(&job.calc_id);
                            }
                        }
                        next = Some(job);
                        break;
                    }
                }
                next
            };

            let Some(pending) = pending else { break };
            self.shared.counters.fired.fetch_add(1, Ordering::Relaxed);
            trace!(calc_id = %pending.calc_id, "debounce task fired");
            let result = (pending.job)().await;
            if result.is_err() {
                self.shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            let _ = pending.tx.send(result);
        }
    }
}

fn remove_task_locked(state: &mut DebounceState, calc_id: &str) -> Option<PendingJob> {
    let task = state.active.remove(calc_id)?;
    task.timer.abort();
    state.jobs.remove(&task.task_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalyzerConfig;
    use serde_json::json;
    use std::time::Duration;

    fn debouncer() -> SmartDebouncer {
        SmartDebouncer::new(Arc::new(BehaviorAnalyzer::new(AnalyzerConfig::default())))
    }

    fn job_returning(value: Value) -> Job {
        Box::new(move || Box::pin(async move { Ok(value) }))
    }

    fn job_recording(log: Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Job {
        Box::new(move || {
            Box::pin(async move {
                log.lock().push(tag);
                Ok(json!(tag))
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_schedule_fires_after_delay() {
        let debouncer = debouncer();
        let rx = debouncer.schedule("loan", 5, job_returning(json!(42)));

        // Effective delay is within the loan bounds; a long advance covers it.
        tokio::time::advance(Duration::from_millis(1100)).await;
        let result = rx.await.unwrap().unwrap();
        assert_eq!(result, json!(42));
        let stats = debouncer.stats();
        assert_eq!(stats.fired, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_last_wins() {
        // Five schedules within the delay window: only the last
        // fires, the rest are superseded.
        let debouncer = debouncer();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut receivers = Vec::new();
        for tag in ["i0", "i1", "i2", "i3"] {
            receivers.push(debouncer.schedule("loan", 5, job_recording(log.clone(), tag)));
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        let last = debouncer.schedule("loan", 5, job_recording(log.clone(), "i4"));

        tokio::time::advance(Duration::from_millis(1100)).await;

        assert_eq!(last.await.unwrap().unwrap(), json!("i4"));
        for rx in receivers {
            assert_eq!(rx.await.unwrap().unwrap_err(), EngineError::Superseded);
        }
        assert_eq!(*log.lock(), vec!["i4"]);

        let stats = debouncer.stats();
        assert_eq!(stats.scheduled, 5);
        assert_eq!(stats.superseded, 4);
        assert_eq!(stats.fired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_breaks_deadline_ties() {
        // Engineer identical deadlines for a high- and a
        // low-priority calculator, observe resolution order.
        let debouncer = debouncer();
        let log = Arc::new(Mutex::new(Vec::new()));

        // retirement (low): first event, freq < 0.5, familiarity < 3,
        // complexity 1: 800 x 0.8 x 0.88 x 0.85 = 478.7 -> clamped to 600.
        let low = debouncer.schedule("retirement", 1, job_recording(log.clone(), "low"));

        // compound-interest (high), complexity 5:
        // 500 x 0.8 x 1.2 x 0.85 = 408. Schedule 192 ms later so both
        // deadlines land exactly 600 ms after the start.
        tokio::time::advance(Duration::from_millis(192)).await;
        let high = debouncer.schedule("compound-interest", 5, job_recording(log.clone(), "high"));

        tokio::time::advance(Duration::from_millis(408)).await;

        assert!(high.await.unwrap().is_ok());
        assert!(low.await.unwrap().is_ok());
        assert_eq!(*log.lock(), vec!["high", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_rejects_with_cancelled() {
        let debouncer = debouncer();
        let log = Arc::new(Mutex::new(Vec::new()));
        let rx = debouncer.schedule("loan", 5, job_recording(log.clone(), "x"));

        assert!(debouncer.cancel("loan"));
        assert!(!debouncer.cancel("loan"));

        assert_eq!(rx.await.unwrap().unwrap_err(), EngineError::Cancelled);
        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(log.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let debouncer = debouncer();
        let rx1 = debouncer.schedule("loan", 5, job_returning(json!(1)));
        let rx2 = debouncer.schedule("mortgage", 5, job_returning(json!(2)));

        assert_eq!(debouncer.cancel_all(), 2);
        assert_eq!(rx1.await.unwrap().unwrap_err(), EngineError::Cancelled);
        assert_eq!(rx2.await.unwrap().unwrap_err(), EngineError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_immediate_supersedes_pending() {
        let debouncer = debouncer();
        let log = Arc::new(Mutex::new(Vec::new()));
        let rx = debouncer.schedule("loan", 5, job_recording(log.clone(), "debounced"));

        let result = debouncer
            .execute_immediate("loan", job_recording(log.clone(), "immediate"))
            .await
            .unwrap();
        assert_eq!(result, json!("immediate"));
        assert_eq!(rx.await.unwrap().unwrap_err(), EngineError::Superseded);

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert_eq!(*log.lock(), vec!["immediate"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_calculators_both_fire() {
        let debouncer = debouncer();
        let rx1 = debouncer.schedule("loan", 5, job_returning(json!(1)));
        let rx2 = debouncer.schedule("mortgage", 5, job_returning(json!(2)));

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(rx1.await.unwrap().unwrap(), json!(1));
        assert_eq!(rx2.await.unwrap().unwrap(), json!(2));
        assert_eq!(debouncer.stats().fired, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_job_propagates_error() {
        let debouncer = debouncer();
        let job: Job = Box::new(|| {
            Box::pin(async { Err(EngineError::worker("kaputt")) })
        });
        let rx = debouncer.schedule("loan", 5, job);
        tokio::time::advance(Duration::from_millis(1100)).await;

        assert_eq!(
            rx.await.unwrap().unwrap_err(),
            EngineError::worker("kaputt")
        );
        assert_eq!(debouncer.stats().failed, 1);
    }
}
