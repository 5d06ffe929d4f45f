//! The worker task.
//!
//! A worker owns an mpsc request receiver and shares one response channel
//! back to the pool dispatcher. It announces readiness with `READY`, caches
//! the calculators it has executed, and turns panicking calculations into
//! error responses.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

use super::messages::{RequestKind, WorkerRequest, WorkerResponse};
use crate::calculator::{CalcInput, Calculator, CalculatorRegistry};

/// Request queue depth per worker.
const REQUEST_QUEUE: usize = 64;
/// Cap on remembered cancel ids.
const CANCEL_MEMORY: usize = 256;

pub(crate) struct WorkerChannels {
    pub req_tx: mpsc::Sender<WorkerRequest>,
    pub task: JoinHandle<()>,
}

pub(crate) fn spawn(
    worker_id: u32,
    registry: Arc<CalculatorRegistry>,
    resp_tx: mpsc::Sender<(u32, WorkerResponse)>,
) -> WorkerChannels {
    let (req_tx, req_rx) = mpsc::channel(REQUEST_QUEUE);
    let task = tokio::spawn(run(worker_id, registry, req_rx, resp_tx));
    WorkerChannels { req_tx, task }
}

async fn run(
    worker_id: u32,
    registry: Arc<CalculatorRegistry>,
    mut req_rx: mpsc::Receiver<WorkerRequest>,
    resp_tx: mpsc::Sender<(u32, WorkerResponse)>,
) {
    // Readiness handshake: the pool routes to this worker only after it has
    // seen READY.
    if resp_tx.send((worker_id, WorkerResponse::ready())).await.is_err() {
        return;
    }
    debug!(worker_id, "worker ready");

    let mut loaded: HashMap<String, Arc<dyn Calculator>> = HashMap::new();
    let mut cancelled: HashSet<Uuid> = HashSet::new();

    while let Some(request) = req_rx.recv().await {
        match request.kind {
            RequestKind::Calculate => {
                if cancelled.remove(&request.id) {
                    trace!(worker_id, request_id = %request.id, "skipping cancelled request");
                    continue;
                }
                let response = execute(&mut loaded, &registry, &request);
                if resp_tx.send((worker_id, response)).await.is_err() {
                    break;
                }
            }
            RequestKind::Cancel => {
                if cancelled.len() >= CANCEL_MEMORY {
                    cancelled.clear();
                }
                cancelled.insert(request.id);
            }
            RequestKind::Status => {
                let detail = serde_json::json!({
                    "worker_id": worker_id,
                    "loaded_calculators": loaded.keys().collect::<Vec<_>>(),
                });
                if resp_tx
                    .send((worker_id, WorkerResponse::status(detail)))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            RequestKind::Init => {
                let _ = load(&mut loaded, &registry, &request.calculator_id);
            }
        }
    }
    debug!(worker_id, "worker terminated");
}

fn execute(
    loaded: &mut HashMap<String, Arc<dyn Calculator>>,
    registry: &CalculatorRegistry,
    request: &WorkerRequest,
) -> WorkerResponse {
    let started = std::time::Instant::now();
    let calc = match load(loaded, registry, &request.calculator_id) {
        Some(calc) => calc,
        None => {
            return WorkerResponse::error(
                request.id,
                &request.calculator_id,
                format!("unknown calculator: {}", request.calculator_id),
                0,
            )
        }
    };

    let input: CalcInput = request.data.clone().unwrap_or_default();
    let outcome = catch_unwind(AssertUnwindSafe(|| calc.calculate(&input)));
    let duration_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(Ok(value)) => WorkerResponse::result(request.id, &request.calculator_id, value, duration_ms),
        Ok(Err(e)) => WorkerResponse::error(
            request.id,
            &request.calculator_id,
            format!("calculation failed: {e}"),
            duration_ms,
        ),
        Err(panic) => WorkerResponse::error(
            request.id,
            &request.calculator_id,
            format!("calculation panicked: {}", panic_message(&panic)),
            duration_ms,
        ),
    }
}

fn load(
    loaded: &mut HashMap<String, Arc<dyn Calculator>>,
    registry: &CalculatorRegistry,
    calc_id: &str,
) -> Option<Arc<dyn Calculator>> {
    if let Some(calc) = loaded.get(calc_id) {
        return Some(calc.clone());
    }
    let calc = registry.get(calc_id)?;
    loaded.insert(calc_id.to_string(), calc.clone());
    Some(calc)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
