//! Engine/worker message envelopes.
//!
//! Workers communicate exclusively through these messages; both directions
//! are serialisable so the transport can be swapped for a process boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::calculator::CalcInput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestKind {
    Calculate,
    Cancel,
    Status,
    Init,
}

/// Engine -> worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: RequestKind,
    pub calculator_id: String,
    pub data: Option<CalcInput>,
    pub timestamp: DateTime<Utc>,
}

impl WorkerRequest {
    pub fn calculate(id: Uuid, calculator_id: &str, input: CalcInput) -> Self {
        Self {
            id,
            kind: RequestKind::Calculate,
            calculator_id: calculator_id.to_string(),
            data: Some(input),
            timestamp: Utc::now(),
        }
    }

    /// Broadcast to all workers; a worker that does not know the id ignores
    /// it.
    pub fn cancel(id: Uuid) -> Self {
        Self {
            id,
            kind: RequestKind::Cancel,
            calculator_id: String::new(),
            data: None,
            timestamp: Utc::now(),
        }
    }

    pub fn status() -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: RequestKind::Status,
            calculator_id: String::new(),
            data: None,
            timestamp: Utc::now(),
        }
    }

    /// Ask the worker to preload a calculator (populates its affinity).
    pub fn init(calculator_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: RequestKind::Init,
            calculator_id: calculator_id.to_string(),
            data: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseKind {
    Result,
    Error,
    Status,
    Ready,
}

/// Worker -> engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub calculator_id: String,
    pub timestamp: DateTime<Utc>,
}

impl WorkerResponse {
    pub fn ready() -> Self {
        Self {
            id: Uuid::nil(),
            kind: ResponseKind::Ready,
            success: true,
            result: None,
            error: None,
            duration_ms: 0,
            calculator_id: String::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn result(id: Uuid, calculator_id: &str, value: Value, duration_ms: u64) -> Self {
        Self {
            id,
            kind: ResponseKind::Result,
            success: true,
            result: Some(value),
            error: None,
            duration_ms,
            calculator_id: calculator_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn error(id: Uuid, calculator_id: &str, message: String, duration_ms: u64) -> Self {
        Self {
            id,
            kind: ResponseKind::Error,
            success: false,
            result: None,
            error: Some(message),
            duration_ms,
            calculator_id: calculator_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn status(detail: Value) -> Self {
        Self {
            id: Uuid::nil(),
            kind: ResponseKind::Status,
            success: true,
            result: Some(detail),
            error: None,
            duration_ms: 0,
            calculator_id: String::new(),
            timestamp: Utc::now(),
        }
    }
}
