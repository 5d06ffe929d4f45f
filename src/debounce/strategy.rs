//! Per-calculator debounce strategies.
//!
//! Static baseline delays, priorities, and clamping bounds, plus the
//! adaptive-delay pipeline that shapes the effective delay from the current
//! behaviour snapshot.

use serde::{Deserialize, Serialize};

use crate::behavior::BehaviorSnapshot;

/// Tie-break priority when fire times collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Higher rank fires first on equal deadlines.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::High => 2,
            Priority::Medium => 1,
            Priority::Low => 0,
        }
    }
}

/// Baseline delay and adaptive bounds for one calculator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DebounceStrategy {
    pub delay_ms: u64,
    pub priority: Priority,
    pub min_ms: u64,
    pub max_ms: u64,
    pub adaptive: bool,
}

impl DebounceStrategy {
    const fn new(delay_ms: u64, priority: Priority, min_ms: u64, max_ms: u64) -> Self {
        Self {
            delay_ms,
            priority,
            min_ms,
            max_ms,
            adaptive: true,
        }
    }
}

/// Baseline table. Unknown calculators get a conservative default with
/// adaptation disabled.
pub fn strategy_for(calc_id: &str) -> DebounceStrategy {
    use Priority::*;
    match calc_id {
        "compound-interest" => DebounceStrategy::new(500, High, 300, 800),
        "savings-plan" => DebounceStrategy::new(500, High, 300, 800),
        "loan" => DebounceStrategy::new(600, Medium, 400, 1000),
        "mortgage" => DebounceStrategy::new(700, Medium, 500, 1200),
        "retirement" => DebounceStrategy::new(800, Low, 600, 1500),
        "portfolio" => DebounceStrategy::new(900, Low, 700, 1800),
        "tax-optimization" => DebounceStrategy::new(1000, Low, 800, 2000),
        "etf-savings-plan" => DebounceStrategy::new(600, Medium, 400, 1000),
        _ => DebounceStrategy {
            delay_ms: 800,
            priority: Priority::Medium,
            min_ms: 500,
            max_ms: 1500,
            adaptive: false,
        },
    }
}

/// Effective delay for one scheduling decision.
///
/// The multipliers compose in order on the working delay, then the result is
/// clamped to the strategy's bounds and rounded to whole milliseconds.
pub fn effective_delay(
    strategy: &DebounceStrategy,
    complexity: u8,
    snapshot: &BehaviorSnapshot,
    familiarity: f64,
) -> u64 {
    if !strategy.adaptive {
        return strategy.delay_ms;
    }

    let mut delay = strategy.delay_ms as f64;

    if snapshot.input_frequency > 2.0 {
        delay *= 1.2;
    } else if snapshot.input_frequency < 0.5 {
        delay *= 0.8;
    }

    if snapshot.current_pause_ms > 2000 {
        delay *= 0.9;
    }

    delay *= 0.8 + (complexity as f64 / 5.0) * 0.4;

    if familiarity < 3.0 {
        delay *= 0.85;
    }

    (delay.round() as u64).clamp(strategy.min_ms, strategy.max_ms)
}
