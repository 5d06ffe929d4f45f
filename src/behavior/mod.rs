//! Behaviour analyzer.
//!
//! Aggregates raw input events into the timing metrics the debouncer
//! consumes: input frequency, pause duration, focus, per-calculator
//! familiarity, user type, and input style. Pure aggregator; its only side
//! effects are on its own state.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::time::Instant;

use crate::calculator::CalcValue;
use crate::config::AnalyzerConfig;

/// Number of trailing inter-event intervals used for focus/style metrics.
const STYLE_WINDOW: usize = 20;

/// A single observed input change.
#[derive(Debug, Clone)]
pub struct InputEvent {
    pub calc_id: String,
    pub field: String,
    pub at: Instant,
    pub value: Option<CalcValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserType {
    Beginner,
    Intermediate,
    Expert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputStyle {
    Fast,
    Moderate,
    Slow,
    Erratic,
}

/// Derived metrics, recomputed on every event and on the periodic tick.
#[derive(Debug, Clone)]
pub struct BehaviorSnapshot {
    /// Events in the analysis window divided by window seconds.
    pub input_frequency: f64,
    /// Milliseconds since the last event.
    pub current_pause_ms: u64,
    /// 0-10, inversely proportional to the variance of recent intervals.
    pub focus_level: f64,
    pub user_type: UserType,
    pub input_style: InputStyle,
    pub total_events: u64,
    pub unique_calculators: usize,
    pub avg_session_duration_ms: u64,
}

impl Default for BehaviorSnapshot {
    fn default() -> Self {
        Self {
            input_frequency: 0.0,
            current_pause_ms: 0,
            focus_level: 5.0,
            user_type: UserType::Beginner,
            input_style: InputStyle::Moderate,
            total_events: 0,
            unique_calculators: 0,
            avg_session_duration_ms: 0,
        }
    }
}

struct AnalyzerState {
    events: VecDeque<InputEvent>,
    usage: HashMap<String, u64>,
    total_events: u64,
    session_started: Option<Instant>,
    last_event: Option<Instant>,
    closed_sessions: u64,
    closed_duration_ms: u64,
    snapshot: BehaviorSnapshot,
}

/// Rolling summary of user input timing.
pub struct BehaviorAnalyzer {
    config: AnalyzerConfig,
    state: Mutex<AnalyzerState>,
}

impl BehaviorAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(AnalyzerState {
                events: VecDeque::new(),
                usage: HashMap::new(),
                total_events: 0,
                session_started: None,
                last_event: None,
                closed_sessions: 0,
                closed_duration_ms: 0,
                snapshot: BehaviorSnapshot::default(),
            }),
        }
    }

    /// Record an input event and recompute the snapshot.
    pub fn record(&self, calc_id: &str, field: &str, value: Option<CalcValue>) {
        let now = Instant::now();
        let mut state = self.state.lock();

        // Close the rolling session after enough inactivity.
        match (state.session_started, state.last_event) {
            (Some(started), Some(last))
                if now.duration_since(last) > self.config.session_timeout =>
            {
                state.closed_duration_ms += last.duration_since(started).as_millis() as u64;
                state.closed_sessions += 1;
                state.session_started = Some(now);
            }
            (None, _) => state.session_started = Some(now),
            _ => {}
        }

        state.events.push_back(InputEvent {
            calc_id: calc_id.to_string(),
            field: field.to_string(),
            at: now,
            value,
        });
        while state.events.len() > self.config.ring_capacity {
            state.events.pop_front();
        }

        *state.usage.entry(calc_id.to_string()).or_insert(0) += 1;
        state.total_events += 1;
        state.last_event = Some(now);

        self.recompute(&mut state, now);
    }

    /// Periodic recomputation; pause duration and frequency decay between
    /// events.
    pub fn tick(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.recompute(&mut state, now);
    }

    pub fn snapshot(&self) -> BehaviorSnapshot {
        self.state.lock().snapshot.clone()
    }

    /// Familiarity with one calculator, 0-10, saturating with usage.
    pub fn familiarity(&self, calc_id: &str) -> f64 {
        let state = self.state.lock();
        let count = state.usage.get(calc_id).copied().unwrap_or(0);
        (count as f64 / 2.0).min(10.0)
    }

    pub fn usage_count(&self, calc_id: &str) -> u64 {
        self.state.lock().usage.get(calc_id).copied().unwrap_or(0)
    }

    fn recompute(&self, state: &mut AnalyzerState, now: Instant) {
        let window = self.config.analysis_window;
        let in_window = state
            .events
            .iter()
            .rev()
            .take_while(|e| now.duration_since(e.at) <= window)
            .count();
        let input_frequency = in_window as f64 / window.as_secs_f64();

        let current_pause_ms = state
            .last_event
            .map(|last| now.duration_since(last).as_millis() as u64)
            .unwrap_or(0);

        let intervals = recent_intervals(&state.events);
        let (focus_level, input_style) = focus_and_style(&intervals);

        let avg_session_duration_ms = {
            let current = state
                .session_started
                .zip(state.last_event)
                .map(|(started, last)| last.duration_since(started).as_millis() as u64)
                .unwrap_or(0);
            let sessions = state.closed_sessions + 1;
            (state.closed_duration_ms + current) / sessions
        };

        let unique_calculators = state.usage.len();
        let user_type = classify_user(
            state.total_events,
            unique_calculators,
            avg_session_duration_ms,
        );

        state.snapshot = BehaviorSnapshot {
            input_frequency,
            current_pause_ms,
            focus_level,
            user_type,
            input_style,
            total_events: state.total_events,
            unique_calculators,
            avg_session_duration_ms,
        };
    }
}

fn recent_intervals(events: &VecDeque<InputEvent>) -> Vec<f64> {
    let len = events.len();
    if len < 2 {
        return Vec::new();
    }
    let start = len.saturating_sub(STYLE_WINDOW + 1);
    events
        .iter()
        .skip(start)
        .zip(events.iter().skip(start + 1))
        .map(|(a, b)| b.at.duration_since(a.at).as_millis() as f64)
        .collect()
}

fn focus_and_style(intervals: &[f64]) -> (f64, InputStyle) {
    if intervals.is_empty() {
        return (5.0, InputStyle::Moderate);
    }
    let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
    if mean <= 0.0 {
        // Events landed on identical timestamps: perfectly regular.
        return (10.0, InputStyle::Fast);
    }
    let variance =
        intervals.iter().map(|i| (i - mean).powi(2)).sum::<f64>() / intervals.len() as f64;
    let cv = variance.sqrt() / mean;

    let focus = (10.0 * (1.0 - cv)).clamp(0.0, 10.0);
    let style = if cv > 0.8 {
        InputStyle::Erratic
    } else if mean < 500.0 {
        InputStyle::Fast
    } else if mean < 2000.0 {
        InputStyle::Moderate
    } else {
        InputStyle::Slow
    };
    (focus, style)
}

fn classify_user(total_events: u64, unique_calculators: usize, avg_session_ms: u64) -> UserType {
    if total_events > 200 && unique_calculators >= 5 && avg_session_ms > 600_000 {
        UserType::Expert
    } else if total_events > 50 && unique_calculators >= 3 && avg_session_ms > 300_000 {
        UserType::Intermediate
    } else {
        UserType::Beginner
    }
}
