//! Execution Timeline
//!
//! Records when each rule was dispatched and how it ended, for the Gantt
//! chart and duration table printed after a run.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

/// Width of the Gantt chart bars, in characters.
const CHART_WIDTH: f64 = 50.0;

/// What happened to a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Rule was dispatched to a worker
    Started,
    /// Tool ran successfully (or was simulated)
    Completed,
    /// Outputs from a previous execution were reused
    Skipped,
    Failed,
}

impl EventType {
    fn ends_rule(&self) -> bool {
        !matches!(self, Self::Started)
    }
}

#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub rule: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Ordered log of rule events for one run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    pub fn add_event(&mut self, rule: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            rule: rule.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Number of events of one type.
    pub fn count(&self, event_type: EventType) -> usize {
        self.events
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    /// Start and end offsets (ms since timeline creation) of every rule that
    /// both started and ended.
    fn spans(&self) -> BTreeMap<String, (u128, u128)> {
        let mut starts: BTreeMap<&str, u128> = BTreeMap::new();
        let mut spans = BTreeMap::new();

        for event in &self.events {
            let offset = event.timestamp.duration_since(self.start_time).as_millis();
            if event.event_type.ends_rule() {
                if let Some(&start) = starts.get(event.rule.as_str()) {
                    spans.insert(event.rule.clone(), (start, offset));
                }
            } else {
                starts.insert(event.rule.as_str(), offset);
            }
        }
        spans
    }

    /// Rule durations in milliseconds.
    pub fn get_durations(&self) -> BTreeMap<String, u128> {
        self.spans()
            .into_iter()
            .map(|(rule, (start, end))| (rule, end - start))
            .collect()
    }

    /// ASCII Gantt chart, one bar per rule, ordered by start time.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }
        let scale = CHART_WIDTH / total_time as f64;

        let mut spans: Vec<_> = self.spans().into_iter().collect();
        spans.sort_by_key(|(_, (start, _))| *start);

        for (rule, (start, end)) in spans {
            let start_pos = (start as f64 * scale) as usize;
            let width = ((end - start) as f64 * scale).max(1.0) as usize;
            let _ = writeln!(
                output,
                "{} |{}{}| ({} ms)",
                truncate(&rule, 16),
                " ".repeat(start_pos),
                "#".repeat(width),
                end - start
            );
        }

        let _ = writeln!(output, "\nTotal: {} ms", total_time);
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or cuts `s` to exactly `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    let count = s.chars().count();
    if count <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
