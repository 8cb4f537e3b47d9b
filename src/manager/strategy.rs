use std::time::Duration;

use chrono::{DateTime, Utc};

use super::readiness::EpochWindow;
use crate::config::EpochStrategyKind;
use crate::protocol::StatusMessage;

/// Decides the simulated-time window of each new epoch.
pub trait EpochStrategy: Send {
    /// Window following `previous`, or the first window when `previous` is `None`.
    /// `None` when the window would end outside the representable time range.
    fn next_window(&mut self, previous: Option<&EpochWindow>) -> Option<EpochWindow>;

    /// Called for every accepted ready Status of the epoch being resolved.
    fn observe_status(&mut self, _status: &StatusMessage) {}

    fn name(&self) -> &'static str;
}

/// Longest single epoch, matching the configuration bound.
const MAX_STEP_DAYS: i64 = 36_525;

fn to_chrono(duration: Duration) -> chrono::Duration {
    let longest = chrono::Duration::days(MAX_STEP_DAYS);
    chrono::Duration::from_std(duration).map_or(longest, |step| step.min(longest))
}

/// Back-to-back epochs of equal length.
#[derive(Debug, Clone)]
pub struct FixedStep {
    initial_start: DateTime<Utc>,
    length: chrono::Duration,
}

impl FixedStep {
    pub fn new(initial_start: DateTime<Utc>, length: Duration) -> Self {
        Self {
            initial_start,
            length: to_chrono(length),
        }
    }
}

impl EpochStrategy for FixedStep {
    fn next_window(&mut self, previous: Option<&EpochWindow>) -> Option<EpochWindow> {
        let start = previous.map_or(self.initial_start, |window| window.end);
        let end = start.checked_add_signed(self.length)?;
        Some(EpochWindow { start, end })
    }

    fn name(&self) -> &'static str {
        "fixed-step"
    }
}

/// Ends each epoch at the earliest next-event time reported by the components,
/// never running longer than `max_step`.
#[derive(Debug, Clone)]
pub struct NextEvent {
    initial_start: DateTime<Utc>,
    max_step: chrono::Duration,
    hints: Vec<DateTime<Utc>>,
}

impl NextEvent {
    pub fn new(initial_start: DateTime<Utc>, max_step: Duration) -> Self {
        Self {
            initial_start,
            max_step: to_chrono(max_step),
            hints: Vec::new(),
        }
    }
}

impl EpochStrategy for NextEvent {
    fn next_window(&mut self, previous: Option<&EpochWindow>) -> Option<EpochWindow> {
        let start = previous.map_or(self.initial_start, |window| window.end);
        let earliest = self.hints.drain(..).filter(|hint| *hint > start).min();
        let end = match start.checked_add_signed(self.max_step) {
            Some(limit) => earliest.map_or(limit, |hint| hint.min(limit)),
            None => earliest?,
        };
        Some(EpochWindow { start, end })
    }

    fn observe_status(&mut self, status: &StatusMessage) {
        if let Some(next_event_time) = status.next_event_time() {
            self.hints.push(next_event_time);
        }
    }

    fn name(&self) -> &'static str {
        "next-event"
    }
}

pub fn build_strategy(kind: EpochStrategyKind, initial_start: DateTime<Utc>, epoch_length: Duration) -> Box<dyn EpochStrategy> {
    match kind {
        EpochStrategyKind::FixedStep => Box::new(FixedStep::new(initial_start, epoch_length)),
        EpochStrategyKind::NextEvent => Box::new(NextEvent::new(initial_start, epoch_length)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{timestamp, MessageGenerator};

    fn at(raw: &str) -> DateTime<Utc> {
        timestamp::parse(raw).unwrap()
    }

    #[test]
    fn test_fixed_step_windows_are_contiguous() {
        let mut strategy = FixedStep::new(at("2020-01-01T00:00:00Z"), Duration::from_secs(3600));
        let first = strategy.next_window(None).unwrap();
        assert_eq!(first.start, at("2020-01-01T00:00:00Z"));
        assert_eq!(first.end, at("2020-01-01T01:00:00Z"));

        let second = strategy.next_window(Some(&first)).unwrap();
        assert_eq!(second.start, first.end);
        assert_eq!(second.end, at("2020-01-01T02:00:00Z"));
    }

    #[test]
    fn test_window_past_time_range_is_refused() {
        let mut strategy = FixedStep::new(at("2020-01-01T00:00:00Z"), Duration::from_secs(u64::MAX));
        let first = strategy.next_window(None).unwrap();
        assert_eq!(first.end - first.start, chrono::Duration::days(MAX_STEP_DAYS));

        let last = EpochWindow {
            start: DateTime::<Utc>::MAX_UTC - chrono::Duration::days(1),
            end: DateTime::<Utc>::MAX_UTC,
        };
        assert!(strategy.next_window(Some(&last)).is_none());
    }

    #[test]
    fn test_next_event_uses_earliest_hint() {
        let mut strategy = NextEvent::new(at("2020-01-01T00:00:00Z"), Duration::from_secs(3600));
        let first = strategy.next_window(None).unwrap();
        assert_eq!(first.end, at("2020-01-01T01:00:00Z"));

        let mut generator = MessageGenerator::new("sim", "solar");
        for hint in ["2020-01-01T01:40:00Z", "2020-01-01T01:15:00Z", "2020-01-01T00:30:00Z"] {
            let status = generator
                .status_ready(1, vec!["manager-1".to_string()], Vec::new())
                .unwrap()
                .with_next_event_time(at(hint));
            strategy.observe_status(&status);
        }

        let second = strategy.next_window(Some(&first)).unwrap();
        assert_eq!(second.start, at("2020-01-01T01:00:00Z"));
        assert_eq!(second.end, at("2020-01-01T01:15:00Z"));

        // Hints are consumed; without new ones the step falls back to the maximum.
        let third = strategy.next_window(Some(&second)).unwrap();
        assert_eq!(third.end, at("2020-01-01T02:15:00Z"));
    }
}
