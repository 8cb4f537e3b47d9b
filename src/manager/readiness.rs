use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Created,
    Running,
    Stopped,
}

/// One simulation run as owned by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationRun {
    pub simulation_id: String,
    pub state: RunState,
    /// 0 before the first Epoch message.
    pub current_epoch: u64,
    #[serde(with = "timestamp")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "timestamp::option")]
    pub end_time: Option<DateTime<Utc>>,
    pub max_epochs: Option<u64>,
    pub registered_components: BTreeSet<String>,
}

impl SimulationRun {
    pub fn new(
        simulation_id: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
        max_epochs: Option<u64>,
        components: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            simulation_id: simulation_id.into(),
            state: RunState::Created,
            current_epoch: 0,
            start_time,
            end_time,
            max_epochs,
            registered_components: components.into_iter().collect(),
        }
    }

    pub fn is_registered(&self, component: &str) -> bool {
        self.registered_components.contains(component)
    }

    pub fn max_epochs_reached(&self) -> bool {
        self.max_epochs.map_or(false, |max| self.current_epoch >= max)
    }

    pub fn end_time_reached(&self, epoch_end: DateTime<Utc>) -> bool {
        self.end_time.map_or(false, |end| epoch_end >= end)
    }
}

/// Simulated-time span covered by one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochWindow {
    #[serde(with = "timestamp")]
    pub start: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Pending,
    Ready,
    Error,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessEntry {
    pub component_id: String,
    pub status: Readiness,
    #[serde(with = "timestamp")]
    pub last_update_time: DateTime<Utc>,
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// The entry left `Pending`.
    Recorded,
    /// The entry had already been decided; nothing changed.
    AlreadyDecided,
    /// The component is not expected in this epoch.
    NotExpected,
}

/// Readiness bookkeeping for one epoch. Epoch 0 is the start handshake and has no window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch_number: u64,
    pub window: Option<EpochWindow>,
    pub triggering_message_ids: Vec<String>,
    entries: BTreeMap<String, ReadinessEntry>,
    /// Ids of the Status messages that decided entries, in arrival order.
    status_message_ids: Vec<String>,
    #[serde(skip)]
    seen_message_ids: HashSet<(String, String)>,
    resolved: bool,
    timeout_fired: bool,
}

impl EpochRecord {
    pub fn open<'a>(
        epoch_number: u64,
        window: Option<EpochWindow>,
        triggering_message_ids: Vec<String>,
        components: impl IntoIterator<Item = &'a str>,
        now: DateTime<Utc>,
    ) -> Self {
        let entries = components
            .into_iter()
            .map(|component| {
                (
                    component.to_string(),
                    ReadinessEntry {
                        component_id: component.to_string(),
                        status: Readiness::Pending,
                        last_update_time: now,
                        message_id: None,
                    },
                )
            })
            .collect();
        Self {
            epoch_number,
            window,
            triggering_message_ids,
            entries,
            status_message_ids: Vec::new(),
            seen_message_ids: HashSet::new(),
            resolved: false,
            timeout_fired: false,
        }
    }

    pub fn entry(&self, component: &str) -> Option<&ReadinessEntry> {
        self.entries.get(component)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ReadinessEntry> {
        self.entries.values()
    }

    pub fn status_message_ids(&self) -> &[String] {
        &self.status_message_ids
    }

    /// Remembers a message id per sender. Returns `false` if it was seen before.
    pub fn note_message_id(&mut self, sender: &str, message_id: &str) -> bool {
        self.seen_message_ids.insert((sender.to_string(), message_id.to_string()))
    }

    /// Moves a pending entry to `status`. Decided entries never change again.
    pub fn register(
        &mut self,
        component: &str,
        status: Readiness,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> RegisterOutcome {
        let Some(entry) = self.entries.get_mut(component) else {
            return RegisterOutcome::NotExpected;
        };
        if entry.status != Readiness::Pending {
            return RegisterOutcome::AlreadyDecided;
        }
        entry.status = status;
        entry.last_update_time = now;
        entry.message_id = Some(message_id.to_string());
        self.status_message_ids.push(message_id.to_string());
        RegisterOutcome::Recorded
    }

    /// Drops a component from this epoch's barrier, e.g. after it errored elsewhere.
    pub fn withdraw(&mut self, component: &str, now: DateTime<Utc>) {
        if let Some(entry) = self.entries.get_mut(component) {
            if entry.status == Readiness::Pending {
                entry.status = Readiness::Error;
                entry.last_update_time = now;
            }
        }
    }

    pub fn pending_components(&self) -> Vec<String> {
        self.entries
            .values()
            .filter(|entry| entry.status == Readiness::Pending)
            .map(|entry| entry.component_id.clone())
            .collect()
    }

    pub fn ready_components(&self) -> Vec<String> {
        self.entries
            .values()
            .filter(|entry| entry.status == Readiness::Ready)
            .map(|entry| entry.component_id.clone())
            .collect()
    }

    /// True once no entry is pending.
    pub fn is_satisfied(&self) -> bool {
        self.entries.values().all(|entry| entry.status != Readiness::Pending)
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    pub fn mark_resolved(&mut self) {
        self.resolved = true;
    }

    pub fn timeout_fired(&self) -> bool {
        self.timeout_fired
    }

    /// Marks every pending entry as timed out. Only the first call has any effect.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<String> {
        if self.timeout_fired {
            return Vec::new();
        }
        self.timeout_fired = true;
        let mut timed_out = Vec::new();
        for entry in self.entries.values_mut().filter(|entry| entry.status == Readiness::Pending) {
            entry.status = Readiness::TimedOut;
            entry.last_update_time = now;
            timed_out.push(entry.component_id.clone());
        }
        timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(components: &[&str]) -> EpochRecord {
        EpochRecord::open(1, None, vec!["manager-2".to_string()], components.iter().copied(), Utc::now())
    }

    #[test]
    fn test_satisfied_only_when_all_decided() {
        let mut record = record(&["a", "b", "c"]);
        assert!(!record.is_satisfied());

        assert_eq!(record.register("a", Readiness::Ready, "a-2", Utc::now()), RegisterOutcome::Recorded);
        assert_eq!(record.register("b", Readiness::Ready, "b-2", Utc::now()), RegisterOutcome::Recorded);
        assert!(!record.is_satisfied());
        assert_eq!(record.pending_components(), vec!["c".to_string()]);

        assert_eq!(record.register("c", Readiness::Ready, "c-2", Utc::now()), RegisterOutcome::Recorded);
        assert!(record.is_satisfied());
        assert_eq!(record.status_message_ids(), ["a-2", "b-2", "c-2"]);
    }

    #[test]
    fn test_decided_entries_never_change() {
        let mut record = record(&["a"]);
        record.register("a", Readiness::Ready, "a-2", Utc::now());
        let before = record.entry("a").cloned();

        assert_eq!(record.register("a", Readiness::Ready, "a-3", Utc::now()), RegisterOutcome::AlreadyDecided);
        assert_eq!(record.register("a", Readiness::Error, "a-4", Utc::now()), RegisterOutcome::AlreadyDecided);
        assert_eq!(record.entry("a").cloned(), before);
        assert_eq!(record.status_message_ids().len(), 1);
    }

    #[test]
    fn test_unknown_component_not_expected() {
        let mut record = record(&["a"]);
        assert_eq!(record.register("zed", Readiness::Ready, "zed-1", Utc::now()), RegisterOutcome::NotExpected);
    }

    #[test]
    fn test_expire_only_once() {
        let mut record = record(&["a", "b"]);
        record.register("a", Readiness::Ready, "a-2", Utc::now());

        assert_eq!(record.expire(Utc::now()), vec!["b".to_string()]);
        assert!(record.timeout_fired());
        assert!(record.is_satisfied());
        assert!(record.expire(Utc::now()).is_empty());
        assert_eq!(record.entry("b").map(|entry| entry.status), Some(Readiness::TimedOut));
    }

    #[test]
    fn test_duplicate_message_ids() {
        let mut record = record(&["a"]);
        assert!(record.note_message_id("a", "a-2"));
        assert!(!record.note_message_id("a", "a-2"));
        assert!(record.note_message_id("b", "a-2"));
    }

    #[test]
    fn test_run_limits() {
        let start = Utc::now();
        let end = start + chrono::Duration::hours(2);
        let mut run = SimulationRun::new("sim", start, Some(end), Some(3), vec!["a".to_string()]);
        assert_eq!(run.state, RunState::Created);
        assert!(run.is_registered("a"));
        assert!(!run.max_epochs_reached());
        run.current_epoch = 3;
        assert!(run.max_epochs_reached());
        assert!(run.end_time_reached(end));
        assert!(!run.end_time_reached(start));
    }
}
