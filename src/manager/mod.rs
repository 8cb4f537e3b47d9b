//! The Simulation Manager: the single authority that advances epochs.
//!
//! [`Coordinator`] is the state machine. It never touches the bus or the clock
//! itself; each operation takes the current time and returns the
//! [`ManagerEffect`]s to carry out, which keeps every barrier, timeout and
//! failure rule testable in isolation. [`SimulationManager`] drives a
//! coordinator from a bus subscription and a [`TimerScheduler`](crate::scheduler::TimerScheduler).

pub mod readiness;
pub mod service;
pub mod strategy;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::bus::BusError;
use crate::config::{ControlTopics, FailurePolicy, ManagerConfig, TimeoutAction, TimeoutPolicy};
use crate::protocol::{timestamp, Message, MessageGenerator, SimulationState, StatusMessage, StatusValue, ValidationError};

pub use readiness::{EpochRecord, EpochWindow, Readiness, ReadinessEntry, RegisterOutcome, RunState, SimulationRun};
pub use service::SimulationManager;
pub use strategy::{build_strategy, EpochStrategy, FixedStep, NextEvent};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("the run ended without an outcome")]
    Incomplete,
}

/// Side effect requested by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEffect {
    Publish { topic: String, message: Message },
    /// Replaces any armed epoch timer.
    ArmEpochTimer { epoch: u64, attempt: u32, delay: Duration },
    CancelEpochTimer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    MaxEpochsReached,
    EndTimeReached,
    ComponentError { component: String, epoch: u64 },
    EpochTimeout { epoch: u64, components: Vec<String> },
    NoComponents,
    AllComponentsFailed,
    BusLost,
    Interrupted,
    Internal { reason: String },
}

impl StopReason {
    pub fn is_completion(&self) -> bool {
        matches!(self, StopReason::MaxEpochsReached | StopReason::EndTimeReached)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::MaxEpochsReached => write!(f, "maximum number of epochs reached"),
            StopReason::EndTimeReached => write!(f, "simulation end time reached"),
            StopReason::ComponentError { component, epoch } => {
                write!(f, "component '{}' failed in epoch {}", component, epoch)
            }
            StopReason::EpochTimeout { epoch, components } => {
                write!(f, "epoch {} timed out waiting for [{}]", epoch, components.join(", "))
            }
            StopReason::NoComponents => write!(f, "no components registered"),
            StopReason::AllComponentsFailed => write!(f, "no healthy components left"),
            StopReason::BusLost => write!(f, "message bus connection lost"),
            StopReason::Interrupted => write!(f, "interrupted"),
            StopReason::Internal { reason } => write!(f, "internal error: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentFailure {
    pub component: String,
    pub epoch: u64,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutRecord {
    pub epoch: u64,
    pub components: Vec<String>,
}

/// Authoritative result of a run, fixed when the coordinator stops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub simulation_id: String,
    pub reason: StopReason,
    pub epochs_completed: u64,
    pub failed_components: Vec<ComponentFailure>,
    pub timeouts: Vec<TimeoutRecord>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.reason.is_completion() && self.failed_components.is_empty() && self.timeouts.is_empty()
    }
}

pub struct Coordinator {
    run: SimulationRun,
    name: Option<String>,
    description: Option<String>,
    topics: ControlTopics,
    timeout: TimeoutPolicy,
    failure_policy: FailurePolicy,
    generator: MessageGenerator,
    strategy: Box<dyn EpochStrategy>,
    current: Option<EpochRecord>,
    last_control_id: Option<String>,
    resends: u32,
    epochs_completed: u64,
    failures: BTreeMap<String, ComponentFailure>,
    timeouts: Vec<TimeoutRecord>,
    outcome: Option<RunOutcome>,
}

impl Coordinator {
    pub fn new(config: &ManagerConfig) -> Self {
        let strategy = build_strategy(config.epoch_strategy, config.initial_start_time, config.epoch_length);
        Self::with_strategy(config, strategy)
    }

    pub fn with_strategy(config: &ManagerConfig, strategy: Box<dyn EpochStrategy>) -> Self {
        Self {
            run: SimulationRun::new(
                config.simulation_id.clone(),
                config.initial_start_time,
                config.end_time,
                config.max_epochs,
                config.components.iter().cloned(),
            ),
            name: config.name.clone(),
            description: config.description.clone(),
            topics: config.topics.clone(),
            timeout: config.timeout.clone(),
            failure_policy: config.failure_policy,
            generator: MessageGenerator::new(config.simulation_id.clone(), config.manager_name.clone()),
            strategy,
            current: None,
            last_control_id: None,
            resends: 0,
            epochs_completed: 0,
            failures: BTreeMap::new(),
            timeouts: Vec::new(),
            outcome: None,
        }
    }

    pub fn run(&self) -> &SimulationRun {
        &self.run
    }

    pub fn state(&self) -> RunState {
        self.run.state
    }

    pub fn current_epoch(&self) -> u64 {
        self.run.current_epoch
    }

    pub fn current_record(&self) -> Option<&EpochRecord> {
        self.current.as_ref()
    }

    pub fn is_stopped(&self) -> bool {
        self.run.state == RunState::Stopped
    }

    pub fn outcome(&self) -> Option<&RunOutcome> {
        self.outcome.as_ref()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ComponentFailure> {
        self.failures.values()
    }

    /// Registered components that have not reported an error.
    pub fn healthy_components(&self) -> Vec<String> {
        self.run
            .registered_components
            .iter()
            .filter(|component| !self.failures.contains_key(*component))
            .cloned()
            .collect()
    }

    /// Publishes SimState("running") and opens the epoch 0 handshake.
    pub fn start(&mut self, now: DateTime<Utc>) -> Vec<ManagerEffect> {
        if self.run.state != RunState::Created {
            warn!("Ignoring start request in state {:?}", self.run.state);
            return Vec::new();
        }
        self.run.state = RunState::Running;
        info!(
            "▶️  Starting simulation '{}' with components [{}]",
            self.run.simulation_id,
            self.healthy_components().join(", ")
        );
        info!(
            "Epoch timeout: {} after {:?} and {} resends; failure policy: {}; strategy: {}; max epochs: {}",
            self.timeout.action,
            self.timeout.interval,
            self.timeout.max_resends,
            self.failure_policy,
            self.strategy.name(),
            self.run.max_epochs.map_or("unbounded".to_string(), |max| max.to_string())
        );

        if self.run.registered_components.is_empty() {
            warn!("No components registered, stopping immediately");
            return self.stop(StopReason::NoComponents);
        }

        let message = match self
            .generator
            .sim_state(SimulationState::Running, self.name.clone(), self.description.clone())
        {
            Ok(message) => message,
            Err(error) => return self.internal_failure(error),
        };
        self.last_control_id = Some(message.origin().message_id().to_string());
        self.run.current_epoch = 0;
        self.resends = 0;
        let healthy = self.healthy_components();
        self.current = Some(EpochRecord::open(0, None, Vec::new(), healthy.iter().map(String::as_str), now));

        vec![
            ManagerEffect::Publish {
                topic: self.topics.sim_state.clone(),
                message: message.into(),
            },
            ManagerEffect::ArmEpochTimer {
                epoch: 0,
                attempt: 0,
                delay: self.timeout.delay_after(0),
            },
        ]
    }

    /// Opens the next epoch and publishes its Epoch message.
    pub fn advance_epoch(&mut self, now: DateTime<Utc>) -> Vec<ManagerEffect> {
        if self.run.state != RunState::Running {
            return Vec::new();
        }
        let previous_window = self.current.as_ref().and_then(|record| record.window);
        let mut triggering: Vec<String> = self
            .current
            .as_ref()
            .map(|record| record.status_message_ids().to_vec())
            .unwrap_or_default();
        if triggering.is_empty() {
            triggering.extend(self.last_control_id.clone());
        }

        let Some(mut window) = self.strategy.next_window(previous_window.as_ref()) else {
            error!("Epoch {} would end outside the representable time range", self.run.current_epoch + 1);
            return self.stop(StopReason::Internal {
                reason: "simulated time out of range".to_string(),
            });
        };
        if let Some(end_time) = self.run.end_time {
            if window.start >= end_time {
                return self.stop(StopReason::EndTimeReached);
            }
            window.end = window.end.min(end_time);
        }

        let epoch = self.run.current_epoch + 1;
        let message = match self.generator.epoch(epoch, window.start, window.end, triggering.clone()) {
            Ok(message) => message,
            Err(error) => return self.internal_failure(error),
        };
        self.run.current_epoch = epoch;
        self.last_control_id = Some(message.origin().message_id().to_string());
        self.resends = 0;
        let healthy = self.healthy_components();
        self.current = Some(EpochRecord::open(
            epoch,
            Some(window),
            triggering,
            healthy.iter().map(String::as_str),
            now,
        ));
        info!(
            "⏩ Epoch {} [{} .. {}]",
            epoch,
            timestamp::format(&window.start),
            timestamp::format(&window.end)
        );

        vec![
            ManagerEffect::Publish {
                topic: self.topics.epoch.clone(),
                message: message.into(),
            },
            ManagerEffect::ArmEpochTimer {
                epoch,
                attempt: 0,
                delay: self.timeout.delay_after(0),
            },
        ]
    }

    pub fn on_status(&mut self, status: &StatusMessage, now: DateTime<Utc>) -> Vec<ManagerEffect> {
        if self.run.state != RunState::Running {
            debug!("Ignoring Status while {:?}", self.run.state);
            return Vec::new();
        }
        if status.envelope().simulation_id() != self.run.simulation_id {
            debug!("Ignoring Status for simulation '{}'", status.envelope().simulation_id());
            return Vec::new();
        }
        let sender = status.source_process_id();
        if sender == self.generator.source_process_id() {
            return Vec::new();
        }
        if !self.run.is_registered(sender) {
            warn!("Ignoring Status from unregistered component '{}'", sender);
            return Vec::new();
        }
        let epoch = status.epoch_number();
        if epoch < self.run.current_epoch {
            debug!(
                "Ignoring stale Status from '{}' for epoch {} (current epoch {})",
                sender, epoch, self.run.current_epoch
            );
            return Vec::new();
        }
        if epoch > self.run.current_epoch {
            warn!(
                "Protocol violation: '{}' reported epoch {} while the current epoch is {}",
                sender, epoch, self.run.current_epoch
            );
            return Vec::new();
        }
        for warning in status.stamp().warnings() {
            warn!("⚠️  '{}' reported {} in epoch {}", sender, warning, epoch);
        }

        let Some(record) = self.current.as_mut() else {
            return Vec::new();
        };
        if record.is_resolved() {
            debug!("Epoch {} already resolved, ignoring Status from '{}'", epoch, sender);
            return Vec::new();
        }
        if !record.note_message_id(sender, status.message_id()) {
            warn!(
                "Protocol violation: duplicate MessageId '{}' from '{}'",
                status.message_id(),
                sender
            );
            return Vec::new();
        }

        match status.value() {
            StatusValue::Ready => {
                if self.failures.contains_key(sender) {
                    warn!("Ignoring ready Status from failed component '{}'", sender);
                    return Vec::new();
                }
                match record.register(sender, Readiness::Ready, status.message_id(), now) {
                    RegisterOutcome::Recorded => {
                        info!("✅ '{}' ready for epoch {}", sender, epoch);
                        self.strategy.observe_status(status);
                    }
                    RegisterOutcome::AlreadyDecided => {
                        debug!("'{}' already decided for epoch {}", sender, epoch);
                    }
                    RegisterOutcome::NotExpected => {
                        debug!("'{}' is not part of the epoch {} barrier", sender, epoch);
                    }
                }
                self.check_barrier(now)
            }
            StatusValue::Error => {
                record.register(sender, Readiness::Error, status.message_id(), now);
                self.on_error(sender, status.description(), now)
            }
        }
    }

    /// Records a component failure and applies the failure policy.
    pub fn on_error(&mut self, component: &str, description: Option<&str>, now: DateTime<Utc>) -> Vec<ManagerEffect> {
        if self.run.state != RunState::Running {
            return Vec::new();
        }
        if !self.run.is_registered(component) {
            warn!("Ignoring error from unregistered component '{}'", component);
            return Vec::new();
        }
        if self.failures.contains_key(component) {
            debug!("'{}' already recorded as failed", component);
            return Vec::new();
        }

        let epoch = self.run.current_epoch;
        error!(
            "❌ '{}' failed in epoch {}: {}",
            component,
            epoch,
            description.unwrap_or("no description")
        );
        self.failures.insert(
            component.to_string(),
            ComponentFailure {
                component: component.to_string(),
                epoch,
                description: description.map(str::to_string),
            },
        );
        if let Some(record) = self.current.as_mut() {
            record.withdraw(component, now);
        }

        match self.failure_policy {
            FailurePolicy::FailFast => self.stop(StopReason::ComponentError {
                component: component.to_string(),
                epoch,
            }),
            FailurePolicy::Continue => {
                if self.healthy_components().is_empty() {
                    return self.stop(StopReason::AllComponentsFailed);
                }
                warn!("Continuing without '{}'", component);
                self.check_barrier(now)
            }
        }
    }

    /// Handles a firing of the epoch timer armed with `epoch` and `attempt`.
    pub fn on_epoch_timeout(&mut self, epoch: u64, attempt: u32, now: DateTime<Utc>) -> Vec<ManagerEffect> {
        if self.run.state != RunState::Running || epoch != self.run.current_epoch || attempt != self.resends {
            debug!("Ignoring stale timer for epoch {} attempt {}", epoch, attempt);
            return Vec::new();
        }
        let Some(record) = self.current.as_mut() else {
            return Vec::new();
        };
        if record.is_resolved() || record.timeout_fired() {
            return Vec::new();
        }

        if self.resends < self.timeout.max_resends {
            self.resends += 1;
            warn!(
                "⏰ Epoch {} still waiting for [{}], resending ({}/{})",
                epoch,
                record.pending_components().join(", "),
                self.resends,
                self.timeout.max_resends
            );
            return self.resend_control();
        }

        let timed_out = record.expire(now);
        warn!("⏰ Epoch {} timed out waiting for [{}]", epoch, timed_out.join(", "));
        self.timeouts.push(TimeoutRecord {
            epoch,
            components: timed_out.clone(),
        });

        match self.timeout.action {
            TimeoutAction::Abort => self.stop(StopReason::EpochTimeout {
                epoch,
                components: timed_out,
            }),
            TimeoutAction::Proceed => {
                warn!("Proceeding past epoch {} without [{}]", epoch, timed_out.join(", "));
                self.check_barrier(now)
            }
        }
    }

    /// Publishes SimState("stopped") and fixes the outcome. Later calls do nothing.
    pub fn stop(&mut self, reason: StopReason) -> Vec<ManagerEffect> {
        if self.run.state == RunState::Stopped {
            return Vec::new();
        }
        self.run.state = RunState::Stopped;

        let mut effects = vec![ManagerEffect::CancelEpochTimer];
        match self
            .generator
            .sim_state(SimulationState::Stopped, self.name.clone(), self.description.clone())
        {
            Ok(message) => effects.push(ManagerEffect::Publish {
                topic: self.topics.sim_state.clone(),
                message: message.into(),
            }),
            Err(error) => error!("Could not build the SimState(stopped) message: {}", error),
        }

        let outcome = RunOutcome {
            simulation_id: self.run.simulation_id.clone(),
            reason,
            epochs_completed: self.epochs_completed,
            failed_components: self.failures.values().cloned().collect(),
            timeouts: self.timeouts.clone(),
        };
        if outcome.is_success() {
            info!(
                "🏁 Simulation '{}' finished after {} epochs: {}",
                outcome.simulation_id, outcome.epochs_completed, outcome.reason
            );
        } else {
            warn!(
                "🛑 Simulation '{}' stopped after {} epochs: {}",
                outcome.simulation_id, outcome.epochs_completed, outcome.reason
            );
        }
        self.outcome = Some(outcome);
        effects
    }

    fn check_barrier(&mut self, now: DateTime<Utc>) -> Vec<ManagerEffect> {
        let Some(record) = self.current.as_mut() else {
            return Vec::new();
        };
        if record.is_resolved() || !record.is_satisfied() {
            return Vec::new();
        }
        record.mark_resolved();
        let epoch = record.epoch_number;
        let window = record.window;

        let mut effects = vec![ManagerEffect::CancelEpochTimer];
        if epoch == 0 {
            info!("🤝 All components answered the start handshake");
        } else {
            self.epochs_completed = epoch;
            info!("🏁 Epoch {} resolved", epoch);
        }

        if self.healthy_components().is_empty() {
            effects.extend(self.stop(StopReason::AllComponentsFailed));
        } else if self.run.max_epochs_reached() {
            effects.extend(self.stop(StopReason::MaxEpochsReached));
        } else if window.map_or(false, |window| self.run.end_time_reached(window.end)) {
            effects.extend(self.stop(StopReason::EndTimeReached));
        } else {
            effects.extend(self.advance_epoch(now));
        }
        effects
    }

    fn resend_control(&mut self) -> Vec<ManagerEffect> {
        let epoch = self.run.current_epoch;
        let (topic, message) = if epoch == 0 {
            let message = self
                .generator
                .sim_state(SimulationState::Running, self.name.clone(), self.description.clone())
                .map(Message::from);
            (self.topics.sim_state.clone(), message)
        } else {
            let Some((window, triggering)) = self
                .current
                .as_ref()
                .and_then(|record| record.window.map(|window| (window, resend_triggering_ids(record))))
            else {
                return self.stop(StopReason::Internal {
                    reason: format!("epoch {} has no time window", epoch),
                });
            };
            let message = self
                .generator
                .epoch(epoch, window.start, window.end, triggering)
                .map(Message::from);
            (self.topics.epoch.clone(), message)
        };

        match message {
            Ok(message) => {
                self.last_control_id = message.message_id().map(str::to_string);
                vec![
                    ManagerEffect::Publish { topic, message },
                    ManagerEffect::ArmEpochTimer {
                        epoch,
                        attempt: self.resends,
                        delay: self.timeout.delay_after(self.resends),
                    },
                ]
            }
            Err(error) => self.internal_failure(error),
        }
    }

    fn internal_failure(&mut self, error: ValidationError) -> Vec<ManagerEffect> {
        error!("Could not build a control message: {}", error);
        self.stop(StopReason::Internal {
            reason: error.to_string(),
        })
    }
}

/// A resent Epoch points at the statuses already received for it, so
/// components that answered can recognise the resend as acknowledged.
fn resend_triggering_ids(record: &EpochRecord) -> Vec<String> {
    if record.status_message_ids().is_empty() {
        record.triggering_message_ids.clone()
    } else {
        record.status_message_ids().to_vec()
    }
}
