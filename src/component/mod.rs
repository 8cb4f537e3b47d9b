//! Participant side of the epoch protocol.
//!
//! A simulation component implements [`SimulationComponent`]; the fixed
//! driver in [`runtime`] calls its hooks in protocol order and turns the
//! outcome into Status messages. [`ComponentService`] connects a runtime to
//! the bus and the timer scheduler.

pub mod runtime;
pub mod service;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::bus::BusError;
use crate::protocol::message::is_valid_warning;
use crate::protocol::{EpochMessage, GeneralMessage, Message, ValidationError};

pub use runtime::{ComponentEffect, ComponentRuntime, MAX_HELD_MESSAGES};
pub use service::ComponentService;

use runtime::RuntimeCore;

#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("bus subscription closed before the simulation stopped")]
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantState {
    /// Waiting for SimState("running").
    Idle,
    WaitingForEpoch,
    Computing,
    /// Ready was sent; waiting for the next Epoch or SimState("stopped").
    AwaitingDecision,
    Error,
    Stopped,
}

impl ParticipantState {
    /// No Epoch message is acted on in these states.
    pub fn ignores_epochs(self) -> bool {
        matches!(self, ParticipantState::Error | ParticipantState::Stopped)
    }
}

/// Result of one `process_epoch` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochProgress {
    /// The epoch's work is done; a ready Status follows.
    Completed,
    /// More input is needed before the epoch can complete.
    MoreWork,
}

/// Hooks of a simulation participant.
///
/// Every hook runs on the component's single event task, so implementations
/// need no locking. Errors are plain descriptions; they end up in the
/// `Description` of a Status("error") message.
pub trait SimulationComponent: Send + 'static {
    /// Runs once before any message is handled.
    fn initialize(&mut self) -> Result<(), String> {
        Ok(())
    }

    /// Resets per-epoch scratch state. Called for every new epoch.
    fn clear_epoch_variables(&mut self);

    /// Handles a domain message received on one of the component's other topics.
    fn general_message_handler(&mut self, _message: &Message, _topic: &str, _ctx: &mut ComponentContext<'_>) {}

    /// Whether every input needed for the current epoch has arrived.
    fn all_messages_received_for_epoch(&self) -> bool {
        true
    }

    fn process_epoch(&mut self, ctx: &mut ComponentContext<'_>) -> Result<EpochProgress, String>;

    /// A timer scheduled through [`ComponentContext::schedule_timer`] fired.
    fn on_timer(&mut self, _key: &str, _ctx: &mut ComponentContext<'_>) {}
}

/// What a hook may do besides updating its own state.
///
/// Everything requested here is collected and carried out by the service
/// after the hook returns.
pub struct ComponentContext<'a> {
    core: &'a mut RuntimeCore,
}

impl<'a> ComponentContext<'a> {
    pub(crate) fn new(core: &'a mut RuntimeCore) -> Self {
        Self { core }
    }

    pub fn simulation_id(&self) -> &str {
        self.core.generator.simulation_id()
    }

    pub fn component_name(&self) -> &str {
        self.core.generator.source_process_id()
    }

    /// Current epoch number, 0 before the first Epoch message.
    pub fn epoch_number(&self) -> u64 {
        self.core.current_epoch
    }

    /// Latest Epoch message for the current epoch.
    pub fn epoch(&self) -> Option<&EpochMessage> {
        self.core.latest_epoch.as_ref()
    }

    pub fn triggering_message_ids(&self) -> &[String] {
        &self.core.triggering
    }

    /// Records an input message as a cause of this epoch's output.
    pub fn add_triggering_message_id(&mut self, message_id: impl Into<String>) {
        let message_id = message_id.into();
        if !self.core.triggering.contains(&message_id) {
            self.core.triggering.push(message_id);
        }
    }

    pub fn publish(&mut self, topic: impl Into<String>, message: impl Into<Message>) {
        self.core.publish(topic.into(), message.into());
    }

    /// Builds a domain result message stamped with the current epoch and triggering ids.
    pub fn result_message(
        &mut self,
        message_type: &str,
        attributes: Map<String, Value>,
    ) -> Result<GeneralMessage, ValidationError> {
        let epoch = self.core.current_epoch;
        let triggering = self.core.triggering.clone();
        self.core.generator.result(message_type, epoch, triggering, attributes)
    }

    pub fn publish_result(
        &mut self,
        topic: impl Into<String>,
        message_type: &str,
        attributes: Map<String, Value>,
    ) -> Result<(), ValidationError> {
        let message = self.result_message(message_type, attributes)?;
        self.publish(topic, message);
        Ok(())
    }

    /// Attaches a warning to the next ready Status of this epoch.
    pub fn add_status_warning(&mut self, warning: impl Into<String>) -> Result<(), ValidationError> {
        let warning = warning.into();
        if !is_valid_warning(&warning) {
            return Err(ValidationError::invalid("Warnings", format!("unknown warning type '{}'", warning)));
        }
        self.core.warnings.push(warning);
        Ok(())
    }

    /// Fires `on_timer(key)` once after `delay`. Replaces a pending timer with the same key.
    pub fn schedule_timer(&mut self, key: impl Into<String>, delay: Duration) {
        self.core.push(ComponentEffect::ScheduleTimer {
            key: key.into(),
            delay,
            repeating: false,
        });
    }

    pub fn schedule_repeating(&mut self, key: impl Into<String>, interval: Duration) {
        self.core.push(ComponentEffect::ScheduleTimer {
            key: key.into(),
            delay: interval,
            repeating: true,
        });
    }

    pub fn cancel_timer(&mut self, key: impl Into<String>) {
        self.core.push(ComponentEffect::CancelTimer { key: key.into() });
    }

    /// Reports the component as failed once the current hook returns.
    pub fn fail(&mut self, description: impl Into<String>) {
        self.core.failure.get_or_insert_with(|| description.into());
    }
}
