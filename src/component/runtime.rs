use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::{ComponentContext, EpochProgress, ParticipantState, SimulationComponent};
use crate::config::{ComponentConfig, ControlTopics};
use crate::protocol::{timestamp, EpochMessage, Message, MessageGenerator, SimStateMessage, SimulationState};

/// Inputs for epochs not yet opened that a participant keeps before dropping the oldest.
pub const MAX_HELD_MESSAGES: usize = 1024;

/// Side effect requested by a participant runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentEffect {
    Publish { topic: String, message: Message },
    ScheduleTimer { key: String, delay: Duration, repeating: bool },
    CancelTimer { key: String },
    CancelAllTimers,
    /// The simulation stopped; release the bus and every timer.
    Shutdown,
}

/// Hook-independent participant state, shared with [`ComponentContext`].
#[derive(Debug)]
pub(crate) struct RuntimeCore {
    pub(crate) generator: MessageGenerator,
    pub(crate) topics: ControlTopics,
    pub(crate) state: ParticipantState,
    pub(crate) current_epoch: u64,
    pub(crate) latest_epoch: Option<EpochMessage>,
    pub(crate) triggering: Vec<String>,
    pub(crate) completed_epoch: Option<u64>,
    pub(crate) last_status_id: Option<String>,
    pub(crate) warnings: Vec<String>,
    pub(crate) init_error: Option<String>,
    pub(crate) failure: Option<String>,
    effects: Vec<ComponentEffect>,
}

impl RuntimeCore {
    pub(crate) fn push(&mut self, effect: ComponentEffect) {
        self.effects.push(effect);
    }

    pub(crate) fn publish(&mut self, topic: String, message: Message) {
        if matches!(self.state, ParticipantState::Stopped) {
            debug!("Dropping {} on '{}': simulation stopped", message.message_type(), topic);
            return;
        }
        self.effects.push(ComponentEffect::Publish { topic, message });
    }

    fn take_effects(&mut self) -> Vec<ComponentEffect> {
        std::mem::take(&mut self.effects)
    }
}

/// Fixed participant workflow around a [`SimulationComponent`].
///
/// Every handler returns the effects to carry out; the runtime itself never
/// performs I/O.
pub struct ComponentRuntime<C> {
    component: C,
    core: RuntimeCore,
    held: VecDeque<(String, Message)>,
}

impl<C: SimulationComponent> ComponentRuntime<C> {
    pub fn new(config: &ComponentConfig, component: C) -> Self {
        Self {
            component,
            core: RuntimeCore {
                generator: MessageGenerator::new(config.simulation_id.clone(), config.component_name.clone()),
                topics: config.topics.clone(),
                state: ParticipantState::Idle,
                current_epoch: 0,
                latest_epoch: None,
                triggering: Vec::new(),
                completed_epoch: None,
                last_status_id: None,
                warnings: Vec::new(),
                init_error: None,
                failure: None,
                effects: Vec::new(),
            },
            held: VecDeque::new(),
        }
    }

    pub fn component(&self) -> &C {
        &self.component
    }

    pub fn component_name(&self) -> &str {
        self.core.generator.source_process_id()
    }

    pub fn state(&self) -> ParticipantState {
        self.core.state
    }

    pub fn current_epoch(&self) -> u64 {
        self.core.current_epoch
    }

    /// Number of inputs waiting for their epoch to open.
    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.core.state == ParticipantState::Stopped
    }

    /// Runs the component's `initialize` hook. A failure is reported at the start handshake.
    pub fn initialize(&mut self) {
        match self.component.initialize() {
            Ok(()) => info!("🧩 Component '{}' initialized", self.component_name()),
            Err(description) => {
                error!("Component '{}' failed to initialize: {}", self.component_name(), description);
                self.core.init_error = Some(description);
            }
        }
    }

    /// Dispatches one inbound message.
    pub fn handle_message(&mut self, topic: &str, message: &Message) -> Vec<ComponentEffect> {
        if self.is_stopped() {
            return Vec::new();
        }
        if message.simulation_id() != self.core.generator.simulation_id() {
            debug!(
                "Ignoring {} for simulation '{}'",
                message.message_type(),
                message.simulation_id()
            );
            return Vec::new();
        }
        if message.source_process_id() == Some(self.component_name()) {
            return Vec::new();
        }

        match message {
            Message::SimState(sim_state) => self.on_sim_state(sim_state),
            Message::Epoch(epoch) => self.on_epoch(epoch),
            Message::Status(_) => {
                debug!("Ignoring Status on '{}'", topic);
                Vec::new()
            }
            Message::General(_) => self.on_domain_message(topic, message),
        }
    }

    pub fn on_sim_state(&mut self, message: &SimStateMessage) -> Vec<ComponentEffect> {
        match message.simulation_state() {
            SimulationState::Running => {
                if self.core.current_epoch > 0 {
                    debug!("Ignoring repeated SimState(running) in epoch {}", self.core.current_epoch);
                    return Vec::new();
                }
                info!("▶️  Simulation '{}' is running", message.envelope().simulation_id());
                self.core.triggering = vec![message.origin().message_id().to_string()];
                if let Some(description) = self.core.init_error.clone() {
                    self.send_error_message(&description);
                } else if self.core.state == ParticipantState::Error {
                    let description = self.core.failure.clone().unwrap_or_else(|| "component in error state".to_string());
                    self.send_error_message(&description);
                } else {
                    self.send_ready();
                    self.core.state = ParticipantState::WaitingForEpoch;
                }
            }
            SimulationState::Stopped => {
                info!("⏹️  Simulation stopped, shutting down '{}'", self.component_name());
                self.core.state = ParticipantState::Stopped;
                self.core.effects.push(ComponentEffect::CancelAllTimers);
                self.core.effects.push(ComponentEffect::Shutdown);
            }
        }
        self.core.take_effects()
    }

    pub fn on_epoch(&mut self, message: &EpochMessage) -> Vec<ComponentEffect> {
        if self.core.state.ignores_epochs() {
            debug!("Ignoring Epoch {} while {:?}", message.epoch_number(), self.core.state);
            return Vec::new();
        }
        if let Some(description) = self.core.init_error.clone() {
            self.send_error_message(&description);
            return self.core.take_effects();
        }

        let epoch = message.epoch_number();
        if epoch < self.core.current_epoch {
            debug!("Ignoring stale Epoch {} (current epoch {})", epoch, self.core.current_epoch);
            return Vec::new();
        }

        if epoch == self.core.current_epoch && self.core.latest_epoch.is_some() {
            let completed = self.core.completed_epoch == Some(epoch);
            let answered = completed
                && self
                    .core
                    .last_status_id
                    .as_ref()
                    .map_or(false, |id| message.stamp().triggering_message_ids().contains(id));
            if answered {
                debug!("Epoch {} already acknowledged", epoch);
                return Vec::new();
            }
            let message_id = message.origin().message_id().to_string();
            if !self.core.triggering.contains(&message_id) {
                self.core.triggering.push(message_id);
            }
            if completed {
                info!("Epoch {} was re-sent, repeating the ready Status", epoch);
                self.send_ready();
            } else {
                self.start_epoch();
            }
            return self.core.take_effects();
        }

        info!(
            "⏩ Epoch {} [{} .. {}]",
            epoch,
            timestamp::format(&message.start_time()),
            timestamp::format(&message.end_time())
        );
        self.core.current_epoch = epoch;
        self.core.latest_epoch = Some(message.clone());
        self.core.triggering = vec![message.origin().message_id().to_string()];
        self.core.completed_epoch = None;
        self.core.warnings.clear();
        self.component.clear_epoch_variables();
        self.core.state = ParticipantState::Computing;
        self.replay_held(epoch);
        self.start_epoch();
        self.core.take_effects()
    }

    fn on_domain_message(&mut self, topic: &str, message: &Message) -> Vec<ComponentEffect> {
        if self.core.state.ignores_epochs() {
            return Vec::new();
        }
        if message.epoch_number().map_or(false, |epoch| epoch > self.core.current_epoch) {
            self.hold(topic, message);
            return Vec::new();
        }
        if let (Some(epoch), Some(sender)) = (message.epoch_number(), message.source_process_id()) {
            if epoch < self.core.current_epoch {
                warn!(
                    "Protocol violation: {} from '{}' for epoch {} while the current epoch is {}",
                    message.message_type(),
                    sender,
                    epoch,
                    self.core.current_epoch
                );
            }
        }
        let mut ctx = ComponentContext::new(&mut self.core);
        self.component.general_message_handler(message, topic, &mut ctx);
        self.after_hook();
        self.start_epoch();
        self.core.take_effects()
    }

    /// Inputs can overtake their Epoch message; they wait until that epoch opens.
    fn hold(&mut self, topic: &str, message: &Message) {
        if self.held.len() >= MAX_HELD_MESSAGES {
            if let Some((_, dropped)) = self.held.pop_front() {
                warn!(
                    "Held input limit reached, dropping {} for epoch {:?}",
                    dropped.message_type(),
                    dropped.epoch_number()
                );
            }
        }
        debug!(
            "Holding {} for epoch {:?} (current epoch {})",
            message.message_type(),
            message.epoch_number(),
            self.core.current_epoch
        );
        self.held.push_back((topic.to_string(), message.clone()));
    }

    /// Hands the held inputs of `epoch` to the component, keeping later ones.
    fn replay_held(&mut self, epoch: u64) {
        let held = std::mem::take(&mut self.held);
        for (topic, message) in held {
            match message.epoch_number() {
                Some(number) if number > epoch => self.held.push_back((topic, message)),
                Some(number) if number < epoch => {
                    debug!("Dropping held {} for skipped epoch {}", message.message_type(), number)
                }
                _ => {
                    if self.core.state != ParticipantState::Computing {
                        continue;
                    }
                    let mut ctx = ComponentContext::new(&mut self.core);
                    self.component.general_message_handler(&message, &topic, &mut ctx);
                    self.after_hook();
                }
            }
        }
    }

    /// A keyed timer fired.
    pub fn on_timer(&mut self, key: &str) -> Vec<ComponentEffect> {
        if self.core.state.ignores_epochs() {
            return Vec::new();
        }
        let mut ctx = ComponentContext::new(&mut self.core);
        self.component.on_timer(key, &mut ctx);
        self.after_hook();
        self.start_epoch();
        self.core.take_effects()
    }

    /// Stops without a SimState("stopped"), e.g. on an external interrupt.
    pub fn shutdown(&mut self) -> Vec<ComponentEffect> {
        if self.is_stopped() {
            return Vec::new();
        }
        self.core.state = ParticipantState::Stopped;
        vec![ComponentEffect::CancelAllTimers, ComponentEffect::Shutdown]
    }

    /// Reports a failure detected outside the hooks.
    pub fn fail(&mut self, description: &str) -> Vec<ComponentEffect> {
        if self.core.state.ignores_epochs() {
            return Vec::new();
        }
        self.send_error_message(description);
        self.core.take_effects()
    }

    /// Publishes Status("error") for the current epoch and enters the error state.
    fn send_error_message(&mut self, description: &str) {
        if self.is_stopped() {
            return;
        }
        let epoch = self.core.current_epoch;
        let triggering = self.core.triggering.clone();
        match self.core.generator.status_error(epoch, triggering, description) {
            Ok(status) => {
                error!("❌ '{}' failed in epoch {}: {}", self.component_name(), epoch, description);
                self.core.last_status_id = Some(status.message_id().to_string());
                let topic = self.core.topics.error.clone();
                self.core.publish(topic, status.into());
            }
            Err(error) => error!("Could not build an error Status: {}", error),
        }
        self.core.failure.get_or_insert_with(|| description.to_string());
        self.core.state = ParticipantState::Error;
        self.core.push(ComponentEffect::CancelAllTimers);
    }

    fn send_ready(&mut self) {
        let epoch = self.core.current_epoch;
        let triggering = self.core.triggering.clone();
        let warnings = self.core.warnings.clone();
        match self.core.generator.status_ready(epoch, triggering, warnings) {
            Ok(status) => {
                info!("✅ '{}' ready for epoch {}", self.component_name(), epoch);
                self.core.last_status_id = Some(status.message_id().to_string());
                let topic = self.core.topics.status.clone();
                self.core.publish(topic, status.into());
            }
            Err(error) => {
                let description = format!("could not build a ready Status: {}", error);
                self.send_error_message(&description);
            }
        }
    }

    /// Runs `process_epoch` once the epoch is known and every input has arrived.
    fn start_epoch(&mut self) {
        if self.core.state != ParticipantState::Computing || self.core.latest_epoch.is_none() {
            return;
        }
        if self.core.completed_epoch == Some(self.core.current_epoch) {
            return;
        }
        if !self.component.all_messages_received_for_epoch() {
            debug!("Epoch {} still waiting for input", self.core.current_epoch);
            return;
        }

        let mut ctx = ComponentContext::new(&mut self.core);
        let progress = self.component.process_epoch(&mut ctx);
        if self.after_hook() {
            return;
        }
        match progress {
            Ok(EpochProgress::Completed) => {
                self.core.completed_epoch = Some(self.core.current_epoch);
                self.send_ready();
                if self.core.state == ParticipantState::Computing {
                    self.core.state = ParticipantState::AwaitingDecision;
                }
            }
            Ok(EpochProgress::MoreWork) => {
                debug!("Epoch {} needs more work", self.core.current_epoch);
            }
            Err(description) => self.send_error_message(&description),
        }
    }

    /// Applies a failure requested through the context. Returns `true` if one was.
    fn after_hook(&mut self) -> bool {
        if self.core.state == ParticipantState::Error {
            return true;
        }
        match self.core.failure.clone() {
            Some(description) => {
                self.send_error_message(&description);
                true
            }
            None => false,
        }
    }
}
