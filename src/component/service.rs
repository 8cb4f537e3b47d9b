use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::runtime::{ComponentEffect, ComponentRuntime};
use super::{ComponentError, ParticipantState, SimulationComponent};
use crate::bus::{BusClient, Connection, Inbound, Subscription};
use crate::config::{ComponentConfig, ControlTopics};
use crate::protocol::Decoded;
use crate::scheduler::{TimerHandle, TimerScheduler};

/// A timer firing tagged with the generation it was armed under.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TimerFired {
    key: String,
    generation: u64,
}

struct ArmedTimer {
    generation: u64,
    handle: TimerHandle,
}

/// Runs one participant against the message bus until the simulation stops.
pub struct ComponentService<C: SimulationComponent> {
    runtime: ComponentRuntime<C>,
    client: BusClient,
    topics: ControlTopics,
    other_topics: Vec<String>,
    scheduler: TimerScheduler,
    timers: HashMap<String, ArmedTimer>,
    next_generation: u64,
    timer_tx: mpsc::UnboundedSender<TimerFired>,
    timer_rx: mpsc::UnboundedReceiver<TimerFired>,
    interrupt: CancellationToken,
}

impl<C: SimulationComponent> ComponentService<C> {
    pub fn new(config: &ComponentConfig, connection: &Connection, component: C) -> Self {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        Self {
            runtime: ComponentRuntime::new(config, component),
            client: connection.client(config.bus.exchange.as_str()),
            topics: config.topics.clone(),
            other_topics: config.other_topics.clone(),
            scheduler: TimerScheduler::new(),
            timers: HashMap::new(),
            next_generation: 0,
            timer_tx,
            timer_rx,
            interrupt: CancellationToken::new(),
        }
    }

    pub fn runtime(&self) -> &ComponentRuntime<C> {
        &self.runtime
    }

    /// Cancelling the returned token stops the component without waiting for SimState("stopped").
    pub fn interrupt_handle(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    /// Runs until SimState("stopped") or an interrupt, returning the final state.
    pub async fn run(mut self) -> Result<ParticipantState, ComponentError> {
        let result = self.drive().await;
        self.release().await;
        result
    }

    async fn drive(&mut self) -> Result<ParticipantState, ComponentError> {
        self.runtime.initialize();

        let control_topics = [self.topics.sim_state.as_str(), self.topics.epoch.as_str()];
        let mut control = self.client.subscribe(&control_topics).await?;
        let mut domain = if self.other_topics.is_empty() {
            None
        } else {
            let patterns: Vec<&str> = self.other_topics.iter().map(String::as_str).collect();
            Some(self.client.subscribe(&patterns).await?)
        };
        info!(
            "Component '{}' listening (other topics: [{}])",
            self.runtime.component_name(),
            self.other_topics.join(", ")
        );

        while !self.runtime.is_stopped() {
            let effects = tokio::select! {
                biased;
                inbound = control.next() => match inbound {
                    Some(inbound) => self.handle_inbound(inbound),
                    None => return Err(self.disconnected()),
                },
                inbound = next_domain(&mut domain) => match inbound {
                    Some(inbound) => self.handle_inbound(inbound),
                    None => return Err(self.disconnected()),
                },
                Some(fired) = self.timer_rx.recv() => self.handle_timer(fired),
                _ = self.interrupt.cancelled() => {
                    warn!("Component '{}' interrupted", self.runtime.component_name());
                    self.runtime.shutdown()
                }
            };
            self.apply(effects).await;
        }
        Ok(self.runtime.state())
    }

    fn disconnected(&self) -> ComponentError {
        error!(
            "Bus subscription of '{}' closed before the simulation stopped",
            self.runtime.component_name()
        );
        ComponentError::Disconnected
    }

    fn handle_inbound(&mut self, inbound: Inbound) -> Vec<ComponentEffect> {
        match inbound.decoded {
            Decoded::Message(message) => self.runtime.handle_message(&inbound.topic, &message),
            Decoded::Invalid(_) => Vec::new(),
        }
    }

    fn handle_timer(&mut self, fired: TimerFired) -> Vec<ComponentEffect> {
        let Some(armed) = self.timers.get(&fired.key) else {
            debug!("Ignoring firing of released timer '{}'", fired.key);
            return Vec::new();
        };
        if armed.generation != fired.generation {
            debug!("Ignoring firing of replaced timer '{}'", fired.key);
            return Vec::new();
        }
        if !armed.handle.is_active() {
            self.timers.remove(&fired.key);
        }
        self.runtime.on_timer(&fired.key)
    }

    /// Carries out effects in order. Publish failures are logged only.
    async fn apply(&mut self, effects: Vec<ComponentEffect>) {
        let mut queue: VecDeque<ComponentEffect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                ComponentEffect::Publish { topic, message } => {
                    if let Err(error) = self.client.publish(&topic, &message).await {
                        error!("Failed to publish {} on '{}': {}", message.message_type(), topic, error);
                    }
                }
                ComponentEffect::ScheduleTimer { key, delay, repeating } => {
                    queue.extend(self.schedule_timer(key, delay, repeating));
                }
                ComponentEffect::CancelTimer { key } => {
                    if let Some(armed) = self.timers.remove(&key) {
                        armed.handle.cancel();
                    }
                }
                ComponentEffect::CancelAllTimers => self.cancel_timers(),
                ComponentEffect::Shutdown => debug!("Shutdown requested for '{}'", self.runtime.component_name()),
            }
        }
    }

    fn schedule_timer(&mut self, key: String, delay: Duration, repeating: bool) -> Vec<ComponentEffect> {
        if let Some(previous) = self.timers.remove(&key) {
            previous.handle.cancel();
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        let sender = self.timer_tx.clone();
        let callback_key = key.clone();
        let scheduled = self.scheduler.schedule(repeating, delay, move || {
            let fired = TimerFired {
                key: callback_key.clone(),
                generation,
            };
            let sender = sender.clone();
            async move {
                let _ = sender.send(fired);
            }
        });
        match scheduled {
            Ok(handle) => {
                self.timers.insert(key, ArmedTimer { generation, handle });
                Vec::new()
            }
            Err(error) => self
                .runtime
                .fail(&format!("could not schedule timer '{}': {}", key, error)),
        }
    }

    fn cancel_timers(&mut self) {
        for (_, armed) in self.timers.drain() {
            armed.handle.cancel();
        }
    }

    async fn release(&mut self) {
        self.cancel_timers();
        self.scheduler.cancel_all();
        self.client.close().await;
        debug!("Component '{}' released its bus client", self.runtime.component_name());
    }
}

async fn next_domain(subscription: &mut Option<Subscription>) -> Option<Inbound> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}
