use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Coordinator, EpochStrategy, ManagerEffect, ManagerError, RunOutcome, StopReason};
use crate::bus::{BusClient, Connection, Inbound};
use crate::config::{ControlTopics, ManagerConfig};
use crate::protocol::{Decoded, Message};
use crate::scheduler::{TimerHandle, TimerScheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerEvent {
    EpochTimeout { epoch: u64, attempt: u32 },
}

/// Drives a [`Coordinator`] over the message bus until the run stops.
///
/// Status messages, epoch timer firings and interrupts are funnelled into a
/// single task, so the coordinator only ever sees one event at a time.
pub struct SimulationManager {
    coordinator: Coordinator,
    client: BusClient,
    topics: ControlTopics,
    start_delay: Duration,
    scheduler: TimerScheduler,
    epoch_timer: Option<TimerHandle>,
    events_tx: mpsc::UnboundedSender<ManagerEvent>,
    events_rx: mpsc::UnboundedReceiver<ManagerEvent>,
    interrupt: CancellationToken,
}

impl SimulationManager {
    pub fn new(config: &ManagerConfig, connection: &Connection) -> Self {
        Self::with_coordinator(Coordinator::new(config), config, connection)
    }

    pub fn with_strategy(config: &ManagerConfig, connection: &Connection, strategy: Box<dyn EpochStrategy>) -> Self {
        Self::with_coordinator(Coordinator::with_strategy(config, strategy), config, connection)
    }

    fn with_coordinator(coordinator: Coordinator, config: &ManagerConfig, connection: &Connection) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            coordinator,
            client: connection.client(config.bus.exchange.as_str()),
            topics: config.topics.clone(),
            start_delay: config.start_delay,
            scheduler: TimerScheduler::new(),
            epoch_timer: None,
            events_tx,
            events_rx,
            interrupt: CancellationToken::new(),
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Cancelling the returned token stops the run with [`StopReason::Interrupted`].
    pub fn interrupt_handle(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    /// Runs the simulation to completion and returns its outcome.
    pub async fn run(mut self) -> Result<RunOutcome, ManagerError> {
        let result = self.drive().await;
        self.release().await;
        result
    }

    async fn drive(&mut self) -> Result<RunOutcome, ManagerError> {
        let patterns = [self.topics.status.clone(), self.topics.error.clone()];
        let patterns: Vec<&str> = patterns.iter().map(String::as_str).collect();
        let mut statuses = self.client.subscribe(&patterns).await?;

        if !self.start_delay.is_zero() {
            info!("Waiting {:?} for components to subscribe", self.start_delay);
            tokio::select! {
                _ = tokio::time::sleep(self.start_delay) => {}
                _ = self.interrupt.cancelled() => {
                    warn!("Interrupted before the simulation started");
                    let effects = self.coordinator.stop(StopReason::Interrupted);
                    self.apply(effects).await;
                }
            }
        }

        if !self.coordinator.is_stopped() {
            let effects = self.coordinator.start(Utc::now());
            self.apply(effects).await;
        }

        while !self.coordinator.is_stopped() {
            let effects = tokio::select! {
                inbound = statuses.next() => match inbound {
                    Some(inbound) => self.handle_inbound(inbound),
                    None => {
                        error!("Status subscription closed, stopping the simulation");
                        self.coordinator.stop(StopReason::BusLost)
                    }
                },
                Some(event) = self.events_rx.recv() => match event {
                    ManagerEvent::EpochTimeout { epoch, attempt } => {
                        self.coordinator.on_epoch_timeout(epoch, attempt, Utc::now())
                    }
                },
                _ = self.interrupt.cancelled() => {
                    warn!("Interrupted, stopping the simulation");
                    self.coordinator.stop(StopReason::Interrupted)
                }
            };
            self.apply(effects).await;
        }

        self.coordinator.outcome().cloned().ok_or(ManagerError::Incomplete)
    }

    fn handle_inbound(&mut self, inbound: Inbound) -> Vec<ManagerEffect> {
        match inbound.decoded {
            Decoded::Message(Message::Status(status)) => self.coordinator.on_status(&status, Utc::now()),
            Decoded::Message(other) => {
                debug!("Ignoring {} message on '{}'", other.message_type(), inbound.topic);
                Vec::new()
            }
            // Already reported by the subscription.
            Decoded::Invalid(_) => Vec::new(),
        }
    }

    /// Carries out effects in order. Publish failures are logged and never change run state.
    async fn apply(&mut self, effects: Vec<ManagerEffect>) {
        let mut queue: VecDeque<ManagerEffect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                ManagerEffect::Publish { topic, message } => {
                    if let Err(error) = self.client.publish(&topic, &message).await {
                        error!(
                            "Failed to publish {} on '{}': {}",
                            message.message_type(),
                            topic,
                            error
                        );
                    }
                }
                ManagerEffect::ArmEpochTimer { epoch, attempt, delay } => {
                    self.cancel_epoch_timer();
                    let events = self.events_tx.clone();
                    let scheduled = self.scheduler.schedule(false, delay, move || {
                        let events = events.clone();
                        async move {
                            let _ = events.send(ManagerEvent::EpochTimeout { epoch, attempt });
                        }
                    });
                    match scheduled {
                        Ok(handle) => self.epoch_timer = Some(handle),
                        Err(error) => {
                            error!("Could not arm the epoch {} timer: {}", epoch, error);
                            queue.extend(self.coordinator.stop(StopReason::Internal {
                                reason: error.to_string(),
                            }));
                        }
                    }
                }
                ManagerEffect::CancelEpochTimer => self.cancel_epoch_timer(),
            }
        }
    }

    fn cancel_epoch_timer(&mut self) {
        if let Some(timer) = self.epoch_timer.take() {
            timer.cancel();
        }
    }

    async fn release(&mut self) {
        self.cancel_epoch_timer();
        self.scheduler.cancel_all();
        self.client.close().await;
    }
}
