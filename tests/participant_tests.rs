use std::time::Duration;

use lockstep::component::*;
use lockstep::config::ComponentConfig;
use lockstep::protocol::*;
use serde_json::{json, Map};

const SIM: &str = "2024-01-01T00:00:00.000Z";

/// Waits for one `Forecast` input per epoch, then publishes a `Load` result.
#[derive(Default)]
struct LoadModel {
    forecast: Option<f64>,
    cleared: u32,
    processed: u32,
    fail_in_epoch: Option<u64>,
    fail_on_init: bool,
    warn: bool,
}

impl SimulationComponent for LoadModel {
    fn initialize(&mut self) -> Result<(), String> {
        if self.fail_on_init {
            return Err("missing model parameters".to_string());
        }
        Ok(())
    }

    fn clear_epoch_variables(&mut self) {
        self.forecast = None;
        self.cleared += 1;
    }

    fn general_message_handler(&mut self, message: &Message, _topic: &str, ctx: &mut ComponentContext<'_>) {
        if let Message::General(general) = message {
            if general.epoch_number() == Some(ctx.epoch_number()) {
                self.forecast = general.attribute("Value").and_then(|value| value.as_f64());
                if let Some(message_id) = general.message_id() {
                    ctx.add_triggering_message_id(message_id);
                }
            }
        }
    }

    fn all_messages_received_for_epoch(&self) -> bool {
        self.forecast.is_some()
    }

    fn process_epoch(&mut self, ctx: &mut ComponentContext<'_>) -> Result<EpochProgress, String> {
        self.processed += 1;
        if self.fail_in_epoch == Some(ctx.epoch_number()) {
            return Err("load flow did not converge".to_string());
        }
        if self.warn {
            ctx.add_status_warning("warning.convergence").map_err(|error| error.to_string())?;
        }
        let mut attributes = Map::new();
        attributes.insert("Value".to_string(), json!(self.forecast.unwrap_or_default() * 2.0));
        ctx.publish_result("Load", "Load", attributes).map_err(|error| error.to_string())?;
        Ok(EpochProgress::Completed)
    }
}

/// Completes only after its settle timer fired.
#[derive(Default)]
struct Settling {
    settled: bool,
}

impl SimulationComponent for Settling {
    fn clear_epoch_variables(&mut self) {
        self.settled = false;
    }

    fn process_epoch(&mut self, ctx: &mut ComponentContext<'_>) -> Result<EpochProgress, String> {
        if self.settled {
            return Ok(EpochProgress::Completed);
        }
        ctx.schedule_timer("settle", Duration::from_millis(50));
        Ok(EpochProgress::MoreWork)
    }

    fn on_timer(&mut self, key: &str, _ctx: &mut ComponentContext<'_>) {
        if key == "settle" {
            self.settled = true;
        }
    }
}

fn runtime<C: SimulationComponent>(component: C) -> ComponentRuntime<C> {
    let config = ComponentConfig {
        simulation_id: SIM.to_string(),
        component_name: "load".to_string(),
        ..ComponentConfig::default()
    };
    let mut runtime = ComponentRuntime::new(&config, component);
    runtime.initialize();
    runtime
}

struct Manager {
    generator: MessageGenerator,
}

impl Manager {
    fn new() -> Self {
        Self {
            generator: MessageGenerator::new(SIM, "manager"),
        }
    }

    fn running(&mut self) -> Message {
        self.generator
            .sim_state(SimulationState::Running, None, None)
            .unwrap()
            .into()
    }

    fn stopped(&mut self) -> Message {
        self.generator
            .sim_state(SimulationState::Stopped, None, None)
            .unwrap()
            .into()
    }

    fn epoch(&mut self, epoch: u64, triggering: Vec<String>) -> EpochMessage {
        let start = timestamp::parse("2020-01-01T00:00:00Z").unwrap() + chrono::Duration::hours(epoch as i64 - 1);
        self.generator
            .epoch(epoch, start, start + chrono::Duration::hours(1), triggering)
            .unwrap()
    }
}

fn forecast(epoch: u64, value: f64) -> Message {
    let mut generator = MessageGenerator::new(SIM, "forecaster");
    let mut attributes = Map::new();
    attributes.insert("Value".to_string(), json!(value));
    generator
        .result("Forecast", epoch, vec!["manager-2".to_string()], attributes)
        .unwrap()
        .into()
}

fn statuses(effects: &[ComponentEffect]) -> Vec<(&str, &StatusMessage)> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            ComponentEffect::Publish {
                topic,
                message: Message::Status(status),
            } => Some((topic.as_str(), status)),
            _ => None,
        })
        .collect()
}

fn results(effects: &[ComponentEffect]) -> Vec<&GeneralMessage> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            ComponentEffect::Publish {
                message: Message::General(general),
                ..
            } => Some(general),
            _ => None,
        })
        .collect()
}

#[test]
fn test_handshake_sends_ready_for_epoch_zero() {
    let mut manager = Manager::new();
    let mut runtime = runtime(LoadModel::default());
    assert_eq!(runtime.state(), ParticipantState::Idle);

    let running = manager.running();
    let effects = runtime.handle_message("SimState", &running);
    let sent = statuses(&effects);
    assert_eq!(sent.len(), 1);
    let (topic, status) = sent[0];
    assert_eq!(topic, "Status.Ready");
    assert_eq!(status.value(), StatusValue::Ready);
    assert_eq!(status.epoch_number(), 0);
    assert_eq!(status.stamp().triggering_message_ids(), [running.message_id().unwrap().to_string()]);
    assert_eq!(runtime.state(), ParticipantState::WaitingForEpoch);
}

#[test]
fn test_failed_initialize_reports_error_at_handshake() {
    let mut manager = Manager::new();
    let mut runtime = runtime(LoadModel {
        fail_on_init: true,
        ..LoadModel::default()
    });

    let effects = runtime.handle_message("SimState", &manager.running());
    let sent = statuses(&effects);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "Status.Error");
    assert_eq!(sent[0].1.value(), StatusValue::Error);
    assert_eq!(sent[0].1.description(), Some("missing model parameters"));
    assert_eq!(runtime.state(), ParticipantState::Error);
}

#[test]
fn test_epoch_waits_for_inputs_then_reports_ready() {
    let mut manager = Manager::new();
    let mut runtime = runtime(LoadModel::default());
    runtime.handle_message("SimState", &manager.running());

    let epoch = manager.epoch(1, vec!["load-1".to_string()]);
    let effects = runtime.on_epoch(&epoch);
    assert!(statuses(&effects).is_empty());
    assert_eq!(runtime.state(), ParticipantState::Computing);
    assert_eq!(runtime.component().cleared, 1);
    assert_eq!(runtime.component().processed, 0);

    let input = forecast(1, 4.0);
    let effects = runtime.handle_message("Forecast", &input);
    let published = results(&effects);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].attribute("Value"), Some(&json!(8.0)));
    assert_eq!(published[0].epoch_number(), Some(1));

    let sent = statuses(&effects);
    assert_eq!(sent.len(), 1);
    let status = sent[0].1;
    assert_eq!(status.epoch_number(), 1);
    assert_eq!(
        status.stamp().triggering_message_ids(),
        [epoch.origin().message_id().to_string(), input.message_id().unwrap().to_string()]
    );
    assert_eq!(runtime.state(), ParticipantState::AwaitingDecision);
}

#[test]
fn test_input_ahead_of_its_epoch_is_kept() {
    let mut manager = Manager::new();
    let mut runtime = runtime(LoadModel::default());
    runtime.handle_message("SimState", &manager.running());

    // The input overtakes Epoch(1) on another topic
    let input = forecast(1, 3.0);
    assert!(runtime.handle_message("Forecast", &input).is_empty());
    assert_eq!(runtime.held_count(), 1);
    assert_eq!(runtime.component().forecast, None);

    let epoch = manager.epoch(1, vec!["load-1".to_string()]);
    let effects = runtime.handle_message("Epoch", &epoch.clone().into());
    assert_eq!(runtime.held_count(), 0);
    assert_eq!(results(&effects)[0].attribute("Value"), Some(&json!(6.0)));

    let sent = statuses(&effects);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1.value(), StatusValue::Ready);
    assert_eq!(
        sent[0].1.stamp().triggering_message_ids(),
        [epoch.origin().message_id().to_string(), input.message_id().unwrap().to_string()]
    );
}

#[test]
fn test_held_input_waits_for_later_epoch() {
    let mut manager = Manager::new();
    let mut runtime = runtime(LoadModel::default());
    runtime.handle_message("SimState", &manager.running());

    runtime.on_epoch(&manager.epoch(1, vec!["load-1".to_string()]));
    assert!(runtime.handle_message("Forecast", &forecast(2, 5.0)).is_empty());
    assert_eq!(runtime.held_count(), 1);

    let effects = runtime.handle_message("Forecast", &forecast(1, 1.0));
    assert_eq!(results(&effects)[0].attribute("Value"), Some(&json!(2.0)));
    assert_eq!(runtime.held_count(), 1);

    let effects = runtime.on_epoch(&manager.epoch(2, vec!["load-2".to_string()]));
    assert_eq!(results(&effects)[0].epoch_number(), Some(2));
    assert_eq!(results(&effects)[0].attribute("Value"), Some(&json!(10.0)));
    assert_eq!(runtime.held_count(), 0);
}

#[test]
fn test_warnings_attach_to_ready_status() {
    let mut manager = Manager::new();
    let mut runtime = runtime(LoadModel {
        warn: true,
        ..LoadModel::default()
    });
    runtime.handle_message("SimState", &manager.running());
    runtime.on_epoch(&manager.epoch(1, vec!["load-1".to_string()]));

    let effects = runtime.handle_message("Forecast", &forecast(1, 1.0));
    assert_eq!(statuses(&effects)[0].1.stamp().warnings(), ["warning.convergence"]);
}

#[test]
fn test_process_error_sends_error_status() {
    let mut manager = Manager::new();
    let mut runtime = runtime(LoadModel {
        fail_in_epoch: Some(1),
        ..LoadModel::default()
    });
    runtime.handle_message("SimState", &manager.running());
    runtime.on_epoch(&manager.epoch(1, vec!["load-1".to_string()]));

    let effects = runtime.handle_message("Forecast", &forecast(1, 1.0));
    let sent = statuses(&effects);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "Status.Error");
    assert_eq!(sent[0].1.description(), Some("load flow did not converge"));
    assert!(effects.contains(&ComponentEffect::CancelAllTimers));
    assert!(results(&effects).is_empty());
    assert_eq!(runtime.state(), ParticipantState::Error);

    // An errored participant ignores further epochs
    assert!(runtime.on_epoch(&manager.epoch(2, vec!["x-1".to_string()])).is_empty());
    assert_eq!(runtime.current_epoch(), 1);
}

#[test]
fn test_more_work_completes_after_timer() {
    let mut manager = Manager::new();
    let mut runtime = runtime(Settling::default());
    runtime.handle_message("SimState", &manager.running());

    let effects = runtime.on_epoch(&manager.epoch(1, vec!["load-1".to_string()]));
    assert!(statuses(&effects).is_empty());
    assert!(effects.contains(&ComponentEffect::ScheduleTimer {
        key: "settle".to_string(),
        delay: Duration::from_millis(50),
        repeating: false,
    }));

    let effects = runtime.on_timer("settle");
    assert_eq!(statuses(&effects).len(), 1);
    assert_eq!(runtime.state(), ParticipantState::AwaitingDecision);
}

#[test]
fn test_resent_epoch_repeats_ready_once() {
    let mut manager = Manager::new();
    let mut runtime = runtime(Settling { settled: false });
    runtime.handle_message("SimState", &manager.running());
    runtime.on_epoch(&manager.epoch(1, vec!["load-1".to_string()]));
    let first = runtime.on_timer("settle");
    let first_id = statuses(&first)[0].1.message_id().to_string();

    // The manager missed the ready Status and re-sent the Epoch
    let resent = manager.epoch(1, vec!["load-1".to_string()]);
    let effects = runtime.on_epoch(&resent);
    let sent = statuses(&effects);
    assert_eq!(sent.len(), 1);
    assert_ne!(sent[0].1.message_id(), first_id);
    assert!(sent[0]
        .1
        .stamp()
        .triggering_message_ids()
        .contains(&resent.origin().message_id().to_string()));

    // A re-sent Epoch that already lists our latest Status needs no answer
    let latest = sent[0].1.message_id().to_string();
    let acknowledged = manager.epoch(1, vec![latest]);
    assert!(statuses(&runtime.on_epoch(&acknowledged)).is_empty());
}

#[test]
fn test_stale_epoch_ignored() {
    let mut manager = Manager::new();
    let mut runtime = runtime(Settling { settled: false });
    runtime.handle_message("SimState", &manager.running());
    let old = manager.epoch(1, vec!["load-1".to_string()]);
    runtime.on_epoch(&old);
    runtime.on_timer("settle");
    runtime.on_epoch(&manager.epoch(2, vec!["load-2".to_string()]));

    assert!(runtime.on_epoch(&old).is_empty());
    assert_eq!(runtime.current_epoch(), 2);
    assert_eq!(runtime.state(), ParticipantState::Computing);
}

#[test]
fn test_stop_cancels_timers_and_shuts_down() {
    let mut manager = Manager::new();
    let mut runtime = runtime(Settling::default());
    runtime.handle_message("SimState", &manager.running());
    runtime.on_epoch(&manager.epoch(1, vec!["load-1".to_string()]));

    let effects = runtime.handle_message("SimState", &manager.stopped());
    assert_eq!(effects, vec![ComponentEffect::CancelAllTimers, ComponentEffect::Shutdown]);
    assert!(runtime.is_stopped());

    // Nothing is published once stopped
    assert!(runtime.on_timer("settle").is_empty());
    assert!(runtime
        .handle_message("Epoch", &manager.epoch(2, vec!["load-1".to_string()]).into())
        .is_empty());
}

#[test]
fn test_foreign_and_own_messages_ignored() {
    let mut runtime = runtime(LoadModel::default());

    let mut other_run = MessageGenerator::new("another-run", "manager");
    let foreign: Message = other_run
        .sim_state(SimulationState::Running, None, None)
        .unwrap()
        .into();
    assert!(runtime.handle_message("SimState", &foreign).is_empty());
    assert_eq!(runtime.state(), ParticipantState::Idle);

    let mut me = MessageGenerator::new(SIM, "load");
    let own: Message = me.sim_state(SimulationState::Running, None, None).unwrap().into();
    assert!(runtime.handle_message("SimState", &own).is_empty());
}

#[test]
fn test_context_rejects_unknown_warning() {
    struct Picky;

    impl SimulationComponent for Picky {
        fn clear_epoch_variables(&mut self) {}

        fn process_epoch(&mut self, ctx: &mut ComponentContext<'_>) -> Result<EpochProgress, String> {
            assert!(ctx.add_status_warning("warning.other.detail").is_ok());
            assert!(ctx.add_status_warning("oops").is_err());
            Ok(EpochProgress::Completed)
        }
    }

    let mut manager = Manager::new();
    let mut runtime = runtime(Picky);
    runtime.handle_message("SimState", &manager.running());
    let effects = runtime.on_epoch(&manager.epoch(1, vec!["load-1".to_string()]));
    assert_eq!(statuses(&effects)[0].1.stamp().warnings(), ["warning.other.detail"]);
}
