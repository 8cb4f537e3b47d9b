use std::time::Duration;

use chrono::{DateTime, Utc};
use lockstep::config::{FailurePolicy, ManagerConfig, TimeoutAction, TimeoutPolicy};
use lockstep::manager::*;
use lockstep::protocol::*;

const SIM: &str = "2024-01-01T00:00:00.000Z";

fn config(components: &[&str]) -> ManagerConfig {
    ManagerConfig {
        simulation_id: SIM.to_string(),
        components: components.iter().map(|name| name.to_string()).collect(),
        max_epochs: Some(10),
        start_delay: Duration::ZERO,
        timeout: TimeoutPolicy {
            interval: Duration::from_secs(30),
            max_resends: 0,
            action: TimeoutAction::Abort,
        },
        ..ManagerConfig::default()
    }
}

fn now() -> DateTime<Utc> {
    timestamp::now()
}

/// Participant-side message builder.
struct Peer {
    generator: MessageGenerator,
}

impl Peer {
    fn new(name: &str) -> Self {
        Self {
            generator: MessageGenerator::new(SIM, name),
        }
    }

    fn ready(&mut self, epoch: u64) -> StatusMessage {
        self.generator
            .status_ready(epoch, vec!["manager-1".to_string()], Vec::new())
            .unwrap()
    }

    fn error(&mut self, epoch: u64, description: &str) -> StatusMessage {
        self.generator
            .status_error(epoch, vec!["manager-1".to_string()], description)
            .unwrap()
    }
}

fn published(effects: &[ManagerEffect]) -> Vec<&Message> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            ManagerEffect::Publish { message, .. } => Some(message),
            _ => None,
        })
        .collect()
}

fn epoch_messages(effects: &[ManagerEffect]) -> Vec<&EpochMessage> {
    published(effects)
        .into_iter()
        .filter_map(|message| match message {
            Message::Epoch(epoch) => Some(epoch),
            _ => None,
        })
        .collect()
}

fn sim_states(effects: &[ManagerEffect]) -> Vec<SimulationState> {
    published(effects)
        .into_iter()
        .filter_map(|message| match message {
            Message::SimState(state) => Some(state.simulation_state()),
            _ => None,
        })
        .collect()
}

fn armed_timer(effects: &[ManagerEffect]) -> Option<(u64, u32, Duration)> {
    effects.iter().rev().find_map(|effect| match effect {
        ManagerEffect::ArmEpochTimer { epoch, attempt, delay } => Some((*epoch, *attempt, *delay)),
        _ => None,
    })
}

/// Starts a coordinator and completes the epoch 0 handshake so epoch 1 is open.
fn started(config: &ManagerConfig, peers: &mut [Peer]) -> Coordinator {
    let mut coordinator = Coordinator::new(config);
    let effects = coordinator.start(now());
    assert_eq!(sim_states(&effects), vec![SimulationState::Running]);
    for peer in peers.iter_mut() {
        let status = peer.ready(0);
        coordinator.on_status(&status, now());
    }
    assert_eq!(coordinator.current_epoch(), 1);
    coordinator
}

#[test]
fn test_start_publishes_running_and_arms_timer() {
    let mut coordinator = Coordinator::new(&config(&["a", "b"]));
    assert_eq!(coordinator.state(), RunState::Created);

    let effects = coordinator.start(now());
    assert_eq!(coordinator.state(), RunState::Running);
    assert_eq!(coordinator.current_epoch(), 0);
    assert_eq!(sim_states(&effects), vec![SimulationState::Running]);
    assert_eq!(armed_timer(&effects), Some((0, 0, Duration::from_secs(30))));

    // A second start does nothing
    assert!(coordinator.start(now()).is_empty());
}

#[test]
fn test_handshake_opens_first_epoch() {
    let mut peers = [Peer::new("a"), Peer::new("b")];
    let mut coordinator = Coordinator::new(&config(&["a", "b"]));
    coordinator.start(now());

    let status = peers[0].ready(0);
    assert!(coordinator.on_status(&status, now()).is_empty());
    assert_eq!(coordinator.current_epoch(), 0);

    let status = peers[1].ready(0);
    let effects = coordinator.on_status(&status, now());
    assert!(effects.contains(&ManagerEffect::CancelEpochTimer));
    let epochs = epoch_messages(&effects);
    assert_eq!(epochs.len(), 1);
    assert_eq!(epochs[0].epoch_number(), 1);
    assert_eq!(timestamp::format(&epochs[0].start_time()), "2020-01-01T00:00:00.000Z");
    assert_eq!(timestamp::format(&epochs[0].end_time()), "2020-01-01T01:00:00.000Z");
    assert_eq!(armed_timer(&effects), Some((1, 0, Duration::from_secs(30))));
}

#[test]
fn test_scenario_a_all_ready_advances() {
    let mut peers = [Peer::new("a"), Peer::new("b"), Peer::new("c")];
    let mut coordinator = started(&config(&["a", "b", "c"]), &mut peers);

    let mut last = Vec::new();
    let mut ready_ids = Vec::new();
    for peer in peers.iter_mut() {
        let status = peer.ready(1);
        ready_ids.push(status.message_id().to_string());
        last = coordinator.on_status(&status, now());
    }

    let epochs = epoch_messages(&last);
    assert_eq!(epochs.len(), 1);
    assert_eq!(epochs[0].epoch_number(), 2);
    assert_eq!(epochs[0].stamp().triggering_message_ids(), ready_ids.as_slice());
    assert_eq!(epochs[0].start_time(), timestamp::parse("2020-01-01T01:00:00Z").unwrap());
}

#[test]
fn test_no_advance_until_every_component_is_ready() {
    let mut peers = [Peer::new("a"), Peer::new("b"), Peer::new("c")];
    let mut coordinator = started(&config(&["a", "b", "c"]), &mut peers);

    for peer in peers.iter_mut().take(2) {
        let status = peer.ready(1);
        let effects = coordinator.on_status(&status, now());
        assert!(epoch_messages(&effects).is_empty());
    }
    assert_eq!(coordinator.current_epoch(), 1);
    let record = coordinator.current_record().unwrap();
    assert_eq!(record.pending_components(), vec!["c".to_string()]);
    assert!(!record.is_resolved());
}

#[test]
fn test_scenario_b_fail_fast_stops_immediately() {
    let mut peers = [Peer::new("x"), Peer::new("y"), Peer::new("z")];
    let mut coordinator = started(&config(&["x", "y", "z"]), &mut peers);

    let status = peers[0].error(1, "solver diverged");
    let effects = coordinator.on_status(&status, now());

    assert_eq!(sim_states(&effects), vec![SimulationState::Stopped]);
    assert!(effects.contains(&ManagerEffect::CancelEpochTimer));
    assert!(coordinator.is_stopped());

    let outcome = coordinator.outcome().unwrap();
    assert_eq!(
        outcome.reason,
        StopReason::ComponentError {
            component: "x".to_string(),
            epoch: 1
        }
    );
    assert_eq!(outcome.failed_components.len(), 1);
    assert_eq!(outcome.failed_components[0].description.as_deref(), Some("solver diverged"));
    assert!(!outcome.is_success());

    // Late readiness changes nothing once stopped
    let status = peers[1].ready(1);
    assert!(coordinator.on_status(&status, now()).is_empty());
}

#[test]
fn test_continue_policy_drops_failed_component() {
    let mut config = config(&["x", "y"]);
    config.failure_policy = FailurePolicy::Continue;
    let mut peers = [Peer::new("x"), Peer::new("y")];
    let mut coordinator = started(&config, &mut peers);

    let status = peers[0].error(1, "bad input");
    let effects = coordinator.on_status(&status, now());
    assert!(sim_states(&effects).is_empty());

    let status = peers[1].ready(1);
    let effects = coordinator.on_status(&status, now());
    assert_eq!(epoch_messages(&effects)[0].epoch_number(), 2);

    // Epoch 2 only waits for y
    let record = coordinator.current_record().unwrap();
    assert!(record.entry("x").is_none());
    assert_eq!(record.pending_components(), vec!["y".to_string()]);

    // A later ready from the failed component is ignored
    let status = peers[0].ready(2);
    coordinator.on_status(&status, now());
    assert!(coordinator.current_record().unwrap().entry("x").is_none());
}

#[test]
fn test_continue_policy_stops_when_nobody_is_left() {
    let mut config = config(&["x"]);
    config.failure_policy = FailurePolicy::Continue;
    let mut peers = [Peer::new("x")];
    let mut coordinator = started(&config, &mut peers);

    let status = peers[0].error(1, "gone");
    coordinator.on_status(&status, now());
    assert_eq!(coordinator.outcome().unwrap().reason, StopReason::AllComponentsFailed);
}

#[test]
fn test_scenario_c_timeout_aborts_once() {
    let mut peers = [Peer::new("x"), Peer::new("y")];
    let mut coordinator = started(&config(&["x", "y"]), &mut peers);

    let status = peers[0].ready(1);
    coordinator.on_status(&status, now());

    let effects = coordinator.on_epoch_timeout(1, 0, now());
    assert_eq!(sim_states(&effects), vec![SimulationState::Stopped]);
    let outcome = coordinator.outcome().unwrap().clone();
    assert_eq!(
        outcome.reason,
        StopReason::EpochTimeout {
            epoch: 1,
            components: vec!["y".to_string()]
        }
    );
    assert_eq!(
        outcome.timeouts,
        vec![TimeoutRecord {
            epoch: 1,
            components: vec!["y".to_string()]
        }]
    );
    assert_eq!(outcome.epochs_completed, 0);

    // A duplicate firing produces no second abort
    assert!(coordinator.on_epoch_timeout(1, 0, now()).is_empty());
    assert_eq!(coordinator.outcome().unwrap(), &outcome);
}

#[test]
fn test_scenario_c_timeout_proceeds_with_warning() {
    let mut config = config(&["x", "y"]);
    config.timeout.action = TimeoutAction::Proceed;
    let mut peers = [Peer::new("x"), Peer::new("y")];
    let mut coordinator = started(&config, &mut peers);

    let ready = peers[0].ready(1);
    coordinator.on_status(&ready, now());

    let effects = coordinator.on_epoch_timeout(1, 0, now());
    assert!(sim_states(&effects).is_empty());
    let epochs = epoch_messages(&effects);
    assert_eq!(epochs[0].epoch_number(), 2);
    assert_eq!(epochs[0].stamp().triggering_message_ids(), [ready.message_id().to_string()]);

    // The timed-out component stays registered for the next epoch
    let record = coordinator.current_record().unwrap();
    assert_eq!(record.pending_components(), vec!["x".to_string(), "y".to_string()]);

    // The timer of the resolved epoch can no longer fire an action
    assert!(coordinator.on_epoch_timeout(1, 0, now()).is_empty());
    assert_eq!(coordinator.current_epoch(), 2);
}

#[test]
fn test_resends_before_timeout_action() {
    let mut config = config(&["x", "y"]);
    config.timeout.max_resends = 2;
    let mut peers = [Peer::new("x"), Peer::new("y")];
    let mut coordinator = started(&config, &mut peers);
    let y_ready = peers[1].ready(1);
    assert!(epoch_messages(&coordinator.on_status(&y_ready, now())).is_empty());

    let effects = coordinator.on_epoch_timeout(1, 0, now());
    let resent = epoch_messages(&effects);
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].epoch_number(), 1);
    // The resend acknowledges the ready Status already received for this epoch
    assert_eq!(
        resent[0].stamp().triggering_message_ids(),
        [y_ready.message_id().to_string()]
    );
    assert_eq!(armed_timer(&effects), Some((1, 1, Duration::from_secs(60))));

    // The old attempt is stale now
    assert!(coordinator.on_epoch_timeout(1, 0, now()).is_empty());

    let effects = coordinator.on_epoch_timeout(1, 1, now());
    assert_eq!(armed_timer(&effects), Some((1, 2, Duration::from_secs(90))));
    assert_ne!(
        epoch_messages(&effects)[0].origin().message_id(),
        resent[0].origin().message_id()
    );

    let effects = coordinator.on_epoch_timeout(1, 2, now());
    assert_eq!(sim_states(&effects), vec![SimulationState::Stopped]);
    assert!(matches!(
        coordinator.outcome().unwrap().reason,
        StopReason::EpochTimeout { epoch: 1, .. }
    ));
}

#[test]
fn test_handshake_resend_repeats_sim_state() {
    let mut config = config(&["x"]);
    config.timeout.max_resends = 1;
    let mut coordinator = Coordinator::new(&config);
    coordinator.start(now());

    let effects = coordinator.on_epoch_timeout(0, 0, now());
    assert_eq!(sim_states(&effects), vec![SimulationState::Running]);
    assert_eq!(coordinator.state(), RunState::Running);
}

#[test]
fn test_duplicate_status_is_idempotent() {
    let mut peers = [Peer::new("a"), Peer::new("b")];
    let mut coordinator = started(&config(&["a", "b"]), &mut peers);

    let status = peers[0].ready(1);
    coordinator.on_status(&status, now());
    let before = coordinator.current_record().unwrap().entry("a").cloned();

    // Same message delivered again, and a second ready with a new id
    assert!(coordinator.on_status(&status, now()).is_empty());
    let again = peers[0].ready(1);
    assert!(coordinator.on_status(&again, now()).is_empty());

    let record = coordinator.current_record().unwrap();
    assert_eq!(record.entry("a").cloned(), before);
    assert_eq!(record.status_message_ids(), [status.message_id().to_string()]);
    assert_eq!(coordinator.current_epoch(), 1);
}

#[test]
fn test_error_after_ready_in_same_epoch() {
    let mut config = config(&["a", "b"]);
    config.failure_policy = FailurePolicy::Continue;
    let mut peers = [Peer::new("a"), Peer::new("b")];
    let mut coordinator = started(&config, &mut peers);

    let status = peers[0].ready(1);
    coordinator.on_status(&status, now());
    let status = peers[0].error(1, "late failure");
    coordinator.on_status(&status, now());

    let record = coordinator.current_record().unwrap();
    assert_eq!(record.entry("a").map(|entry| entry.status), Some(Readiness::Ready));
    assert_eq!(coordinator.failures().count(), 1);
}

#[test]
fn test_stale_status_never_reopens_epoch() {
    let mut peers = [Peer::new("a")];
    let mut coordinator = started(&config(&["a"]), &mut peers);

    let status = peers[0].ready(1);
    coordinator.on_status(&status, now());
    assert_eq!(coordinator.current_epoch(), 2);

    // Stale ready and stale error for epoch 1
    let stale = peers[0].ready(1);
    assert!(coordinator.on_status(&stale, now()).is_empty());
    let stale_error = peers[0].error(1, "too late");
    assert!(coordinator.on_status(&stale_error, now()).is_empty());

    let record = coordinator.current_record().unwrap();
    assert_eq!(record.epoch_number, 2);
    assert_eq!(record.pending_components(), vec!["a".to_string()]);
    assert!(!coordinator.is_stopped());
}

#[test]
fn test_future_and_foreign_status_ignored() {
    let mut peers = [Peer::new("a")];
    let mut coordinator = started(&config(&["a"]), &mut peers);

    let future = peers[0].ready(5);
    assert!(coordinator.on_status(&future, now()).is_empty());

    let mut stranger = Peer::new("stranger");
    let unregistered = stranger.ready(1);
    assert!(coordinator.on_status(&unregistered, now()).is_empty());

    let mut other_run = MessageGenerator::new("another-run", "a");
    let foreign = other_run
        .status_ready(1, vec!["manager-1".to_string()], Vec::new())
        .unwrap();
    assert!(coordinator.on_status(&foreign, now()).is_empty());

    assert_eq!(
        coordinator.current_record().unwrap().pending_components(),
        vec!["a".to_string()]
    );
}

#[test]
fn test_stops_at_max_epochs() {
    let mut config = config(&["a"]);
    config.max_epochs = Some(2);
    let mut peers = [Peer::new("a")];
    let mut coordinator = started(&config, &mut peers);

    let status = peers[0].ready(1);
    coordinator.on_status(&status, now());
    let status = peers[0].ready(2);
    let effects = coordinator.on_status(&status, now());

    assert!(epoch_messages(&effects).is_empty());
    assert_eq!(sim_states(&effects), vec![SimulationState::Stopped]);
    let outcome = coordinator.outcome().unwrap();
    assert_eq!(outcome.reason, StopReason::MaxEpochsReached);
    assert_eq!(outcome.epochs_completed, 2);
    assert!(outcome.is_success());
}

#[test]
fn test_end_time_clamps_and_stops() {
    let mut config = config(&["a"]);
    config.max_epochs = None;
    config.end_time = timestamp::parse("2020-01-01T01:30:00Z");
    let mut peers = [Peer::new("a")];
    let mut coordinator = started(&config, &mut peers);

    let status = peers[0].ready(1);
    let effects = coordinator.on_status(&status, now());
    let epochs = epoch_messages(&effects);
    assert_eq!(epochs[0].end_time(), timestamp::parse("2020-01-01T01:30:00Z").unwrap());

    let status = peers[0].ready(2);
    coordinator.on_status(&status, now());
    assert_eq!(coordinator.outcome().unwrap().reason, StopReason::EndTimeReached);
}

#[test]
fn test_no_components_stops_after_start() {
    let mut coordinator = Coordinator::new(&config(&[]));
    let effects = coordinator.start(now());
    assert_eq!(sim_states(&effects), vec![SimulationState::Stopped]);
    assert_eq!(coordinator.outcome().unwrap().reason, StopReason::NoComponents);
}

#[test]
fn test_stop_is_idempotent() {
    let mut peers = [Peer::new("a")];
    let mut coordinator = started(&config(&["a"]), &mut peers);

    let effects = coordinator.stop(StopReason::Interrupted);
    assert_eq!(sim_states(&effects), vec![SimulationState::Stopped]);
    assert!(coordinator.stop(StopReason::BusLost).is_empty());
    assert_eq!(coordinator.outcome().unwrap().reason, StopReason::Interrupted);
}

#[test]
fn test_next_event_strategy_uses_hints() {
    let mut config = config(&["a", "b"]);
    config.epoch_strategy = lockstep::config::EpochStrategyKind::NextEvent;
    let mut peers = [Peer::new("a"), Peer::new("b")];
    let mut coordinator = started(&config, &mut peers);

    let hint = timestamp::parse("2020-01-01T01:20:00Z").unwrap();
    let status = peers[0].ready(1).with_next_event_time(hint);
    coordinator.on_status(&status, now());
    let status = peers[1].ready(1);
    let effects = coordinator.on_status(&status, now());

    let epochs = epoch_messages(&effects);
    assert_eq!(epochs[0].start_time(), timestamp::parse("2020-01-01T01:00:00Z").unwrap());
    assert_eq!(epochs[0].end_time(), hint);
}
