//! # Lockstep
//!
//! An epoch-barrier simulation platform. Independent components advance
//! through discrete epochs in lockstep, coordinated only through topic-based
//! publish/subscribe messages.
//!
//! ## Features
//!
//! - **Simulation Manager**: drives SimState/Epoch messages, tracks per-epoch
//!   readiness and enforces timeouts and failure policies
//! - **Participant workflow**: a hook trait plus a fixed driver that turns
//!   epoch work into Status messages
//! - **Message registry**: validating decode/encode of every message type;
//!   bad payloads become invalid records instead of errors
//! - **Topic bus**: in-process exchange or TCP broker with `*`/`#` wildcards
//!   and reconnect that keeps subscriptions
//! - **Timed tasks**: cancellable delayed and repeating callbacks
//!
//! ## Quick Start
//!
//! ```no_run
//! use lockstep::bus::{Connection, MemoryBroker};
//! use lockstep::component::ComponentService;
//! use lockstep::config::{ComponentConfig, DummyConfig, ManagerConfig};
//! use lockstep::dummy::DummyComponent;
//! use lockstep::manager::SimulationManager;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let connection = Connection::in_memory(&MemoryBroker::new());
//!
//! let component = ComponentConfig {
//!     component_name: "solar".to_string(),
//!     ..ComponentConfig::default()
//! };
//! let manager = ManagerConfig {
//!     simulation_id: component.simulation_id.clone(),
//!     components: vec!["solar".to_string()],
//!     ..ManagerConfig::default()
//! };
//!
//! let participant = ComponentService::new(&component, &connection, DummyComponent::new(DummyConfig::default()));
//! tokio::spawn(participant.run());
//!
//! let outcome = SimulationManager::new(&manager, &connection).run().await?;
//! println!("stopped: {}", outcome.reason);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`manager`] - Coordinator state machine and its bus driver
//! - [`component`] - Participant hooks, runtime and bus driver
//! - [`protocol`] - Message model, registry/codec and id generation
//! - [`bus`] - Topic exchange, transports and the bus client
//! - [`scheduler`] - Timed-task scheduler
//! - [`config`] - Configuration resolved from the environment
//! - [`dummy`] - Reference participant
//! - [`recorder`] - Catch-all message log

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod bus;
pub mod component;
pub mod config;
pub mod dummy;
pub mod manager;
pub mod protocol;
pub mod recorder;
pub mod scheduler;

// Re-export main public types for convenience
pub use bus::{BusClient, Connection, MemoryBroker};
pub use component::{ComponentContext, ComponentService, EpochProgress, ParticipantState, SimulationComponent};
pub use config::{ComponentConfig, ManagerConfig};
pub use manager::{Coordinator, RunOutcome, SimulationManager, StopReason};
pub use protocol::{Message, MessageRegistry};
pub use scheduler::{TimerHandle, TimerScheduler};
