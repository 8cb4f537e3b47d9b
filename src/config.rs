//! Process configuration, resolved once at startup.
//!
//! Every struct here is plain data with a `Default` impl. `from_env` reads the
//! process environment; `from_lookup` takes any key lookup so tests can feed
//! values without touching the environment.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::timestamp;

pub const DEFAULT_MANAGER_NAME: &str = "manager";
pub const DEFAULT_COMPONENT_NAME: &str = "component";
pub const DEFAULT_EXCHANGE: &str = "simulation";
pub const DEFAULT_SIMULATION_ID: &str = "2020-01-01T00:00:00.000Z";
pub const DEFAULT_INITIAL_START_TIME: &str = "2020-01-01T00:00:00.000Z";
pub const DEFAULT_EPOCH_LENGTH_SECONDS: u64 = 3600;
pub const DEFAULT_MAX_EPOCHS: u64 = 5;
pub const DEFAULT_EPOCH_TIMER_INTERVAL_SECONDS: f64 = 120.0;
pub const DEFAULT_START_DELAY_SECONDS: f64 = 10.0;
/// Upper bound for every duration setting: one hundred years.
pub const MAX_DURATION_SECONDS: f64 = 3_155_760_000.0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue { key: String, value: String, reason: String },
    #[error("{0} must be set")]
    Missing(String),
}

fn invalid(key: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Key lookup shared by the `from_lookup` constructors.
struct Settings<F: Fn(&str) -> Option<String>> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Settings<F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn text(&self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or_else(|| default.to_string())
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.raw(key)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn parsed<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T::Err: fmt::Display,
    {
        match self.raw(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|error: T::Err| invalid(key, &value, error.to_string())),
        }
    }

    fn seconds(&self, key: &str, default: f64) -> Result<Duration, ConfigError> {
        let seconds: f64 = self.parsed(key, default)?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(invalid(key, &seconds.to_string(), "must be a non-negative number of seconds"));
        }
        if seconds > MAX_DURATION_SECONDS {
            return Err(invalid(key, &seconds.to_string(), "must not exceed one hundred years"));
        }
        Ok(Duration::from_secs_f64(seconds))
    }

    fn chance(&self, key: &str) -> Result<f64, ConfigError> {
        let chance: f64 = self.parsed(key, 0.0)?;
        if !(0.0..=1.0).contains(&chance) {
            return Err(invalid(key, &chance.to_string(), "must be between 0 and 1"));
        }
        Ok(chance)
    }

    fn time(&self, key: &str) -> Result<Option<DateTime<Utc>>, ConfigError> {
        match self.raw(key) {
            None => Ok(None),
            Some(value) => timestamp::parse(&value)
                .map(Some)
                .ok_or_else(|| invalid(key, &value, "expected an ISO-8601 timestamp")),
        }
    }
}

/// Capped exponential backoff for re-establishing a broker connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: Some(10),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given retry (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BusTransport {
    /// In-process exchange; only participants in the same process can talk.
    Memory,
    /// A `lockstep broker` reachable over TCP.
    Tcp { address: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    pub transport: BusTransport,
    pub exchange: String,
    pub reconnect: ReconnectPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            transport: BusTransport::Memory,
            exchange: DEFAULT_EXCHANGE.to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl BusConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let settings = Settings { lookup };
        let defaults = ReconnectPolicy::default();
        let attempts: u32 = settings.parsed("BUS_RECONNECT_ATTEMPTS", defaults.max_attempts.unwrap_or(0))?;
        Ok(Self {
            transport: match settings.raw("BUS_ADDRESS") {
                Some(address) => BusTransport::Tcp { address },
                None => BusTransport::Memory,
            },
            exchange: settings.text("BUS_EXCHANGE", DEFAULT_EXCHANGE),
            reconnect: ReconnectPolicy {
                initial_delay: settings.seconds("BUS_RECONNECT_INTERVAL", defaults.initial_delay.as_secs_f64())?,
                max_delay: settings.seconds("BUS_RECONNECT_MAX_INTERVAL", defaults.max_delay.as_secs_f64())?,
                max_attempts: if attempts == 0 { None } else { Some(attempts) },
            },
        })
    }
}

/// Fixed control topics shared by the coordinator and every participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlTopics {
    pub sim_state: String,
    pub epoch: String,
    pub status: String,
    pub error: String,
}

impl Default for ControlTopics {
    fn default() -> Self {
        Self {
            sim_state: "SimState".to_string(),
            epoch: "Epoch".to_string(),
            status: "Status.Ready".to_string(),
            error: "Status.Error".to_string(),
        }
    }
}

impl ControlTopics {
    fn from_settings<F: Fn(&str) -> Option<String>>(settings: &Settings<F>) -> Self {
        let defaults = Self::default();
        Self {
            sim_state: settings.text("SIMULATION_STATE_MESSAGE_TOPIC", &defaults.sim_state),
            epoch: settings.text("SIMULATION_EPOCH_MESSAGE_TOPIC", &defaults.epoch),
            status: settings.text("SIMULATION_STATUS_MESSAGE_TOPIC", &defaults.status),
            error: settings.text("SIMULATION_ERROR_MESSAGE_TOPIC", &defaults.error),
        }
    }
}

/// What the coordinator does once an epoch times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutAction {
    Abort,
    Proceed,
}

impl FromStr for TimeoutAction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "abort" => Ok(TimeoutAction::Abort),
            "proceed" | "continue" => Ok(TimeoutAction::Proceed),
            other => Err(format!("unknown timeout policy '{}', expected abort or proceed", other)),
        }
    }
}

impl fmt::Display for TimeoutAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutAction::Abort => write!(f, "abort"),
            TimeoutAction::Proceed => write!(f, "proceed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    /// Wait before the first resend or timeout of an epoch.
    pub interval: Duration,
    /// Control-message resends before the epoch is declared timed out.
    pub max_resends: u32,
    pub action: TimeoutAction,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs_f64(DEFAULT_EPOCH_TIMER_INTERVAL_SECONDS),
            max_resends: 0,
            action: TimeoutAction::Abort,
        }
    }
}

impl TimeoutPolicy {
    /// Timer delay after `resends` resends have been made.
    pub fn delay_after(&self, resends: u32) -> Duration {
        self.interval.saturating_mul(resends.saturating_add(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Stop the run as soon as any component reports an error.
    FailFast,
    /// Drop errored components from later barriers and keep going.
    Continue,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "fail-fast" | "failfast" | "fail_fast" => Ok(FailurePolicy::FailFast),
            "continue" => Ok(FailurePolicy::Continue),
            other => Err(format!("unknown failure policy '{}', expected fail-fast or continue", other)),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::FailFast => write!(f, "fail-fast"),
            FailurePolicy::Continue => write!(f, "continue"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EpochStrategyKind {
    FixedStep,
    NextEvent,
}

impl FromStr for EpochStrategyKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "fixed" | "fixed-step" => Ok(EpochStrategyKind::FixedStep),
            "next-event" | "event" => Ok(EpochStrategyKind::NextEvent),
            other => Err(format!("unknown epoch strategy '{}', expected fixed or next-event", other)),
        }
    }
}

/// Generates a time-derived simulation id.
pub fn new_simulation_id() -> String {
    timestamp::format(&timestamp::now())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    pub simulation_id: String,
    pub manager_name: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub components: Vec<String>,
    pub initial_start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub epoch_length: Duration,
    pub max_epochs: Option<u64>,
    pub timeout: TimeoutPolicy,
    pub failure_policy: FailurePolicy,
    pub epoch_strategy: EpochStrategyKind,
    /// Wait before publishing SimState("running") so components can subscribe.
    pub start_delay: Duration,
    pub topics: ControlTopics,
    pub bus: BusConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            simulation_id: new_simulation_id(),
            manager_name: DEFAULT_MANAGER_NAME.to_string(),
            name: None,
            description: None,
            components: Vec::new(),
            initial_start_time: timestamp::parse(DEFAULT_INITIAL_START_TIME).unwrap_or_else(|| DateTime::<Utc>::MIN_UTC),
            end_time: None,
            epoch_length: Duration::from_secs(DEFAULT_EPOCH_LENGTH_SECONDS),
            max_epochs: Some(DEFAULT_MAX_EPOCHS),
            timeout: TimeoutPolicy::default(),
            failure_policy: FailurePolicy::FailFast,
            epoch_strategy: EpochStrategyKind::FixedStep,
            start_delay: Duration::from_secs_f64(DEFAULT_START_DELAY_SECONDS),
            topics: ControlTopics::default(),
            bus: BusConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String> + Clone) -> Result<Self, ConfigError> {
        let bus = BusConfig::from_lookup(lookup.clone())?;
        let settings = Settings { lookup };
        let defaults = Self::default();

        let max_epochs = match settings.raw("SIMULATION_MAX_EPOCHS") {
            None => defaults.max_epochs,
            Some(value) if value.eq_ignore_ascii_case("none") => None,
            Some(value) => match value.parse::<u64>() {
                Ok(0) => None,
                Ok(max) => Some(max),
                Err(error) => return Err(invalid("SIMULATION_MAX_EPOCHS", &value, error.to_string())),
            },
        };

        let epoch_length = settings.seconds("SIMULATION_EPOCH_LENGTH", DEFAULT_EPOCH_LENGTH_SECONDS as f64)?;
        if epoch_length.is_zero() {
            return Err(invalid("SIMULATION_EPOCH_LENGTH", "0", "must be positive"));
        }
        let interval = settings.seconds("SIMULATION_EPOCH_TIMER_INTERVAL", DEFAULT_EPOCH_TIMER_INTERVAL_SECONDS)?;
        if interval.is_zero() {
            return Err(invalid("SIMULATION_EPOCH_TIMER_INTERVAL", "0", "must be positive"));
        }

        let initial_start_time = settings
            .time("SIMULATION_INITIAL_START_TIME")?
            .unwrap_or(defaults.initial_start_time);
        let end_time = settings.time("SIMULATION_END_TIME")?;
        if let Some(end_time) = end_time {
            if end_time <= initial_start_time {
                return Err(invalid(
                    "SIMULATION_END_TIME",
                    &timestamp::format(&end_time),
                    "must be later than the initial start time",
                ));
            }
        }

        Ok(Self {
            simulation_id: settings.raw("SIMULATION_ID").unwrap_or(defaults.simulation_id),
            manager_name: settings.text("SIMULATION_MANAGER_NAME", DEFAULT_MANAGER_NAME),
            name: settings.raw("SIMULATION_NAME"),
            description: settings.raw("SIMULATION_DESCRIPTION"),
            components: settings.list("SIMULATION_COMPONENTS"),
            initial_start_time,
            end_time,
            epoch_length,
            max_epochs,
            timeout: TimeoutPolicy {
                interval,
                max_resends: settings.parsed("SIMULATION_MAX_EPOCH_RESENDS", 0)?,
                action: settings.parsed("SIMULATION_TIMEOUT_POLICY", TimeoutAction::Abort)?,
            },
            failure_policy: settings.parsed("SIMULATION_FAILURE_POLICY", FailurePolicy::FailFast)?,
            epoch_strategy: settings.parsed("SIMULATION_EPOCH_STRATEGY", EpochStrategyKind::FixedStep)?,
            start_delay: settings.seconds("SIMULATION_START_DELAY", DEFAULT_START_DELAY_SECONDS)?,
            topics: ControlTopics::from_settings(&settings),
            bus,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub simulation_id: String,
    pub component_name: String,
    pub topics: ControlTopics,
    /// Domain topic patterns the component consumes besides the control topics.
    pub other_topics: Vec<String>,
    pub bus: BusConfig,
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            simulation_id: DEFAULT_SIMULATION_ID.to_string(),
            component_name: DEFAULT_COMPONENT_NAME.to_string(),
            topics: ControlTopics::default(),
            other_topics: Vec::new(),
            bus: BusConfig::default(),
        }
    }
}

impl ComponentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String> + Clone) -> Result<Self, ConfigError> {
        let bus = BusConfig::from_lookup(lookup.clone())?;
        let settings = Settings { lookup };
        Ok(Self {
            simulation_id: settings.text("SIMULATION_ID", DEFAULT_SIMULATION_ID),
            component_name: settings.text("SIMULATION_COMPONENT_NAME", DEFAULT_COMPONENT_NAME),
            topics: ControlTopics::from_settings(&settings),
            other_topics: settings.list("SIMULATION_OTHER_TOPICS"),
            bus,
        })
    }
}

/// Behaviour of the reference participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DummyConfig {
    pub result_topic: String,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Probability of failing an epoch, in `[0, 1]`.
    pub error_chance: f64,
    /// Probability of attaching a warning to the ready Status, in `[0, 1]`.
    pub warning_chance: f64,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            result_topic: "Result".to_string(),
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            error_chance: 0.0,
            warning_chance: 0.0,
        }
    }
}

impl DummyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let settings = Settings { lookup };
        let defaults = Self::default();
        let min_delay = settings.seconds("MIN_SLEEP_TIME", 0.0)?;
        let max_delay = settings.seconds("MAX_SLEEP_TIME", 0.0)?.max(min_delay);
        Ok(Self {
            result_topic: settings.text("SIMULATION_RESULT_MESSAGE_TOPIC", &defaults.result_topic),
            min_delay,
            max_delay,
            error_chance: settings.chance("ERROR_CHANCE")?,
            warning_chance: settings.chance("WARNING_CHANCE")?,
        })
    }
}
