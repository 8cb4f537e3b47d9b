//! Reference participant for exercising a simulation without domain logic.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::component::{ComponentContext, EpochProgress, SimulationComponent};
use crate::config::DummyConfig;

pub const RESULT_MESSAGE_TYPE: &str = "Result";
const DELAY_TIMER: &str = "processing-delay";

/// Waits a random time each epoch, then publishes a `Result` message with a
/// random-walk `Value`. May fail or attach a warning at random.
#[derive(Debug)]
pub struct DummyComponent {
    config: DummyConfig,
    rng: StdRng,
    value: f64,
    delay_armed: bool,
    delay_elapsed: bool,
}

impl DummyComponent {
    pub fn new(config: DummyConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic variant for tests.
    pub fn with_seed(config: DummyConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: DummyConfig, rng: StdRng) -> Self {
        Self {
            config,
            rng,
            value: 0.0,
            delay_armed: false,
            delay_elapsed: false,
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    fn random_delay(&mut self) -> Duration {
        let (min, max) = (self.config.min_delay, self.config.max_delay);
        if max <= min {
            return min;
        }
        Duration::from_secs_f64(self.rng.gen_range(min.as_secs_f64()..=max.as_secs_f64()))
    }
}

impl SimulationComponent for DummyComponent {
    fn clear_epoch_variables(&mut self) {
        self.delay_armed = false;
        self.delay_elapsed = false;
    }

    fn process_epoch(&mut self, ctx: &mut ComponentContext<'_>) -> Result<EpochProgress, String> {
        if !self.delay_armed {
            self.delay_armed = true;
            let delay = self.random_delay();
            if !delay.is_zero() {
                debug!("Epoch {} sleeping for {:?}", ctx.epoch_number(), delay);
                ctx.schedule_timer(DELAY_TIMER, delay);
                return Ok(EpochProgress::MoreWork);
            }
            self.delay_elapsed = true;
        }
        if !self.delay_elapsed {
            return Ok(EpochProgress::MoreWork);
        }

        if self.rng.gen_bool(self.config.error_chance) {
            return Err(format!("random failure in epoch {}", ctx.epoch_number()));
        }
        if self.rng.gen_bool(self.config.warning_chance) {
            ctx.add_status_warning("warning.internal")
                .map_err(|error| error.to_string())?;
        }

        self.value += self.rng.gen_range(-1.0..=1.0);
        let mut attributes = Map::new();
        attributes.insert("Value".to_string(), json!(self.value));
        ctx.publish_result(self.config.result_topic.clone(), RESULT_MESSAGE_TYPE, attributes)
            .map_err(|error| error.to_string())?;
        Ok(EpochProgress::Completed)
    }

    fn on_timer(&mut self, key: &str, _ctx: &mut ComponentContext<'_>) {
        if key == DELAY_TIMER {
            self.delay_elapsed = true;
        }
    }
}

/// Reads the `Value` attribute of a dummy `Result` message.
pub fn result_value(attributes: &Map<String, Value>) -> Option<f64> {
    attributes.get("Value").and_then(Value::as_f64)
}
