use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::message::*;
use super::{timestamp, ValidationError};

/// Builds outgoing messages for one sender.
///
/// Message ids have the form `<source>-<n>` with `n` counting up from 1, which
/// keeps them unique per source process for the lifetime of the generator.
#[derive(Debug, Clone)]
pub struct MessageGenerator {
    simulation_id: String,
    source_process_id: String,
    message_counter: u64,
}

impl MessageGenerator {
    pub fn new(simulation_id: impl Into<String>, source_process_id: impl Into<String>) -> Self {
        Self {
            simulation_id: simulation_id.into(),
            source_process_id: source_process_id.into(),
            message_counter: 0,
        }
    }

    pub fn simulation_id(&self) -> &str {
        &self.simulation_id
    }

    pub fn source_process_id(&self) -> &str {
        &self.source_process_id
    }

    pub fn next_message_id(&mut self) -> String {
        self.message_counter += 1;
        format!("{}-{}", self.source_process_id, self.message_counter)
    }

    pub fn envelope(&self, message_type: &str) -> Result<Envelope, ValidationError> {
        Envelope::new(message_type, self.simulation_id.as_str(), timestamp::now())
    }

    fn origin(&mut self) -> Result<Origin, ValidationError> {
        let message_id = self.next_message_id();
        Origin::new(self.source_process_id.as_str(), message_id)
    }

    pub fn sim_state(
        &mut self,
        state: SimulationState,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<SimStateMessage, ValidationError> {
        let envelope = self.envelope(SIM_STATE_TYPE)?;
        SimStateMessage::new(envelope, self.origin()?, state, name, description)
    }

    pub fn epoch(
        &mut self,
        epoch_number: u64,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        triggering_message_ids: Vec<String>,
    ) -> Result<EpochMessage, ValidationError> {
        let envelope = self.envelope(EPOCH_TYPE)?;
        let stamp = ResultStamp::new(epoch_number, triggering_message_ids)?;
        EpochMessage::new(envelope, self.origin()?, stamp, start_time, end_time)
    }

    pub fn status_ready(
        &mut self,
        epoch_number: u64,
        triggering_message_ids: Vec<String>,
        warnings: Vec<String>,
    ) -> Result<StatusMessage, ValidationError> {
        let envelope = self.envelope(STATUS_TYPE)?;
        let stamp = ResultStamp::new(epoch_number, triggering_message_ids)?.with_warnings(warnings)?;
        StatusMessage::new(envelope, self.origin()?, stamp, StatusValue::Ready, None)
    }

    pub fn status_error(
        &mut self,
        epoch_number: u64,
        triggering_message_ids: Vec<String>,
        description: impl Into<String>,
    ) -> Result<StatusMessage, ValidationError> {
        let envelope = self.envelope(STATUS_TYPE)?;
        let stamp = ResultStamp::new(epoch_number, triggering_message_ids)?;
        StatusMessage::new(envelope, self.origin()?, stamp, StatusValue::Error, Some(description.into()))
    }

    /// Domain result message stamped with sender, message id and epoch attributes.
    pub fn result(
        &mut self,
        message_type: &str,
        epoch_number: u64,
        triggering_message_ids: Vec<String>,
        attributes: Map<String, Value>,
    ) -> Result<GeneralMessage, ValidationError> {
        let envelope = self.envelope(message_type)?;
        let stamp = ResultStamp::new(epoch_number, triggering_message_ids)?;
        let origin = self.origin()?;

        let mut all = attributes;
        if let Value::Object(fields) = serde_json::to_value(&origin).map_err(|e| ValidationError::Schema(e.to_string()))? {
            all.extend(fields);
        }
        if let Value::Object(fields) = serde_json::to_value(&stamp).map_err(|e| ValidationError::Schema(e.to_string()))? {
            all.extend(fields);
        }
        Ok(GeneralMessage::new(envelope, all))
    }
}
