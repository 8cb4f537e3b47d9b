use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use static_assertions::assert_impl_all;

use super::timestamp;
use super::ValidationError;

pub const SIM_STATE_TYPE: &str = "SimState";
pub const EPOCH_TYPE: &str = "Epoch";
pub const STATUS_TYPE: &str = "Status";

pub const TYPE_ATTRIBUTE: &str = "Type";
pub const SIMULATION_ID_ATTRIBUTE: &str = "SimulationId";
pub const TIMESTAMP_ATTRIBUTE: &str = "Timestamp";
pub const SOURCE_PROCESS_ID_ATTRIBUTE: &str = "SourceProcessId";
pub const MESSAGE_ID_ATTRIBUTE: &str = "MessageId";
pub const EPOCH_NUMBER_ATTRIBUTE: &str = "EpochNumber";
pub const LAST_UPDATED_IN_EPOCH_ATTRIBUTE: &str = "LastUpdatedInEpoch";
pub const TRIGGERING_MESSAGE_IDS_ATTRIBUTE: &str = "TriggeringMessageIds";
pub const WARNINGS_ATTRIBUTE: &str = "Warnings";
pub const ITERATION_STATUS_ATTRIBUTE: &str = "IterationStatus";

pub const ENVELOPE_ATTRIBUTES: [&str; 3] = [TYPE_ATTRIBUTE, SIMULATION_ID_ATTRIBUTE, TIMESTAMP_ATTRIBUTE];
pub const ORIGIN_ATTRIBUTES: [&str; 2] = [SOURCE_PROCESS_ID_ATTRIBUTE, MESSAGE_ID_ATTRIBUTE];
pub const RESULT_ATTRIBUTES: [&str; 2] = [EPOCH_NUMBER_ATTRIBUTE, TRIGGERING_MESSAGE_IDS_ATTRIBUTE];

/// Accepted warning prefixes. A warning is valid when it starts with one of these.
pub const WARNING_TYPES: [&str; 6] = [
    "warning.convergence",
    "warning.input",
    "warning.input-range",
    "warning.input-unreliable",
    "warning.internal",
    "warning.other",
];

pub fn is_valid_warning(warning: &str) -> bool {
    WARNING_TYPES.iter().any(|prefix| warning.starts_with(prefix))
}

fn non_empty(attribute: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::invalid(attribute, "must not be empty"));
    }
    Ok(())
}

fn nullable_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Attributes carried by every message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Type")]
    message_type: String,
    #[serde(rename = "SimulationId")]
    simulation_id: String,
    #[serde(rename = "Timestamp", with = "timestamp")]
    timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(
        message_type: impl Into<String>,
        simulation_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let envelope = Self {
            message_type: message_type.into(),
            simulation_id: simulation_id.into(),
            timestamp: timestamp.trunc_subsecs(3),
        };
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn simulation_id(&self) -> &str {
        &self.simulation_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        non_empty(TYPE_ATTRIBUTE, &self.message_type)?;
        non_empty(SIMULATION_ID_ATTRIBUTE, &self.simulation_id)
    }

    fn expect_type(&self, expected: &str) -> Result<(), ValidationError> {
        if self.message_type != expected {
            return Err(ValidationError::TypeMismatch {
                expected: expected.to_string(),
                found: self.message_type.clone(),
            });
        }
        Ok(())
    }
}

/// Sender identity of a message. Message ids are unique per source process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    #[serde(rename = "SourceProcessId")]
    source_process_id: String,
    #[serde(rename = "MessageId")]
    message_id: String,
}

impl Origin {
    pub fn new(source_process_id: impl Into<String>, message_id: impl Into<String>) -> Result<Self, ValidationError> {
        let origin = Self {
            source_process_id: source_process_id.into(),
            message_id: message_id.into(),
        };
        origin.validate()?;
        Ok(origin)
    }

    pub fn source_process_id(&self) -> &str {
        &self.source_process_id
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        non_empty(SOURCE_PROCESS_ID_ATTRIBUTE, &self.source_process_id)?;
        non_empty(MESSAGE_ID_ATTRIBUTE, &self.message_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationStatus {
    Intermediate,
    Final,
}

/// Epoch-aware attributes of result-class messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultStamp {
    #[serde(rename = "EpochNumber")]
    epoch_number: u64,
    #[serde(rename = "LastUpdatedInEpoch", default, skip_serializing_if = "Option::is_none")]
    last_updated_in_epoch: Option<u64>,
    #[serde(rename = "TriggeringMessageIds")]
    triggering_message_ids: Vec<String>,
    #[serde(
        rename = "Warnings",
        default,
        deserialize_with = "nullable_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    warnings: Vec<String>,
    #[serde(rename = "IterationStatus", default, skip_serializing_if = "Option::is_none")]
    iteration_status: Option<IterationStatus>,
}

impl ResultStamp {
    pub fn new(epoch_number: u64, triggering_message_ids: Vec<String>) -> Result<Self, ValidationError> {
        let stamp = Self {
            epoch_number,
            last_updated_in_epoch: None,
            triggering_message_ids,
            warnings: Vec::new(),
            iteration_status: None,
        };
        stamp.validate()?;
        Ok(stamp)
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Result<Self, ValidationError> {
        self.warnings = warnings;
        self.validate()?;
        Ok(self)
    }

    pub fn with_last_updated_in_epoch(mut self, epoch: u64) -> Self {
        self.last_updated_in_epoch = Some(epoch);
        self
    }

    pub fn with_iteration_status(mut self, status: IterationStatus) -> Self {
        self.iteration_status = Some(status);
        self
    }

    pub fn epoch_number(&self) -> u64 {
        self.epoch_number
    }

    pub fn last_updated_in_epoch(&self) -> Option<u64> {
        self.last_updated_in_epoch
    }

    pub fn triggering_message_ids(&self) -> &[String] {
        &self.triggering_message_ids
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn iteration_status(&self) -> Option<IterationStatus> {
        self.iteration_status
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        if self.triggering_message_ids.is_empty() {
            return Err(ValidationError::invalid(TRIGGERING_MESSAGE_IDS_ATTRIBUTE, "must contain at least one id"));
        }
        if self.triggering_message_ids.iter().any(|id| id.trim().is_empty()) {
            return Err(ValidationError::invalid(TRIGGERING_MESSAGE_IDS_ATTRIBUTE, "ids must not be empty"));
        }
        if let Some(warning) = self.warnings.iter().find(|warning| !is_valid_warning(warning)) {
            return Err(ValidationError::invalid(
                WARNINGS_ATTRIBUTE,
                format!("unknown warning type '{}'", warning),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimulationState {
    Running,
    Stopped,
}

/// Simulation lifecycle announcement published by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimStateMessage {
    #[serde(flatten)]
    envelope: Envelope,
    #[serde(flatten)]
    origin: Origin,
    #[serde(rename = "SimulationState")]
    simulation_state: SimulationState,
    #[serde(rename = "Name", default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(rename = "Description", default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

impl SimStateMessage {
    pub fn new(
        envelope: Envelope,
        origin: Origin,
        simulation_state: SimulationState,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<Self, ValidationError> {
        let message = Self { envelope, origin, simulation_state, name, description };
        message.validate()?;
        Ok(message)
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn simulation_state(&self) -> SimulationState {
        self.simulation_state
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        self.envelope.validate()?;
        self.envelope.expect_type(SIM_STATE_TYPE)?;
        self.origin.validate()
    }
}

/// Opens one epoch of simulated time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMessage {
    #[serde(flatten)]
    envelope: Envelope,
    #[serde(flatten)]
    origin: Origin,
    #[serde(flatten)]
    stamp: ResultStamp,
    #[serde(rename = "StartTime", with = "timestamp")]
    start_time: DateTime<Utc>,
    #[serde(rename = "EndTime", with = "timestamp")]
    end_time: DateTime<Utc>,
}

impl EpochMessage {
    pub fn new(
        envelope: Envelope,
        origin: Origin,
        stamp: ResultStamp,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let message = Self { envelope, origin, stamp, start_time, end_time };
        message.validate()?;
        Ok(message)
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn stamp(&self) -> &ResultStamp {
        &self.stamp
    }

    pub fn epoch_number(&self) -> u64 {
        self.stamp.epoch_number
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        self.envelope.validate()?;
        self.envelope.expect_type(EPOCH_TYPE)?;
        self.origin.validate()?;
        self.stamp.validate()?;
        if self.start_time >= self.end_time {
            return Err(ValidationError::invalid("EndTime", "must be later than StartTime"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusValue {
    Ready,
    Error,
}

/// A participant's readiness or error report for one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    #[serde(flatten)]
    envelope: Envelope,
    #[serde(flatten)]
    origin: Origin,
    #[serde(flatten)]
    stamp: ResultStamp,
    #[serde(rename = "Value")]
    value: StatusValue,
    #[serde(rename = "Description", default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(
        rename = "NextEventTime",
        default,
        with = "timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    next_event_time: Option<DateTime<Utc>>,
}

impl StatusMessage {
    pub fn new(
        envelope: Envelope,
        origin: Origin,
        stamp: ResultStamp,
        value: StatusValue,
        description: Option<String>,
    ) -> Result<Self, ValidationError> {
        let message = Self {
            envelope,
            origin,
            stamp,
            value,
            description,
            next_event_time: None,
        };
        message.validate()?;
        Ok(message)
    }

    /// Attaches the simulated time at which the sender next needs an epoch boundary.
    pub fn with_next_event_time(mut self, next_event_time: DateTime<Utc>) -> Self {
        self.next_event_time = Some(next_event_time);
        self
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn stamp(&self) -> &ResultStamp {
        &self.stamp
    }

    pub fn source_process_id(&self) -> &str {
        &self.origin.source_process_id
    }

    pub fn message_id(&self) -> &str {
        &self.origin.message_id
    }

    pub fn epoch_number(&self) -> u64 {
        self.stamp.epoch_number
    }

    pub fn value(&self) -> StatusValue {
        self.value
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn next_event_time(&self) -> Option<DateTime<Utc>> {
        self.next_event_time
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        self.envelope.validate()?;
        self.envelope.expect_type(STATUS_TYPE)?;
        self.origin.validate()?;
        self.stamp.validate()
    }
}

/// Any message type outside the control set: the envelope plus its remaining attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralMessage {
    #[serde(flatten)]
    envelope: Envelope,
    #[serde(flatten)]
    attributes: Map<String, Value>,
}

impl GeneralMessage {
    pub fn new(envelope: Envelope, mut attributes: Map<String, Value>) -> Self {
        for name in ENVELOPE_ATTRIBUTES {
            attributes.remove(name);
        }
        Self { envelope, attributes }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn source_process_id(&self) -> Option<&str> {
        self.attributes.get(SOURCE_PROCESS_ID_ATTRIBUTE).and_then(Value::as_str)
    }

    pub fn message_id(&self) -> Option<&str> {
        self.attributes.get(MESSAGE_ID_ATTRIBUTE).and_then(Value::as_str)
    }

    pub fn epoch_number(&self) -> Option<u64> {
        self.attributes.get(EPOCH_NUMBER_ATTRIBUTE).and_then(Value::as_u64)
    }

    pub fn triggering_message_ids(&self) -> Vec<&str> {
        self.attributes
            .get(TRIGGERING_MESSAGE_IDS_ATTRIBUTE)
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

/// Every message that can travel over the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    SimState(SimStateMessage),
    Epoch(EpochMessage),
    Status(StatusMessage),
    General(GeneralMessage),
}

assert_impl_all!(Message: Send, Sync, Clone);

impl Message {
    pub fn envelope(&self) -> &Envelope {
        match self {
            Message::SimState(message) => &message.envelope,
            Message::Epoch(message) => &message.envelope,
            Message::Status(message) => &message.envelope,
            Message::General(message) => &message.envelope,
        }
    }

    pub fn message_type(&self) -> &str {
        self.envelope().message_type()
    }

    pub fn simulation_id(&self) -> &str {
        self.envelope().simulation_id()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.envelope().timestamp()
    }

    pub fn source_process_id(&self) -> Option<&str> {
        match self {
            Message::SimState(message) => Some(message.origin.source_process_id()),
            Message::Epoch(message) => Some(message.origin.source_process_id()),
            Message::Status(message) => Some(message.origin.source_process_id()),
            Message::General(message) => message.source_process_id(),
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        match self {
            Message::SimState(message) => Some(message.origin.message_id()),
            Message::Epoch(message) => Some(message.origin.message_id()),
            Message::Status(message) => Some(message.origin.message_id()),
            Message::General(message) => message.message_id(),
        }
    }

    pub fn epoch_number(&self) -> Option<u64> {
        match self {
            Message::SimState(_) => None,
            Message::Epoch(message) => Some(message.epoch_number()),
            Message::Status(message) => Some(message.epoch_number()),
            Message::General(message) => message.epoch_number(),
        }
    }
}

impl From<SimStateMessage> for Message {
    fn from(message: SimStateMessage) -> Self {
        Message::SimState(message)
    }
}

impl From<EpochMessage> for Message {
    fn from(message: EpochMessage) -> Self {
        Message::Epoch(message)
    }
}

impl From<StatusMessage> for Message {
    fn from(message: StatusMessage) -> Self {
        Message::Status(message)
    }
}

impl From<GeneralMessage> for Message {
    fn from(message: GeneralMessage) -> Self {
        Message::General(message)
    }
}
