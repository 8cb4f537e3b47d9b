use std::borrow::Cow;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::message::*;
use super::{timestamp, ProtocolError, ValidationError, MAX_MESSAGE_SIZE};

/// Parses and validates one JSON object into a [`Message`].
pub type DecodeFn = fn(Map<String, Value>) -> Result<Message, ValidationError>;

/// Per-attribute validator used by [`MessageSchema`].
#[derive(Debug, Clone, Copy)]
pub enum AttributeCheck {
    Any,
    Text,
    NonEmptyText,
    Integer,
    NonNegativeInteger,
    Number,
    Boolean,
    Timestamp,
    TextList,
    NonEmptyTextList,
    Object,
    Custom(fn(&Value) -> Result<(), String>),
}

impl AttributeCheck {
    pub fn check(&self, value: &Value) -> Result<(), String> {
        let expect = |ok: bool, what: &str| if ok { Ok(()) } else { Err(format!("expected {}", what)) };
        match self {
            AttributeCheck::Any => Ok(()),
            AttributeCheck::Text => expect(value.is_string(), "a string"),
            AttributeCheck::NonEmptyText => match value.as_str() {
                Some(text) if !text.trim().is_empty() => Ok(()),
                Some(_) => Err("must not be empty".to_string()),
                None => Err("expected a string".to_string()),
            },
            AttributeCheck::Integer => expect(value.is_i64() || value.is_u64(), "an integer"),
            AttributeCheck::NonNegativeInteger => expect(value.is_u64(), "a non-negative integer"),
            AttributeCheck::Number => expect(value.is_number(), "a number"),
            AttributeCheck::Boolean => expect(value.is_boolean(), "a boolean"),
            AttributeCheck::Timestamp => expect(
                value.as_str().and_then(timestamp::parse).is_some(),
                "an ISO-8601 timestamp",
            ),
            AttributeCheck::TextList => expect(
                value
                    .as_array()
                    .map_or(false, |items| items.iter().all(Value::is_string)),
                "a list of strings",
            ),
            AttributeCheck::NonEmptyTextList => expect(
                value.as_array().map_or(false, |items| {
                    !items.is_empty()
                        && items
                            .iter()
                            .all(|item| item.as_str().map_or(false, |text| !text.trim().is_empty()))
                }),
                "a non-empty list of non-empty strings",
            ),
            AttributeCheck::Object => expect(value.is_object(), "an object"),
            AttributeCheck::Custom(check) => check(value),
        }
    }
}

fn check_warnings(value: &Value) -> Result<(), String> {
    let items = value.as_array().ok_or_else(|| "expected a list of strings".to_string())?;
    for item in items {
        match item.as_str() {
            Some(warning) if is_valid_warning(warning) => {}
            Some(warning) => return Err(format!("unknown warning type '{}'", warning)),
            None => return Err("expected a list of strings".to_string()),
        }
    }
    Ok(())
}

fn check_iteration_status(value: &Value) -> Result<(), String> {
    match value.as_str() {
        Some("intermediate") | Some("final") => Ok(()),
        _ => Err("expected 'intermediate' or 'final'".to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct AttributeSpec {
    pub name: String,
    pub check: AttributeCheck,
}

/// Attribute contract of a domain message type.
#[derive(Debug, Clone)]
pub struct MessageSchema {
    message_type: String,
    required: Vec<AttributeSpec>,
    optional: Vec<AttributeSpec>,
}

impl MessageSchema {
    /// Schema with only the envelope attributes.
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            required: Vec::new(),
            optional: Vec::new(),
        }
        .require(TYPE_ATTRIBUTE, AttributeCheck::NonEmptyText)
        .require(SIMULATION_ID_ATTRIBUTE, AttributeCheck::NonEmptyText)
        .require(TIMESTAMP_ATTRIBUTE, AttributeCheck::Timestamp)
    }

    /// Schema for an epoch-aware result message.
    pub fn result(message_type: impl Into<String>) -> Self {
        Self::new(message_type)
            .require(SOURCE_PROCESS_ID_ATTRIBUTE, AttributeCheck::NonEmptyText)
            .require(MESSAGE_ID_ATTRIBUTE, AttributeCheck::NonEmptyText)
            .require(EPOCH_NUMBER_ATTRIBUTE, AttributeCheck::NonNegativeInteger)
            .require(TRIGGERING_MESSAGE_IDS_ATTRIBUTE, AttributeCheck::NonEmptyTextList)
            .optional(LAST_UPDATED_IN_EPOCH_ATTRIBUTE, AttributeCheck::NonNegativeInteger)
            .optional(WARNINGS_ATTRIBUTE, AttributeCheck::Custom(check_warnings))
            .optional(ITERATION_STATUS_ATTRIBUTE, AttributeCheck::Custom(check_iteration_status))
    }

    pub fn require(mut self, name: impl Into<String>, check: AttributeCheck) -> Self {
        self.required.push(AttributeSpec { name: name.into(), check });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, check: AttributeCheck) -> Self {
        self.optional.push(AttributeSpec { name: name.into(), check });
        self
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn validate(&self, object: &Map<String, Value>) -> Result<(), ValidationError> {
        for spec in &self.required {
            match object.get(&spec.name) {
                None | Some(Value::Null) => return Err(ValidationError::MissingAttribute(spec.name.clone())),
                Some(value) => spec
                    .check
                    .check(value)
                    .map_err(|reason| ValidationError::invalid(spec.name.as_str(), reason))?,
            }
        }
        for spec in &self.optional {
            if let Some(value) = object.get(&spec.name).filter(|value| !value.is_null()) {
                spec.check
                    .check(value)
                    .map_err(|reason| ValidationError::invalid(spec.name.as_str(), reason))?;
            }
        }
        Ok(())
    }
}

/// A payload that could not be decoded, kept verbatim for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidMessage {
    topic: String,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
    reason: String,
    #[serde(with = "timestamp")]
    received_at: DateTime<Utc>,
}

impl InvalidMessage {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>, reason: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            reason: reason.into(),
            received_at: timestamp::now(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}

/// Result of decoding one bus payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(Message),
    Invalid(InvalidMessage),
}

impl Decoded {
    pub fn is_valid(&self) -> bool {
        matches!(self, Decoded::Message(_))
    }

    pub fn message(&self) -> Option<&Message> {
        match self {
            Decoded::Message(message) => Some(message),
            Decoded::Invalid(_) => None,
        }
    }

    pub fn into_message(self) -> Option<Message> {
        match self {
            Decoded::Message(message) => Some(message),
            Decoded::Invalid(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
enum Decoder {
    Builtin(DecodeFn),
    Schema(MessageSchema),
}

/// Maps the `Type` discriminator to a parse and validate step.
#[derive(Debug, Clone)]
pub struct MessageRegistry {
    decoders: HashMap<String, Decoder>,
    max_message_size: usize,
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRegistry {
    /// Registry with the control message types.
    pub fn new() -> Self {
        let mut decoders = HashMap::new();
        decoders.insert(SIM_STATE_TYPE.to_string(), Decoder::Builtin(decode_sim_state as DecodeFn));
        decoders.insert(EPOCH_TYPE.to_string(), Decoder::Builtin(decode_epoch as DecodeFn));
        decoders.insert(STATUS_TYPE.to_string(), Decoder::Builtin(decode_status as DecodeFn));
        Self {
            decoders,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    pub fn register(&mut self, message_type: impl Into<String>, decode: DecodeFn) -> Result<(), ProtocolError> {
        self.insert(message_type.into(), Decoder::Builtin(decode))
    }

    pub fn register_schema(&mut self, schema: MessageSchema) -> Result<(), ProtocolError> {
        self.insert(schema.message_type.clone(), Decoder::Schema(schema))
    }

    fn insert(&mut self, message_type: String, decoder: Decoder) -> Result<(), ProtocolError> {
        if self.decoders.contains_key(&message_type) {
            return Err(ProtocolError::DuplicateType(message_type));
        }
        self.decoders.insert(message_type, decoder);
        Ok(())
    }

    pub fn is_registered(&self, message_type: &str) -> bool {
        self.decoders.contains_key(message_type)
    }

    pub fn message_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Parses a payload, reporting why it was rejected.
    pub fn parse(&self, payload: &[u8]) -> Result<Message, ValidationError> {
        if payload.len() > self.max_message_size {
            return Err(ValidationError::TooLarge {
                size: payload.len(),
                limit: self.max_message_size,
            });
        }
        let value: Value =
            serde_json::from_slice(payload).map_err(|error| ValidationError::Malformed(error.to_string()))?;
        let Value::Object(object) = value else {
            return Err(ValidationError::NotAnObject);
        };
        let message_type = match object.get(TYPE_ATTRIBUTE) {
            Some(Value::String(message_type)) => message_type.clone(),
            Some(_) => return Err(ValidationError::invalid(TYPE_ATTRIBUTE, "expected a string")),
            None => return Err(ValidationError::MissingAttribute(TYPE_ATTRIBUTE.to_string())),
        };

        match self.decoders.get(&message_type) {
            Some(Decoder::Builtin(decode)) => decode(object),
            Some(Decoder::Schema(schema)) => {
                schema.validate(&object)?;
                decode_general(object)
            }
            None => {
                debug!("No decoder for message type '{}', using the plain envelope", message_type);
                decode_general(object)
            }
        }
    }

    /// Decodes a payload received on `topic`. Never fails: bad payloads become [`Decoded::Invalid`].
    pub fn decode(&self, payload: &[u8], topic: &str) -> Decoded {
        match self.parse(payload) {
            Ok(message) => Decoded::Message(message),
            Err(error) => Decoded::Invalid(InvalidMessage::new(topic, payload.to_vec(), error.to_string())),
        }
    }

    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, ProtocolError> {
        let bytes = serde_json::to_vec(message)?;
        if bytes.len() > self.max_message_size {
            return Err(ValidationError::TooLarge {
                size: bytes.len(),
                limit: self.max_message_size,
            }
            .into());
        }
        Ok(bytes)
    }
}

fn require_present(object: &Map<String, Value>, names: &[&str]) -> Result<(), ValidationError> {
    for name in names {
        if object.get(*name).map_or(true, Value::is_null) {
            return Err(ValidationError::MissingAttribute(name.to_string()));
        }
    }
    Ok(())
}

fn from_object<T: DeserializeOwned>(object: Map<String, Value>) -> Result<T, ValidationError> {
    serde_json::from_value(Value::Object(object)).map_err(|error| ValidationError::Schema(error.to_string()))
}

fn decode_sim_state(object: Map<String, Value>) -> Result<Message, ValidationError> {
    require_present(&object, &ENVELOPE_ATTRIBUTES)?;
    require_present(&object, &ORIGIN_ATTRIBUTES)?;
    require_present(&object, &["SimulationState"])?;
    let message: SimStateMessage = from_object(object)?;
    message.validate()?;
    Ok(message.into())
}

fn decode_epoch(object: Map<String, Value>) -> Result<Message, ValidationError> {
    require_present(&object, &ENVELOPE_ATTRIBUTES)?;
    require_present(&object, &ORIGIN_ATTRIBUTES)?;
    require_present(&object, &RESULT_ATTRIBUTES)?;
    require_present(&object, &["StartTime", "EndTime"])?;
    let message: EpochMessage = from_object(object)?;
    message.validate()?;
    Ok(message.into())
}

fn decode_status(object: Map<String, Value>) -> Result<Message, ValidationError> {
    require_present(&object, &ENVELOPE_ATTRIBUTES)?;
    require_present(&object, &ORIGIN_ATTRIBUTES)?;
    require_present(&object, &RESULT_ATTRIBUTES)?;
    require_present(&object, &["Value"])?;
    let message: StatusMessage = from_object(object)?;
    message.validate()?;
    Ok(message.into())
}

fn decode_general(object: Map<String, Value>) -> Result<Message, ValidationError> {
    require_present(&object, &ENVELOPE_ATTRIBUTES)?;
    let message: GeneralMessage = from_object(object)?;
    message.envelope().validate()?;
    Ok(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bytes(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_unknown_type_falls_back_to_envelope() {
        let registry = MessageRegistry::new();
        let payload = bytes(json!({
            "Type": "ResourceState",
            "SimulationId": "2020-01-01T00:00:00.000Z",
            "Timestamp": "2020-01-01T00:00:01.000Z",
            "RealPower": 12.5
        }));

        let message = registry.parse(&payload).unwrap();
        assert_eq!(message.message_type(), "ResourceState");
        match message {
            Message::General(general) => assert_eq!(general.attribute("RealPower"), Some(&json!(12.5))),
            other => panic!("expected a general message, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_without_envelope_is_invalid() {
        let registry = MessageRegistry::new();
        let payload = bytes(json!({ "Type": "ResourceState", "Timestamp": "2020-01-01T00:00:01.000Z" }));

        match registry.decode(&payload, "Resource.A") {
            Decoded::Invalid(invalid) => {
                assert_eq!(invalid.topic(), "Resource.A");
                assert!(invalid.reason().contains("SimulationId"));
            }
            Decoded::Message(message) => panic!("unexpected message {:?}", message),
        }
    }

    #[test]
    fn test_schema_rejects_missing_and_bad_attributes() {
        let mut registry = MessageRegistry::new();
        registry
            .register_schema(MessageSchema::result("ResourceState").require("RealPower", AttributeCheck::Number))
            .unwrap();

        let mut object = json!({
            "Type": "ResourceState",
            "SimulationId": "sim",
            "Timestamp": "2020-01-01T00:00:01.000Z",
            "SourceProcessId": "battery",
            "MessageId": "battery-3",
            "EpochNumber": 2,
            "TriggeringMessageIds": ["manager-4"],
            "Warnings": ["warning.input-range"]
        });
        assert_eq!(
            registry.parse(&bytes(object.clone())),
            Err(ValidationError::MissingAttribute("RealPower".to_string()))
        );

        object["RealPower"] = json!("high");
        assert!(matches!(
            registry.parse(&bytes(object.clone())),
            Err(ValidationError::InvalidAttribute { .. })
        ));

        object["RealPower"] = json!(4.0);
        object["Warnings"] = json!(["bogus"]);
        assert!(registry.parse(&bytes(object.clone())).is_err());

        object["Warnings"] = json!(["warning.other"]);
        let message = registry.parse(&bytes(object)).unwrap();
        assert_eq!(message.epoch_number(), Some(2));
        assert_eq!(message.message_id(), Some("battery-3"));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = MessageRegistry::new();
        let result = registry.register_schema(MessageSchema::new(STATUS_TYPE));
        assert!(matches!(result, Err(ProtocolError::DuplicateType(_))));
        assert_eq!(registry.message_types(), vec!["Epoch", "SimState", "Status"]);
    }

    #[test]
    fn test_non_object_and_garbage_payloads() {
        let registry = MessageRegistry::new();
        assert_eq!(registry.parse(b"[1, 2]"), Err(ValidationError::NotAnObject));
        assert!(matches!(registry.parse(b"{not json"), Err(ValidationError::Malformed(_))));
        assert!(!registry.decode(&[0xff, 0xfe], "SimState").is_valid());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let registry = MessageRegistry::new();
        let payload = vec![b' '; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(registry.parse(&payload), Err(ValidationError::TooLarge { .. })));
    }
}
