//! Message model, registry/codec and id generation for the simulation bus.
//!
//! Every payload is a JSON object with PascalCase attribute names. The
//! [`MessageRegistry`] maps the `Type` discriminator to a decoder; payloads
//! that fail validation become [`Decoded::Invalid`] instead of an error so a
//! consumer never crashes on a bad message.

pub mod generator;
pub mod message;
pub mod registry;
pub mod timestamp;

use thiserror::Error;

pub use generator::MessageGenerator;
pub use message::{
    Envelope, EpochMessage, GeneralMessage, IterationStatus, Message, Origin, ResultStamp, SimStateMessage,
    SimulationState, StatusMessage, StatusValue, EPOCH_TYPE, SIM_STATE_TYPE, STATUS_TYPE, WARNING_TYPES,
};
pub use registry::{AttributeCheck, Decoded, InvalidMessage, MessageRegistry, MessageSchema};

/// Largest payload accepted by `decode` or produced by `encode`.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

static_assertions::const_assert!(MAX_MESSAGE_SIZE >= 4096);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("payload is not valid JSON: {0}")]
    Malformed(String),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("missing required attribute '{0}'")]
    MissingAttribute(String),
    #[error("invalid value for attribute '{attribute}': {reason}")]
    InvalidAttribute { attribute: String, reason: String },
    #[error("expected message type '{expected}', found '{found}'")]
    TypeMismatch { expected: String, found: String },
    #[error("payload does not match the message schema: {0}")]
    Schema(String),
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
}

impl ValidationError {
    pub fn invalid(attribute: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationError::InvalidAttribute {
            attribute: attribute.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("message type '{0}' is already registered")]
    DuplicateType(String),
}
