//! Catch-all message log.
//!
//! [`MessageLog`] keeps every delivery seen on an exchange, valid or invalid,
//! keyed by simulation id, epoch number and timestamp when the payload carries
//! them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use crate::bus::{BusClient, BusError, Inbound};
use crate::protocol::message::{EPOCH_NUMBER_ATTRIBUTE, SIMULATION_ID_ATTRIBUTE, TIMESTAMP_ATTRIBUTE};
use crate::protocol::{timestamp, Decoded, Message};

/// Pattern matching every topic.
pub const ALL_TOPICS: &str = "#";

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub topic: String,
    pub simulation_id: Option<String>,
    pub epoch_number: Option<u64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    pub decoded: Decoded,
}

impl LogEntry {
    pub fn from_inbound(inbound: Inbound) -> Self {
        let received_at = timestamp::now();
        let (simulation_id, epoch_number, sent_at) = match &inbound.decoded {
            Decoded::Message(message) => (
                Some(message.simulation_id().to_string()),
                message.epoch_number(),
                Some(message.timestamp()),
            ),
            Decoded::Invalid(invalid) => keys_from_payload(invalid.payload()),
        };
        Self {
            topic: inbound.topic,
            simulation_id,
            epoch_number,
            timestamp: sent_at,
            received_at,
            decoded: inbound.decoded,
        }
    }

    pub fn message(&self) -> Option<&Message> {
        self.decoded.message()
    }

    pub fn is_valid(&self) -> bool {
        self.decoded.is_valid()
    }
}

/// Best-effort keys of a payload that failed validation.
fn keys_from_payload(payload: &[u8]) -> (Option<String>, Option<u64>, Option<DateTime<Utc>>) {
    let Ok(Value::Object(object)) = serde_json::from_slice::<Value>(payload) else {
        return (None, None, None);
    };
    (
        object.get(SIMULATION_ID_ATTRIBUTE).and_then(Value::as_str).map(str::to_string),
        object.get(EPOCH_NUMBER_ATTRIBUTE).and_then(Value::as_u64),
        object.get(TIMESTAMP_ATTRIBUTE).and_then(Value::as_str).and_then(timestamp::parse),
    )
}

/// Shared, append-only log. Clones see the same entries.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records everything `client` receives on `patterns` until the client closes.
    pub async fn attach(&self, client: &BusClient, patterns: &[&str]) -> Result<(), BusError> {
        let log = self.clone();
        client
            .listen(patterns, move |inbound| {
                log.record(inbound);
                std::future::ready(())
            })
            .await
    }

    pub fn record(&self, inbound: Inbound) {
        self.entries.lock().push(LogEntry::from_inbound(inbound));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    pub fn of_type(&self, message_type: &str) -> Vec<LogEntry> {
        self.filtered(|entry| entry.message().map_or(false, |message| message.message_type() == message_type))
    }

    pub fn for_epoch(&self, epoch_number: u64) -> Vec<LogEntry> {
        self.filtered(|entry| entry.epoch_number == Some(epoch_number))
    }

    pub fn for_simulation(&self, simulation_id: &str) -> Vec<LogEntry> {
        self.filtered(|entry| entry.simulation_id.as_deref() == Some(simulation_id))
    }

    pub fn invalid(&self) -> Vec<LogEntry> {
        self.filtered(|entry| !entry.is_valid())
    }

    fn filtered(&self, predicate: impl Fn(&LogEntry) -> bool) -> Vec<LogEntry> {
        self.entries.lock().iter().filter(|entry| predicate(entry)).cloned().collect()
    }
}
