//! Topic-based publish/subscribe plumbing.
//!
//! A [`Transport`] moves raw payloads between named exchanges and topic
//! bindings. Two transports exist: [`MemoryBroker`], an in-process topic
//! exchange, and [`TcpTransport`], which talks to a [`BrokerServer`] and
//! restores its bindings after reconnecting. [`BusClient`] sits on top and
//! speaks [`Message`](crate::protocol::Message)s.

pub mod client;
pub mod memory;
pub mod server;
pub mod tcp;
pub mod topic;
pub mod wire;

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::ProtocolError;

pub use client::{BusClient, Connection, Inbound, Subscription};
pub use memory::MemoryBroker;
pub use server::BrokerServer;
pub use tcp::TcpTransport;
pub use topic::{validate_topic, TopicPattern};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },
    #[error("failed to encode message: {0}")]
    Encode(#[from] ProtocolError),
    #[error("gave up connecting to {address} after {attempts} attempts")]
    ConnectFailed { address: String, attempts: u32 },
    #[error("bus connection is closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BusError {
    pub fn invalid_topic(topic: &str, reason: impl Into<String>) -> Self {
        BusError::InvalidTopic {
            topic: topic.to_string(),
            reason: reason.into(),
        }
    }
}

pub type BusFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One payload routed to a binding, with the concrete topic it was published on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Queue of deliveries for one set of patterns, in publish order.
#[derive(Debug)]
pub struct Binding {
    pub id: u64,
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

pub trait Transport: Send + Sync {
    /// Fire-and-forget publish; no acknowledgment from consumers.
    fn publish(&self, exchange: &str, topic: &str, payload: Vec<u8>) -> BusFuture<'_, Result<(), BusError>>;

    fn bind(&self, exchange: &str, patterns: Vec<TopicPattern>) -> BusFuture<'_, Result<Binding, BusError>>;

    fn unbind(&self, exchange: &str, binding: u64) -> BusFuture<'_, ()>;

    fn close(&self) -> BusFuture<'_, ()>;
}
