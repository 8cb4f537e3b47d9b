use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::topic::{validate_topic, TopicPattern};
use super::{Binding, BusError, BusFuture, Delivery, Transport};

struct BoundQueue {
    id: u64,
    patterns: Vec<TopicPattern>,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct ExchangeTable {
    exchanges: HashMap<String, Vec<BoundQueue>>,
    next_binding: u64,
    published: u64,
    delivered: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    pub delivered: u64,
    pub bindings: usize,
}

/// In-process topic exchange.
///
/// Each exchange name is an isolated namespace. Every binding owns an
/// unbounded queue, so publishing never waits on a slow consumer and each
/// binding sees payloads in publish order. Clones share the same exchanges.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    table: Arc<Mutex<ExchangeTable>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes a payload to every matching binding and returns how many received it.
    pub fn publish_now(&self, exchange: &str, topic: &str, payload: Vec<u8>) -> Result<usize, BusError> {
        validate_topic(topic)?;
        let mut table = self.table.lock();
        table.published += 1;

        let mut delivered = 0;
        if let Some(queues) = table.exchanges.get_mut(exchange) {
            queues.retain(|queue| !queue.sender.is_closed());
            for queue in queues.iter().filter(|queue| queue.patterns.iter().any(|p| p.matches(topic))) {
                let delivery = Delivery {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                };
                if queue.sender.send(delivery).is_ok() {
                    delivered += 1;
                }
            }
        }
        table.delivered += delivered as u64;
        trace!("Published {} bytes on {}/{} to {} bindings", payload.len(), exchange, topic, delivered);
        Ok(delivered)
    }

    pub fn bind_now(&self, exchange: &str, patterns: Vec<TopicPattern>) -> Binding {
        let (sender, deliveries) = mpsc::unbounded_channel();
        let mut table = self.table.lock();
        table.next_binding += 1;
        let id = table.next_binding;
        debug!(
            "Binding {} on exchange '{}' for [{}]",
            id,
            exchange,
            patterns.iter().map(TopicPattern::as_str).collect::<Vec<_>>().join(", ")
        );
        table
            .exchanges
            .entry(exchange.to_string())
            .or_default()
            .push(BoundQueue { id, patterns, sender });
        Binding { id, deliveries }
    }

    pub fn unbind_now(&self, exchange: &str, binding: u64) -> bool {
        let mut table = self.table.lock();
        let Some(queues) = table.exchanges.get_mut(exchange) else {
            return false;
        };
        let before = queues.len();
        queues.retain(|queue| queue.id != binding);
        before != queues.len()
    }

    pub fn stats(&self) -> BrokerStats {
        let table = self.table.lock();
        BrokerStats {
            published: table.published,
            delivered: table.delivered,
            bindings: table
                .exchanges
                .values()
                .map(|queues| queues.iter().filter(|queue| !queue.sender.is_closed()).count())
                .sum(),
        }
    }
}

impl Transport for MemoryBroker {
    fn publish(&self, exchange: &str, topic: &str, payload: Vec<u8>) -> BusFuture<'_, Result<(), BusError>> {
        let result = self.publish_now(exchange, topic, payload).map(|_| ());
        Box::pin(std::future::ready(result))
    }

    fn bind(&self, exchange: &str, patterns: Vec<TopicPattern>) -> BusFuture<'_, Result<Binding, BusError>> {
        let binding = self.bind_now(exchange, patterns);
        Box::pin(std::future::ready(Ok(binding)))
    }

    fn unbind(&self, exchange: &str, binding: u64) -> BusFuture<'_, ()> {
        self.unbind_now(exchange, binding);
        Box::pin(std::future::ready(()))
    }

    /// Other connections may still share this exchange; clients release their own bindings.
    fn close(&self) -> BusFuture<'_, ()> {
        Box::pin(std::future::ready(()))
    }
}
