use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::memory::MemoryBroker;
use super::tcp::TcpTransport;
use super::topic::TopicPattern;
use super::{BusError, Delivery, Transport};
use crate::config::{BusConfig, BusTransport};
use crate::protocol::{Decoded, Message, MessageRegistry};

/// Shared handle to one transport. Cheap to clone; every [`BusClient`]
/// created from it is an isolated channel with its own bindings.
#[derive(Clone)]
pub struct Connection {
    transport: Arc<dyn Transport>,
    registry: Arc<MessageRegistry>,
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            registry: Arc::new(MessageRegistry::new()),
        }
    }

    pub fn in_memory(broker: &MemoryBroker) -> Self {
        Self::new(Arc::new(broker.clone()))
    }

    pub async fn open(config: &BusConfig) -> Result<Self, BusError> {
        match &config.transport {
            BusTransport::Memory => {
                info!("Using a private in-process exchange");
                Ok(Self::in_memory(&MemoryBroker::new()))
            }
            BusTransport::Tcp { address } => {
                let transport = TcpTransport::connect(address.as_str(), config.reconnect.clone()).await?;
                Ok(Self::new(Arc::new(transport)))
            }
        }
    }

    /// Replaces the registry used to decode and encode messages on clients created afterwards.
    pub fn with_registry(mut self, registry: MessageRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    pub fn client(&self, exchange: impl Into<String>) -> BusClient {
        BusClient {
            transport: Arc::clone(&self.transport),
            registry: Arc::clone(&self.registry),
            exchange: exchange.into(),
            bindings: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}

/// A decoded delivery together with the concrete topic it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub topic: String,
    pub decoded: Decoded,
}

/// Ordered stream of messages for one set of topic patterns.
pub struct Subscription {
    id: u64,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    registry: Arc<MessageRegistry>,
    shutdown: CancellationToken,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next message, or `None` once the client is closed or the transport gave up.
    pub async fn next(&mut self) -> Option<Inbound> {
        let delivery = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            delivery = self.deliveries.recv() => delivery,
        }?;

        let decoded = self.registry.decode(&delivery.payload, &delivery.topic);
        if let Decoded::Invalid(invalid) = &decoded {
            warn!(
                "Invalid message on topic '{}': {} ({})",
                invalid.topic(),
                invalid.reason(),
                invalid.payload_text()
            );
        }
        Some(Inbound {
            topic: delivery.topic,
            decoded,
        })
    }
}

/// Publish/subscribe client bound to one exchange.
pub struct BusClient {
    transport: Arc<dyn Transport>,
    registry: Arc<MessageRegistry>,
    exchange: String,
    bindings: Mutex<Vec<u64>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl BusClient {
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn publish(&self, topic: &str, message: &Message) -> Result<(), BusError> {
        let payload = self.registry.encode(message)?;
        self.publish_raw(topic, payload).await?;
        debug!(
            "Published {} ({}) on '{}'",
            message.message_type(),
            message.message_id().unwrap_or("-"),
            topic
        );
        Ok(())
    }

    pub async fn publish_raw(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        self.transport.publish(&self.exchange, topic, payload).await
    }

    pub async fn subscribe(&self, patterns: &[&str]) -> Result<Subscription, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        if patterns.is_empty() {
            return Err(BusError::invalid_topic("", "at least one pattern is required"));
        }
        let parsed = patterns
            .iter()
            .map(|pattern| TopicPattern::parse(pattern))
            .collect::<Result<Vec<_>, _>>()?;

        let binding = self.transport.bind(&self.exchange, parsed).await?;
        self.bindings.lock().push(binding.id);
        debug!("Subscribed to [{}] on '{}'", patterns.join(", "), self.exchange);

        Ok(Subscription {
            id: binding.id,
            deliveries: binding.deliveries,
            registry: Arc::clone(&self.registry),
            shutdown: self.shutdown.clone(),
        })
    }

    /// Runs `handler` for every matching message, one at a time, until the client closes.
    pub async fn listen<F, Fut>(&self, patterns: &[&str], mut handler: F) -> Result<(), BusError>
    where
        F: FnMut(Inbound) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut subscription = self.subscribe(patterns).await?;
        let task = tokio::spawn(async move {
            while let Some(inbound) = subscription.next().await {
                handler(inbound).await;
            }
        });
        self.listeners.lock().push(task);
        Ok(())
    }

    /// Releases every binding and listener. Safe to call more than once.
    pub async fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        for task in self.listeners.lock().drain(..) {
            task.abort();
        }
        let bindings: Vec<u64> = self.bindings.lock().drain(..).collect();
        for binding in bindings {
            self.transport.unbind(&self.exchange, binding).await;
        }
        debug!("Closed client on '{}'", self.exchange);
    }
}

impl Drop for BusClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for task in self.listeners.get_mut().drain(..) {
            task.abort();
        }
    }
}
