use std::collections::HashMap;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::memory::MemoryBroker;
use super::topic::TopicPattern;
use super::wire::{decode_frame, write_frame, ClientFrame, ServerFrame};
use super::{Binding, BusError};

struct Forwarder {
    exchange: String,
    broker_binding: u64,
    task: JoinHandle<()>,
}

/// Serves a [`MemoryBroker`] to [`TcpTransport`](super::TcpTransport) clients.
#[derive(Clone, Default)]
pub struct BrokerServer {
    broker: MemoryBroker,
}

impl BrokerServer {
    pub fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    /// Accepts clients until `shutdown` is cancelled.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), BusError> {
        info!("🌐 Broker listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Broker shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!("🔗 Client connected: {}", peer);
                        let broker = self.broker.clone();
                        let client_shutdown = shutdown.child_token();
                        tokio::spawn(async move {
                            if let Err(error) = handle_client(stream, broker, client_shutdown).await {
                                warn!("Client {} error: {}", peer, error);
                            }
                            info!("🔌 Client {} disconnected", peer);
                        });
                    }
                    Err(error) => error!("Failed to accept connection: {}", error),
                },
            }
        }
    }
}

async fn handle_client(stream: TcpStream, broker: MemoryBroker, shutdown: CancellationToken) -> Result<(), BusError> {
    let _ = stream.set_nodelay(true);
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let (frames, mut frames_rx) = mpsc::unbounded_channel::<ServerFrame>();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            if let Err(error) = write_frame(&mut writer, &frame).await {
                warn!("Failed to write to client: {}", error);
                break;
            }
        }
    });

    let mut forwarders: HashMap<u64, Forwarder> = HashMap::new();
    let result = loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(error) => break Err(BusError::from(error)),
        };
        if line.trim().is_empty() {
            continue;
        }

        match decode_frame::<ClientFrame>(&line) {
            Ok(ClientFrame::Publish { exchange, topic, payload }) => {
                if let Err(error) = broker.publish_now(&exchange, &topic, payload) {
                    let _ = frames.send(ServerFrame::Error { message: error.to_string() });
                }
            }
            Ok(ClientFrame::Bind { binding, exchange, patterns }) => {
                let parsed = patterns
                    .iter()
                    .map(|pattern| TopicPattern::parse(pattern))
                    .collect::<Result<Vec<_>, _>>();
                let parsed = match parsed {
                    Ok(parsed) => parsed,
                    Err(error) => {
                        let _ = frames.send(ServerFrame::Error { message: error.to_string() });
                        continue;
                    }
                };
                if let Some(old) = forwarders.remove(&binding) {
                    release(&broker, old);
                }

                let Binding { id, mut deliveries } = broker.bind_now(&exchange, parsed);
                let out = frames.clone();
                let task = tokio::spawn(async move {
                    while let Some(delivery) = deliveries.recv().await {
                        let frame = ServerFrame::Deliver {
                            binding,
                            topic: delivery.topic,
                            payload: delivery.payload,
                        };
                        if out.send(frame).is_err() {
                            break;
                        }
                    }
                });
                debug!("Client binding {} -> broker binding {} on '{}'", binding, id, exchange);
                forwarders.insert(
                    binding,
                    Forwarder {
                        exchange,
                        broker_binding: id,
                        task,
                    },
                );
            }
            Ok(ClientFrame::Unbind { binding }) => {
                if let Some(old) = forwarders.remove(&binding) {
                    release(&broker, old);
                }
            }
            Err(error) => {
                warn!("Malformed frame from client: {}", error);
                let _ = frames.send(ServerFrame::Error {
                    message: format!("malformed frame: {}", error),
                });
            }
        }
    };

    for (_, forwarder) in forwarders.drain() {
        release(&broker, forwarder);
    }
    drop(frames);
    let _ = writer_task.await;
    result
}

fn release(broker: &MemoryBroker, forwarder: Forwarder) {
    forwarder.task.abort();
    broker.unbind_now(&forwarder.exchange, forwarder.broker_binding);
}
