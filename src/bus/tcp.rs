use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::topic::{validate_topic, TopicPattern};
use super::wire::{decode_frame, write_frame, ClientFrame, ServerFrame};
use super::{Binding, BusError, BusFuture, Delivery, Transport};
use crate::config::ReconnectPolicy;

struct RemoteBinding {
    exchange: String,
    patterns: Vec<String>,
    sender: mpsc::UnboundedSender<Delivery>,
}

type BindingTable = Arc<Mutex<HashMap<u64, RemoteBinding>>>;

/// Client side of the broker protocol.
///
/// A background task owns the socket. When the connection drops it reconnects
/// with the configured backoff, replays every active binding, then flushes the
/// frames that were queued meanwhile. If reconnecting is abandoned, every
/// binding queue is closed so subscribers observe the loss.
pub struct TcpTransport {
    address: String,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    bindings: BindingTable,
    next_binding: AtomicU64,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Connects, retrying per `policy`. Fails if the first connection cannot be made.
    pub async fn connect(address: impl Into<String>, policy: ReconnectPolicy) -> Result<Self, BusError> {
        let address = address.into();
        let shutdown = CancellationToken::new();
        let stream = connect_with_backoff(&address, &policy, &shutdown).await?;
        info!("🔗 Connected to broker at {}", address);

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let bindings: BindingTable = Arc::new(Mutex::new(HashMap::new()));
        let worker = tokio::spawn(run_connection(
            stream,
            address.clone(),
            policy,
            outbound_rx,
            Arc::clone(&bindings),
            shutdown.clone(),
        ));

        Ok(Self {
            address,
            outbound,
            bindings,
            next_binding: AtomicU64::new(0),
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Transport for TcpTransport {
    fn publish(&self, exchange: &str, topic: &str, payload: Vec<u8>) -> BusFuture<'_, Result<(), BusError>> {
        let result = validate_topic(topic).and_then(|_| {
            self.outbound
                .send(ClientFrame::Publish {
                    exchange: exchange.to_string(),
                    topic: topic.to_string(),
                    payload,
                })
                .map_err(|_| BusError::Closed)
        });
        Box::pin(std::future::ready(result))
    }

    fn bind(&self, exchange: &str, patterns: Vec<TopicPattern>) -> BusFuture<'_, Result<Binding, BusError>> {
        let id = self.next_binding.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, deliveries) = mpsc::unbounded_channel();
        let patterns: Vec<String> = patterns.iter().map(|pattern| pattern.as_str().to_string()).collect();

        self.bindings.lock().insert(
            id,
            RemoteBinding {
                exchange: exchange.to_string(),
                patterns: patterns.clone(),
                sender,
            },
        );
        let frame = ClientFrame::Bind {
            binding: id,
            exchange: exchange.to_string(),
            patterns,
        };
        let result = match self.outbound.send(frame) {
            Ok(()) => Ok(Binding { id, deliveries }),
            Err(_) => {
                self.bindings.lock().remove(&id);
                Err(BusError::Closed)
            }
        };
        Box::pin(std::future::ready(result))
    }

    fn unbind(&self, _exchange: &str, binding: u64) -> BusFuture<'_, ()> {
        if self.bindings.lock().remove(&binding).is_some() {
            let _ = self.outbound.send(ClientFrame::Unbind { binding });
        }
        Box::pin(std::future::ready(()))
    }

    fn close(&self) -> BusFuture<'_, ()> {
        self.shutdown.cancel();
        let worker = self.worker.lock().take();
        Box::pin(async move {
            if let Some(worker) = worker {
                let _ = worker.await;
            }
        })
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn connect_with_backoff(
    address: &str,
    policy: &ReconnectPolicy,
    shutdown: &CancellationToken,
) -> Result<TcpStream, BusError> {
    let mut attempt = 0u32;
    loop {
        match TcpStream::connect(address).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(error) => {
                attempt += 1;
                if !policy.allows(attempt) {
                    return Err(BusError::ConnectFailed {
                        address: address.to_string(),
                        attempts: attempt,
                    });
                }
                let delay = policy.delay_for(attempt);
                warn!("Connection to {} failed ({}), retrying in {:?}", address, error, delay);
                tokio::select! {
                    _ = shutdown.cancelled() => return Err(BusError::Closed),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn run_connection(
    mut stream: TcpStream,
    address: String,
    policy: ReconnectPolicy,
    mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
    bindings: BindingTable,
    shutdown: CancellationToken,
) {
    let mut pending: Option<ClientFrame> = None;

    loop {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let mut replay: Vec<ClientFrame> = bindings
            .lock()
            .iter()
            .map(|(id, binding)| ClientFrame::Bind {
                binding: *id,
                exchange: binding.exchange.clone(),
                patterns: binding.patterns.clone(),
            })
            .collect();
        replay.extend(pending.take());

        let mut healthy = true;
        for frame in replay {
            if let Err(error) = write_frame(&mut writer, &frame).await {
                warn!("Failed to restore state on {}: {}", address, error);
                if !matches!(frame, ClientFrame::Bind { .. }) {
                    pending = Some(frame);
                }
                healthy = false;
                break;
            }
        }

        while healthy {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    while let Ok(frame) = outbound.try_recv() {
                        if write_frame(&mut writer, &frame).await.is_err() {
                            break;
                        }
                    }
                    debug!("Connection to {} closed", address);
                    return;
                }
                frame = outbound.recv() => match frame {
                    None => return,
                    Some(frame) => {
                        if let Err(error) = write_frame(&mut writer, &frame).await {
                            warn!("Write to {} failed: {}", address, error);
                            pending = Some(frame);
                            healthy = false;
                        }
                    }
                },
                line = lines.next_line() => match line {
                    Ok(Some(line)) => route_frame(&line, &bindings),
                    Ok(None) => {
                        warn!("Broker {} closed the connection", address);
                        healthy = false;
                    }
                    Err(error) => {
                        warn!("Read from {} failed: {}", address, error);
                        healthy = false;
                    }
                },
            }
        }

        info!("🔄 Reconnecting to broker {}", address);
        stream = match connect_with_backoff(&address, &policy, &shutdown).await {
            Ok(stream) => stream,
            Err(BusError::Closed) => return,
            Err(error) => {
                error!("❌ {}; closing all subscriptions", error);
                bindings.lock().clear();
                return;
            }
        };
        info!("🔗 Reconnected to {}, restoring {} bindings", address, bindings.lock().len());
    }
}

fn route_frame(line: &str, bindings: &Mutex<HashMap<u64, RemoteBinding>>) {
    if line.trim().is_empty() {
        return;
    }
    match decode_frame::<ServerFrame>(line) {
        Ok(ServerFrame::Deliver { binding, topic, payload }) => {
            let mut bindings = bindings.lock();
            let closed = match bindings.get(&binding) {
                Some(entry) => entry.sender.send(Delivery { topic, payload }).is_err(),
                None => {
                    debug!("Delivery for unknown binding {}", binding);
                    false
                }
            };
            if closed {
                bindings.remove(&binding);
            }
        }
        Ok(ServerFrame::Error { message }) => warn!("Broker reported an error: {}", message),
        Err(error) => warn!("Ignoring malformed frame from broker: {}", error),
    }
}
