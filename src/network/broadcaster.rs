//! Subscriber endpoint and broadcast fan-out.
//!
//! Accepts inbound connections, issues each one a server-side id and an
//! `identify` challenge, and closes anything that has not completed the
//! handshake within the identification timeout. Identified subscribers
//! receive fan-out traffic serialized once per broadcast; a subscriber whose
//! outbound queue fails is demoted to `Closing` without disturbing the rest.
//!
//! If the configured port is taken the next one is tried until a bind
//! succeeds; `start` returns the bound port.

use super::protocol::{
    self, ClientMessage, ServerMessage, CLOSE_ABNORMAL, CLOSE_NORMAL, CLOSE_PROTOCOL,
};
use super::subscriber::{SubscriberDescriptor, SubscriberRegistry};
use crate::config::{ServiceSettings, WebsocketSettings};
use crate::frame::now_ms;
use anyhow::Context;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const OUTBOUND_QUEUE_DEPTH: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    pub host: String,
    pub port: u16,
    pub identification_timeout: Duration,
    pub max_frame_bytes: usize,
    pub server_version: String,
}

impl BroadcasterConfig {
    pub fn from_settings(network: &WebsocketSettings, service: &ServiceSettings) -> Self {
        Self {
            host: network.host.clone(),
            port: network.port,
            identification_timeout: network.identification_timeout(),
            max_frame_bytes: network.max_frame_bytes,
            server_version: service.server_version.clone(),
        }
    }
}

/// Connection-side events forwarded to the supervisor.
#[derive(Debug)]
pub enum ClientEvent {
    Connected {
        id: u32,
        descriptor: SubscriberDescriptor,
    },
    Disconnected {
        id: u32,
        remaining: usize,
    },
    Message {
        id: u32,
        message: ClientMessage,
    },
}

struct Inner {
    config: BroadcasterConfig,
    registry: SubscriberRegistry,
    next_id: AtomicU32,
    event_tx: mpsc::Sender<ClientEvent>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Broadcaster {
    pub fn new(config: BroadcasterConfig, event_tx: mpsc::Sender<ClientEvent>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                registry: SubscriberRegistry::new(),
                next_id: AtomicU32::new(1),
                event_tx,
                shutdown_tx,
                accept_task: Mutex::new(None),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Bind the listener and start accepting subscribers. Returns the port
    /// actually bound, which may differ from the configured one.
    pub async fn start(&self) -> anyhow::Result<u16> {
        let host = self.inner.config.host.clone();
        let mut port = self.inner.config.port;
        let listener = loop {
            match TcpListener::bind((host.as_str(), port)).await {
                Ok(listener) => break listener,
                Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                    warn!(port, "port in use, trying the next one");
                    port = port
                        .checked_add(1)
                        .context("no free port below 65536")?;
                }
                Err(err) => {
                    return Err(err).context(format!("failed to bind {host}:{port}"));
                }
            }
        };
        let bound = listener
            .local_addr()
            .context("listener has no local address")?
            .port();
        info!(host = %host, port = bound, "broadcaster listening");

        let inner = Arc::clone(&self.inner);
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            let mut connections = JoinSet::new();
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            connections.spawn(handle_connection(Arc::clone(&inner), stream, addr));
                        }
                        Err(err) => error!(%err, "accept failed"),
                    },
                    Some(_) = connections.join_next(), if !connections.is_empty() => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
            drop(listener);
            // Wait for every connection to finish its goodbye and close.
            while let Ok(Some(_)) = timeout(SHUTDOWN_GRACE, connections.join_next()).await {
            }
            connections.abort_all();
        });
        *self.inner.accept_task.lock().await = Some(task);
        Ok(bound)
    }

    /// Serialize once and fan out to every identified subscriber. Returns
    /// how many subscribers the record was queued for.
    pub async fn broadcast(&self, message: &ServerMessage) -> usize {
        let frame = match protocol::encode_server(message) {
            Ok(frame) => frame,
            Err(err) => {
                error!(%err, "failed to serialize broadcast record");
                return 0;
            }
        };
        let mut delivered = 0;
        for (id, tx) in self.inner.registry.identified_senders().await {
            if tx.try_send(frame.clone()).is_ok() {
                delivered += 1;
            } else {
                warn!(id, "outbound queue failed, demoting subscriber");
                self.inner.registry.mark_closing(id).await;
            }
        }
        delivered
    }

    /// Send one record to one identified subscriber.
    pub async fn send(&self, id: u32, message: &ServerMessage) -> anyhow::Result<()> {
        let frame = protocol::encode_server(message).context("serialize record")?;
        let tx = self
            .inner
            .registry
            .sender_for(id)
            .await
            .with_context(|| format!("subscriber {id} is not identified"))?;
        tx.try_send(frame)
            .map_err(|_| anyhow::anyhow!("subscriber {id} outbound queue unavailable"))
    }

    /// Number of identified subscribers.
    pub async fn client_count(&self) -> usize {
        self.inner.registry.identified_count().await
    }

    /// Send a normal close to every subscriber, wait for the connections to
    /// finish, and shut the listener down. Idempotent.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("broadcaster stopping");
        if let Ok(frame) = protocol::encode_server(&ServerMessage::Goodbye {
            code: CLOSE_NORMAL,
            reason: "Service shutting down".to_string(),
        }) {
            for (id, tx) in self.inner.registry.all_senders().await {
                // A stalled subscriber must not hold up the shutdown.
                if timeout(Duration::from_millis(500), tx.send(frame.clone()))
                    .await
                    .is_err()
                {
                    warn!(id, "subscriber did not accept the goodbye in time");
                }
            }
        }
        self.inner.registry.clear().await;
        let _ = self.inner.shutdown_tx.send(true);
        if let Some(task) = self.inner.accept_task.lock().await.take() {
            if timeout(Duration::from_secs(10), task).await.is_err() {
                warn!("broadcaster accept loop did not stop in time");
            }
        }
        info!("broadcaster stopped");
    }
}

async fn writer_loop(mut write_half: OwnedWriteHalf, mut outbound_rx: mpsc::Receiver<Bytes>) {
    while let Some(frame) = outbound_rx.recv().await {
        if protocol::write_frame(&mut write_half, &frame).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

async fn send_goodbye(outbound_tx: &mpsc::Sender<Bytes>, code: u16, reason: &str) {
    if let Ok(frame) = protocol::encode_server(&ServerMessage::Goodbye {
        code,
        reason: reason.to_string(),
    }) {
        let _ = outbound_tx.send(frame).await;
    }
}

async fn handle_connection(inner: Arc<Inner>, stream: TcpStream, addr: SocketAddr) {
    let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
    let (mut read_half, write_half) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE_DEPTH);
    inner.registry.insert_pending(id, outbound_tx.clone()).await;
    let writer = tokio::spawn(writer_loop(write_half, outbound_rx));
    debug!(%addr, id, "connection accepted");

    match protocol::encode_server(&ServerMessage::Identify { client_id: id }) {
        Ok(challenge) => {
            if outbound_tx.send(challenge).await.is_err() {
                inner.registry.remove(id).await;
                drop(outbound_tx);
                let _ = writer.await;
                return;
            }
        }
        Err(err) => {
            error!(%err, "failed to serialize identify challenge");
            inner.registry.remove(id).await;
            drop(outbound_tx);
            let _ = writer.await;
            return;
        }
    }

    let descriptor = identification_phase(&inner, id, &mut read_half, &outbound_tx).await;
    let Some(descriptor) = descriptor else {
        inner.registry.remove(id).await;
        drop(outbound_tx);
        let _ = writer.await;
        debug!(id, "connection closed before identification");
        return;
    };

    let welcome = ServerMessage::Welcome {
        session_id: Uuid::new_v4().to_string(),
        server_version: inner.config.server_version.clone(),
        timestamp: now_ms(),
    };
    if let Ok(frame) = protocol::encode_server(&welcome) {
        let _ = outbound_tx.send(frame).await;
    }
    info!(id, name = %descriptor.name, platform = %descriptor.platform, "subscriber identified");
    let _ = inner
        .event_tx
        .send(ClientEvent::Connected {
            id,
            descriptor: descriptor.clone(),
        })
        .await;

    read_loop(&inner, id, &mut read_half, &outbound_tx).await;

    let was_identified = inner.registry.remove(id).await;
    drop(outbound_tx);
    let _ = writer.await;
    if was_identified {
        let remaining = inner.registry.identified_count().await;
        info!(id, remaining, "subscriber disconnected");
        let _ = inner
            .event_tx
            .send(ClientEvent::Disconnected { id, remaining })
            .await;
    }
}

/// The only acceptable message before identification is `identify`; anything
/// else, or silence past the timeout, closes the connection with a protocol
/// goodbye.
async fn identification_phase(
    inner: &Arc<Inner>,
    id: u32,
    read_half: &mut OwnedReadHalf,
    outbound_tx: &mpsc::Sender<Bytes>,
) -> Option<SubscriberDescriptor> {
    let read = timeout(
        inner.config.identification_timeout,
        protocol::read_frame(read_half, inner.config.max_frame_bytes),
    )
    .await;
    match read {
        Err(_) => {
            warn!(id, "identification timeout");
            send_goodbye(outbound_tx, CLOSE_PROTOCOL, "identification timeout").await;
            None
        }
        Ok(Err(err)) => {
            debug!(id, %err, "connection lost before identification");
            None
        }
        Ok(Ok(payload)) => match protocol::decode_client(&payload) {
            Ok(ClientMessage::Identify {
                name,
                version,
                platform,
                capabilities,
            }) => {
                inner
                    .registry
                    .identify(id, name, version, platform, capabilities)
                    .await
            }
            Ok(_) | Err(_) => {
                warn!(id, "protocol violation before identification");
                send_goodbye(outbound_tx, CLOSE_PROTOCOL, "identification required").await;
                None
            }
        },
    }
}

async fn read_loop(
    inner: &Arc<Inner>,
    id: u32,
    read_half: &mut OwnedReadHalf,
    outbound_tx: &mpsc::Sender<Bytes>,
) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            read = protocol::read_frame(read_half, inner.config.max_frame_bytes) => match read {
                Ok(payload) => match protocol::decode_client(&payload) {
                    Ok(message) => {
                        if inner
                            .event_tx
                            .send(ClientEvent::Message { id, message })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(err) => {
                        // Malformed records get an error reply; the
                        // connection stays up.
                        debug!(id, %err, "unparseable record from subscriber");
                        if let Ok(frame) = protocol::encode_server(&ServerMessage::Error {
                            error: format!("unrecognized message: {err}"),
                        }) {
                            if outbound_tx.send(frame).await.is_err() {
                                return;
                            }
                        }
                    }
                },
                Err(err) => {
                    debug!(id, %err, "subscriber read ended");
                    // Best effort: the socket may already be gone.
                    send_goodbye(outbound_tx, CLOSE_ABNORMAL, "connection error").await;
                    return;
                }
            },
            _ = shutdown_rx.changed() => return,
        }
    }
}
