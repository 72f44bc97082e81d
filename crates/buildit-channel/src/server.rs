//! Worker channel listener.
//!
//! Every accepted connection gets its own task: TLS handshake and the
//! `RegisterWorker` frame first (bounded together by the handshake
//! timeout), then a reader forwarding frames in order and a writer
//! draining the worker's link. The coordinator sees all of it as a single
//! stream of [`ChannelEvent`]s.

use buildit_config::MasterConfig;
use buildit_core::{ChannelEvent, ConnectionId, MasterMessage, WorkerId, WorkerMessage};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{decode, encode, frame_codec, frame_error, next_message};
use crate::{ChannelError, LinkTable, TlsMaterial};

type WorkerFramed = Framed<TlsStream<TcpStream>, LengthDelimitedCodec>;

/// Pause after a failed `accept` so a persistent error (e.g. out of file
/// descriptors) does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub listen: SocketAddr,
    pub handshake_timeout: Duration,
    /// Outbound messages buffered per connection.
    pub send_buffer: usize,
    /// Inbound events buffered before connection readers wait.
    pub event_buffer: usize,
}

impl ChannelSettings {
    pub fn from_config(config: &MasterConfig) -> Self {
        Self {
            listen: config.listen,
            handshake_timeout: config.channel.handshake_timeout,
            send_buffer: config.channel.send_buffer,
            event_buffer: 1024,
        }
    }
}

/// A running listener.
pub struct ListenHandle {
    pub local_addr: SocketAddr,
    /// Inbound events from every worker connection.
    pub events: mpsc::Receiver<ChannelEvent>,
    /// Outbound sends, shared with the coordinator.
    pub links: LinkTable,
    /// The accept loop; ends once the shutdown token is cancelled.
    pub task: JoinHandle<()>,
}

pub struct ChannelManager;

impl ChannelManager {
    /// Validate the certificate material, bind and start accepting.
    ///
    /// Fails before binding if any certificate, key or CA is unusable.
    pub async fn start(
        settings: ChannelSettings,
        tls: &TlsMaterial,
        shutdown: CancellationToken,
    ) -> Result<ListenHandle, ChannelError> {
        let acceptor = tls.acceptor()?;
        let listener = TcpListener::bind(settings.listen).await?;
        let local_addr = listener.local_addr()?;
        let (events_tx, events) = mpsc::channel(settings.event_buffer.max(1));
        let links = LinkTable::new();

        info!(%local_addr, "Worker channel listening (mutual TLS)");

        let shared = Arc::new(Shared {
            acceptor,
            links: links.clone(),
            events: events_tx,
            settings,
        });
        let task = tokio::spawn(accept_loop(listener, shared, shutdown));

        Ok(ListenHandle {
            local_addr,
            events,
            links,
            task,
        })
    }
}

struct Shared {
    acceptor: TlsAcceptor,
    links: LinkTable,
    events: mpsc::Sender<ChannelEvent>,
    settings: ChannelSettings,
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut next_conn = 0u64;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Worker channel shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, address) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                next_conn += 1;
                let conn_id = ConnectionId(next_conn);
                debug!(%conn_id, %address, "Connection accepted");
                tokio::spawn(handle_connection(
                    stream,
                    address,
                    conn_id,
                    shared.clone(),
                    shutdown.child_token(),
                ));
            }
        }
    }

    shared.links.close_all();
}

async fn handle_connection(
    stream: TcpStream,
    address: SocketAddr,
    conn_id: ConnectionId,
    shared: Arc<Shared>,
    token: CancellationToken,
) {
    let registration = tokio::select! {
        _ = token.cancelled() => return,
        result = tokio::time::timeout(
            shared.settings.handshake_timeout,
            handshake(&shared.acceptor, stream),
        ) => result,
    };

    let (framed, worker_id, capacity) = match registration {
        Ok(Ok(registered)) => registered,
        Ok(Err(ChannelError::Protocol(reason))) => {
            warn!(%conn_id, %address, reason = %reason, "Protocol violation during registration");
            let _ = shared
                .events
                .send(ChannelEvent::ProtocolViolation {
                    worker_id: None,
                    conn_id,
                    reason,
                })
                .await;
            return;
        }
        Ok(Err(e)) => {
            warn!(%conn_id, %address, error = %e, "Worker handshake failed");
            return;
        }
        Err(_) => {
            warn!(%conn_id, %address, "Worker handshake timed out");
            return;
        }
    };

    let (tx, rx) = mpsc::channel(shared.settings.send_buffer.max(1));
    shared
        .links
        .attach(worker_id.clone(), conn_id, tx, token.clone());
    info!(worker_id = %worker_id, %conn_id, %address, capacity, "Worker connected");

    let registered = ChannelEvent::Registered {
        worker_id: worker_id.clone(),
        conn_id,
        capacity,
        address,
    };
    if shared.events.send(registered).await.is_err() {
        shared.links.remove(&worker_id, conn_id);
        return;
    }

    let (sink, stream) = framed.split();
    let writer = tokio::spawn(write_loop(sink, rx, token.clone()));
    let outcome = read_loop(stream, &worker_id, conn_id, &shared.events, &token).await;

    token.cancel();
    shared.links.remove(&worker_id, conn_id);
    let _ = writer.await;

    let event = match outcome {
        ReadOutcome::Violation(reason) => {
            warn!(worker_id = %worker_id, %conn_id, reason = %reason, "Protocol violation, dropping connection");
            ChannelEvent::ProtocolViolation {
                worker_id: Some(worker_id),
                conn_id,
                reason,
            }
        }
        ReadOutcome::Closed | ReadOutcome::Cancelled => {
            info!(worker_id = %worker_id, %conn_id, "Worker connection closed");
            ChannelEvent::LinkDown { worker_id, conn_id }
        }
    };
    let _ = shared.events.send(event).await;
}

/// TLS handshake, then the mandatory `RegisterWorker` frame.
async fn handshake(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
) -> Result<(WorkerFramed, WorkerId, u32), ChannelError> {
    let tls = acceptor
        .accept(stream)
        .await
        .map_err(|e| ChannelError::Handshake(e.to_string()))?;
    let presented = tls
        .get_ref()
        .1
        .peer_certificates()
        .is_some_and(|certs| !certs.is_empty());
    if !presented {
        return Err(ChannelError::Handshake("peer presented no certificate".into()));
    }

    let mut framed = Framed::new(tls, frame_codec());
    match next_message::<WorkerMessage, _, _>(&mut framed).await? {
        Some(WorkerMessage::RegisterWorker {
            worker_id,
            capacity,
        }) => Ok((framed, worker_id, capacity)),
        Some(other) => Err(ChannelError::Protocol(format!(
            "expected register_worker, got {}",
            other.kind()
        ))),
        None => Err(ChannelError::Handshake(
            "connection closed before registration".into(),
        )),
    }
}

enum ReadOutcome {
    Closed,
    Cancelled,
    Violation(String),
}

async fn read_loop(
    mut stream: SplitStream<WorkerFramed>,
    worker_id: &WorkerId,
    conn_id: ConnectionId,
    events: &mpsc::Sender<ChannelEvent>,
    token: &CancellationToken,
) -> ReadOutcome {
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => return ReadOutcome::Cancelled,
            frame = stream.next() => frame,
        };

        let bytes = match frame {
            None => return ReadOutcome::Closed,
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => match frame_error(e) {
                ChannelError::Protocol(reason) => return ReadOutcome::Violation(reason),
                e => {
                    debug!(worker_id = %worker_id, %conn_id, error = %e, "Read failed");
                    return ReadOutcome::Closed;
                }
            },
        };

        let message = match decode::<WorkerMessage>(&bytes) {
            Ok(message) => message,
            Err(e) => return ReadOutcome::Violation(e.to_string()),
        };
        if let WorkerMessage::RegisterWorker { worker_id: other, .. } = &message {
            if other != worker_id {
                return ReadOutcome::Violation(format!(
                    "re-registration as {other} on a connection registered as {worker_id}"
                ));
            }
        }

        let event = ChannelEvent::Message {
            worker_id: worker_id.clone(),
            conn_id,
            message,
        };
        if events.send(event).await.is_err() {
            return ReadOutcome::Cancelled;
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WorkerFramed, Bytes>,
    mut rx: mpsc::Receiver<MasterMessage>,
    token: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = token.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let frame = match encode(&message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping unencodable message");
                continue;
            }
        };
        if let Err(e) = sink.send(frame).await {
            debug!(error = %e, "Write failed, closing connection");
            token.cancel();
            break;
        }
    }

    let _ = sink.close().await;
}
