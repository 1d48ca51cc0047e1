//! WebSocket document server
//!
//! Serves [`DocumentStore`] documents over the CBOR protocol in
//! [`message`](super::message). Each connection joins one session and may only
//! touch that session's documents. Every change to a document is pushed as a
//! `snapshot` to all subscriptions on it, across connections, including the
//! connection that made the change.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, info, warn};

use super::message::{decode_value, ClientMessage, ErrorCode, ServerMessage, PROTOCOL_V1};
use super::{document_value, DocumentKey, DocumentStore};
use crate::keys::{SessionId, SliceKey};

/// Time a new connection has to send `join`
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

type Outbox = mpsc::UnboundedSender<ServerMessage>;

struct Subscriber {
    connection: u64,
    subscription: u64,
    outbox: Outbox,
}

struct Hub {
    store: DocumentStore,
    peer_id: String,
    subscribers: Mutex<HashMap<DocumentKey, Vec<Subscriber>>>,
    next_connection: AtomicU64,
}

impl Hub {
    fn subscribers(&self) -> MutexGuard<'_, HashMap<DocumentKey, Vec<Subscriber>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a subscription and send it the current snapshot
    ///
    /// Both happen under the subscriber lock, so no change can slip between
    /// the initial snapshot and the registration.
    fn subscribe(&self, key: DocumentKey, subscriber: Subscriber) -> Result<()> {
        let mut subscribers = self.subscribers();
        let value = self.store.get(&key)?.as_ref().and_then(document_value);
        let snapshot = ServerMessage::snapshot(
            subscriber.subscription,
            key.slice.as_str(),
            value.as_ref(),
        )?;
        let _ = subscriber.outbox.send(snapshot);
        subscribers.entry(key).or_default().push(subscriber);
        Ok(())
    }

    fn unsubscribe(&self, connection: u64, subscription: u64) {
        self.subscribers().retain(|_, list| {
            list.retain(|s| !(s.connection == connection && s.subscription == subscription));
            !list.is_empty()
        });
    }

    fn drop_connection(&self, connection: u64) {
        self.subscribers().retain(|_, list| {
            list.retain(|s| s.connection != connection);
            !list.is_empty()
        });
    }

    /// Merge `value` into a document, then broadcast the result
    ///
    /// The subscriber lock is held from the commit through the broadcast, so
    /// every subscriber sees changes in commit order. `ack` runs once the
    /// change is committed.
    fn merge(&self, key: &DocumentKey, value: Value, ack: impl FnOnce()) -> Result<()> {
        let mut subscribers = self.subscribers();
        let document = self.store.merge(key, value)?;
        ack();
        broadcast(&mut subscribers, key, document_value(&document).as_ref());
        Ok(())
    }

    /// Delete a document, then tell its subscribers it is gone
    fn delete(&self, key: &DocumentKey, ack: impl FnOnce()) -> Result<()> {
        let mut subscribers = self.subscribers();
        let existed = self.store.delete(key)?;
        ack();
        if existed {
            broadcast(&mut subscribers, key, None);
        }
        Ok(())
    }
}

/// Push a document's value to every subscription on it
fn broadcast(
    subscribers: &mut HashMap<DocumentKey, Vec<Subscriber>>,
    key: &DocumentKey,
    value: Option<&Value>,
) {
    let Some(list) = subscribers.get_mut(key) else {
        return;
    };

    list.retain(|s| {
        match ServerMessage::snapshot(s.subscription, key.slice.as_str(), value) {
            Ok(snapshot) => s.outbox.send(snapshot).is_ok(),
            Err(e) => {
                warn!("Failed to encode snapshot for {}: {}", key, e);
                true
            }
        }
    });
    if list.is_empty() {
        subscribers.remove(key);
    }
}

/// Document server shared by all connections
///
/// Cheap to clone; clones share the store and the subscriber table.
#[derive(Clone)]
pub struct DocumentServer {
    hub: Arc<Hub>,
}

impl DocumentServer {
    pub fn new(store: DocumentStore) -> Self {
        Self {
            hub: Arc::new(Hub {
                store,
                peer_id: format!("slicesync-server-{}", &uuid::Uuid::new_v4().to_string()[..8]),
                subscribers: Mutex::new(HashMap::new()),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    /// The underlying document store
    pub fn store(&self) -> &DocumentStore {
        &self.hub.store
    }

    /// Accept connections until the listener fails
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!("Document server listening on ws://{}", addr);

        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .context("Failed to accept connection")?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer).await {
                    debug!("Connection from {} ended: {:#}", peer, e);
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let ws_stream = accept_async(stream)
            .await
            .context("WebSocket handshake failed")?;
        let (mut write, mut read) = ws_stream.split();

        let session = match wait_for_join(&mut read).await {
            Ok(session) => session,
            Err(e) => {
                let reply =
                    ServerMessage::connection_error(ErrorCode::InvalidRequest, e.to_string());
                write.send(Message::Binary(reply.encode()?)).await.ok();
                write.close().await.ok();
                return Err(e);
            }
        };

        write
            .send(Message::Binary(ServerMessage::joined(&self.hub.peer_id).encode()?))
            .await?;

        let connection = self.hub.next_connection.fetch_add(1, Ordering::Relaxed);
        info!("Peer {} joined session '{}' (connection {})", peer, session, connection);

        let result = self.run_connection(&session, connection, write, read).await;

        self.hub.drop_connection(connection);
        debug!("Connection {} for session '{}' closed", connection, session);
        result
    }

    async fn run_connection(
        &self,
        session: &SessionId,
        connection: u64,
        mut write: SplitSink<WebSocketStream<TcpStream>, Message>,
        mut read: SplitStream<WebSocketStream<TcpStream>>,
    ) -> Result<()> {
        let (outbox, mut outgoing) = mpsc::unbounded_channel();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            self.handle_message(session, connection, &outbox, &data);
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Err(e)) => return Err(e.into()),
                        _ => {}
                    }
                }
                Some(reply) = outgoing.recv() => {
                    write.send(Message::Binary(reply.encode()?)).await?;
                }
            }
        }
    }

    fn handle_message(&self, session: &SessionId, connection: u64, outbox: &Outbox, data: &[u8]) {
        let message = match ClientMessage::decode(data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping undecodable message on connection {}: {}", connection, e);
                return;
            }
        };

        match message {
            ClientMessage::Join { .. } => {
                let _ = outbox.send(ServerMessage::connection_error(
                    ErrorCode::InvalidRequest,
                    "connection already joined",
                ));
            }

            ClientMessage::Subscribe {
                subscription_id,
                session: requested,
                slice,
            } => {
                let key = match resolve(session, &requested, &slice) {
                    Ok(key) => key,
                    Err((code, message)) => {
                        let _ = outbox.send(ServerMessage::subscription_error(
                            subscription_id,
                            code,
                            message,
                        ));
                        return;
                    }
                };

                debug!("Connection {} subscribed to {}", connection, key);
                let subscriber = Subscriber {
                    connection,
                    subscription: subscription_id,
                    outbox: outbox.clone(),
                };
                if let Err(e) = self.hub.subscribe(key, subscriber) {
                    let _ = outbox.send(ServerMessage::subscription_error(
                        subscription_id,
                        ErrorCode::Internal,
                        e.to_string(),
                    ));
                }
            }

            ClientMessage::Unsubscribe { subscription_id } => {
                self.hub.unsubscribe(connection, subscription_id);
            }

            ClientMessage::WriteMerge {
                request_id,
                session: requested,
                slice,
                value,
            } => {
                let reply = resolve(session, &requested, &slice).and_then(|key| {
                    let value = decode_value(&value)
                        .map_err(|e| (ErrorCode::InvalidRequest, e.to_string()))?;
                    self.hub
                        .merge(&key, value, || {
                            let _ = outbox.send(ServerMessage::Ack { request_id });
                        })
                        .map_err(|e| (ErrorCode::Internal, format!("{:#}", e)))
                });

                if let Err((code, message)) = reply {
                    let _ = outbox.send(ServerMessage::request_error(request_id, code, message));
                }
            }

            ClientMessage::Delete {
                request_id,
                session: requested,
                slice,
            } => {
                let reply = resolve(session, &requested, &slice).and_then(|key| {
                    self.hub
                        .delete(&key, || {
                            let _ = outbox.send(ServerMessage::Ack { request_id });
                        })
                        .map_err(|e| (ErrorCode::Internal, format!("{:#}", e)))
                });

                if let Err((code, message)) = reply {
                    let _ = outbox.send(ServerMessage::request_error(request_id, code, message));
                }
            }
        }
    }
}

/// Check a request against the joined session and build its document key
fn resolve(
    joined: &SessionId,
    requested: &str,
    slice: &str,
) -> std::result::Result<DocumentKey, (ErrorCode, String)> {
    if requested != joined.as_str() {
        return Err((
            ErrorCode::PermissionDenied,
            format!("connection is joined to a different session than '{}'", requested),
        ));
    }
    let slice = SliceKey::new(slice).map_err(|e| (ErrorCode::InvalidRequest, e.to_string()))?;
    Ok(DocumentKey::new(joined, &slice))
}

async fn wait_for_join(read: &mut SplitStream<WebSocketStream<TcpStream>>) -> Result<SessionId> {
    let join = tokio::time::timeout(JOIN_TIMEOUT, read_first_message(read))
        .await
        .context("Timeout waiting for join")??;

    let ClientMessage::Join {
        session,
        supported_protocol_versions,
        ..
    } = join
    else {
        bail!("Expected join message");
    };

    if !supported_protocol_versions.iter().any(|v| v == PROTOCOL_V1) {
        bail!("No supported protocol version in {:?}", supported_protocol_versions);
    }
    SessionId::new(session).context("Invalid session in join")
}

async fn read_first_message(
    read: &mut SplitStream<WebSocketStream<TcpStream>>,
) -> Result<ClientMessage> {
    loop {
        match read.next().await {
            Some(Ok(Message::Binary(data))) => return Ok(ClientMessage::decode(&data)?),
            Some(Ok(Message::Close(_))) | None => bail!("Connection closed before join"),
            Some(Err(e)) => return Err(e.into()),
            _ => {}
        }
    }
}
