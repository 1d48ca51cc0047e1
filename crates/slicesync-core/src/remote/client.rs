//! WebSocket remote store
//!
//! [`WsRemote`] talks to a [`DocumentServer`](super::DocumentServer). It keeps
//! one link task per session: the task owns the WebSocket, reconnects with
//! exponential backoff and re-subscribes every open subscription after each
//! reconnect. Links are reference counted by their subscriptions and close
//! once the last one is dropped and every pending reply has arrived.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::future::{self, FutureExt};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::message::{decode_value, ClientMessage, PeerId, ServerMessage};
use super::{EventSink, RemoteError, RemoteEvent, RemoteFuture, RemoteStore, Subscription};
use crate::config::Config;
use crate::keys::{SessionId, SliceKey};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;
type Reply = oneshot::Sender<Result<(), RemoteError>>;

/// Configuration for the WebSocket remote
#[derive(Debug, Clone)]
pub struct WsRemoteConfig {
    /// WebSocket URL of the document server
    pub url: String,
    /// Initial reconnect delay
    pub initial_reconnect_delay: Duration,
    /// Maximum reconnect delay
    pub max_reconnect_delay: Duration,
    /// Time allowed for connect plus join
    pub handshake_timeout: Duration,
}

impl WsRemoteConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for WsRemoteConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&Config> for WsRemoteConfig {
    fn from(config: &Config) -> Self {
        Self::new(config.remote_url.clone().unwrap_or_default())
    }
}

/// Commands sent to a link task
enum LinkCommand {
    Subscribe {
        id: u64,
        slice: SliceKey,
        sink: EventSink,
    },
    Unsubscribe {
        id: u64,
    },
    WriteMerge {
        slice: SliceKey,
        value: Value,
        reply: Reply,
    },
    Delete {
        slice: SliceKey,
        reply: Reply,
    },
    /// Close once every pending reply has arrived
    Shutdown,
}

struct LinkHandle {
    commands: mpsc::UnboundedSender<LinkCommand>,
    subscriptions: usize,
}

type Links = Mutex<HashMap<SessionId, LinkHandle>>;

/// [`RemoteStore`] backed by a WebSocket document server
#[derive(Clone)]
pub struct WsRemote {
    config: Arc<WsRemoteConfig>,
    peer_id: PeerId,
    links: Arc<Links>,
    next_subscription: Arc<AtomicU64>,
}

impl WsRemote {
    pub fn new(config: WsRemoteConfig) -> Self {
        Self {
            config: Arc::new(config),
            peer_id: format!("slicesync-{}", &uuid::Uuid::new_v4().to_string()[..8]),
            links: Arc::new(Mutex::new(HashMap::new())),
            next_subscription: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Number of sessions with an open link
    pub fn link_count(&self) -> usize {
        lock_links(&self.links).len()
    }

    fn spawn_link(
        &self,
        session: &SessionId,
    ) -> Result<mpsc::UnboundedSender<LinkCommand>, RemoteError> {
        let runtime = Handle::try_current()
            .map_err(|_| RemoteError::unavailable("no async runtime to run the link on"))?;
        let (commands, command_rx) = mpsc::unbounded_channel();
        runtime.spawn(link_loop(
            Arc::clone(&self.config),
            self.peer_id.clone(),
            session.clone(),
            command_rx,
        ));
        Ok(commands)
    }

    /// Send a request on the session's link, or on a short-lived link when
    /// `ephemeral` is set and none is open
    fn request(
        &self,
        session: &SessionId,
        ephemeral: bool,
        command: impl FnOnce(Reply) -> LinkCommand,
    ) -> RemoteFuture {
        let (reply, reply_rx) = oneshot::channel();
        let links = lock_links(&self.links);

        let sent = match links.get(session) {
            Some(link) => link.commands.send(command(reply)).is_ok(),
            None if ephemeral => match self.spawn_link(session) {
                Ok(commands) => {
                    debug!("Opening short-lived link for session '{}'", session);
                    let sent = commands.send(command(reply)).is_ok();
                    let _ = commands.send(LinkCommand::Shutdown);
                    sent
                }
                Err(e) => return future::ready(Err(e)).boxed(),
            },
            None => {
                return future::ready(Err(RemoteError::PermissionDenied(format!(
                    "no open link for session '{}'",
                    session
                ))))
                .boxed()
            }
        };
        drop(links);

        if !sent {
            return future::ready(Err(RemoteError::unavailable("link task has stopped"))).boxed();
        }
        async move {
            reply_rx
                .await
                .unwrap_or_else(|_| Err(RemoteError::unavailable("connection lost before reply")))
        }
        .boxed()
    }
}

fn lock_links(links: &Links) -> MutexGuard<'_, HashMap<SessionId, LinkHandle>> {
    links.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RemoteStore for WsRemote {
    fn subscribe(&self, session: &SessionId, slice: &SliceKey, sink: EventSink) -> Subscription {
        let mut links = lock_links(&self.links);

        if !links.contains_key(session) {
            match self.spawn_link(session) {
                Ok(commands) => {
                    info!("Opening link for session '{}' to {}", session, self.config.url);
                    links.insert(
                        session.clone(),
                        LinkHandle {
                            commands,
                            subscriptions: 0,
                        },
                    );
                }
                Err(e) => {
                    let _ = sink.send(RemoteEvent::Error(e));
                    return Subscription::detached();
                }
            }
        }

        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let Some(link) = links.get_mut(session) else {
            return Subscription::detached();
        };
        link.subscriptions += 1;
        let _ = link.commands.send(LinkCommand::Subscribe {
            id,
            slice: slice.clone(),
            sink,
        });

        drop(links);

        let registry: Weak<Links> = Arc::downgrade(&self.links);
        let session = session.clone();
        Subscription::new(move || {
            let Some(links) = registry.upgrade() else {
                return;
            };
            let mut links = lock_links(&links);
            let Some(link) = links.get_mut(&session) else {
                return;
            };

            let _ = link.commands.send(LinkCommand::Unsubscribe { id });
            link.subscriptions = link.subscriptions.saturating_sub(1);
            if link.subscriptions == 0 {
                let _ = link.commands.send(LinkCommand::Shutdown);
                links.remove(&session);
                debug!("Closing link for session '{}'", session);
            }
        })
    }

    fn write_merge(&self, session: &SessionId, slice: &SliceKey, value: Value) -> RemoteFuture {
        let slice = slice.clone();
        self.request(session, false, move |reply| LinkCommand::WriteMerge {
            slice,
            value,
            reply,
        })
    }

    fn delete(&self, session: &SessionId, slice: &SliceKey) -> RemoteFuture {
        let slice = slice.clone();
        self.request(session, true, move |reply| LinkCommand::Delete { slice, reply })
    }
}

/// An open subscription as the link remembers it
struct LinkSubscription {
    slice: SliceKey,
    sink: EventSink,
}

/// State a link keeps across reconnects
struct LinkState {
    session: SessionId,
    subscriptions: HashMap<u64, LinkSubscription>,
    closing: bool,
}

impl LinkState {
    /// Tell every subscriber the link is down
    fn report_unavailable(&mut self, reason: &str) {
        let error = RemoteError::unavailable(reason);
        self.subscriptions
            .retain(|_, sub| sub.sink.send(RemoteEvent::Error(error.clone())).is_ok());
    }

    /// Handle a command while disconnected
    ///
    /// Returns `false` once the link should stop.
    fn handle_offline(&mut self, command: Option<LinkCommand>) -> bool {
        match command {
            None | Some(LinkCommand::Shutdown) => {
                self.closing = true;
                false
            }
            Some(LinkCommand::Subscribe { id, slice, sink }) => {
                let _ = sink.send(RemoteEvent::Error(RemoteError::unavailable(
                    "not connected to the document server",
                )));
                self.subscriptions.insert(id, LinkSubscription { slice, sink });
                true
            }
            Some(LinkCommand::Unsubscribe { id }) => {
                self.subscriptions.remove(&id);
                true
            }
            Some(LinkCommand::WriteMerge { reply, .. })
            | Some(LinkCommand::Delete { reply, .. }) => {
                let _ = reply.send(Err(RemoteError::unavailable(
                    "not connected to the document server",
                )));
                true
            }
        }
    }
}

/// How a connected session ended
enum LinkExit {
    Shutdown,
    Disconnected,
}

/// Link task: connect, serve commands, reconnect with backoff
async fn link_loop(
    config: Arc<WsRemoteConfig>,
    peer_id: PeerId,
    session: SessionId,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
) {
    let mut state = LinkState {
        session,
        subscriptions: HashMap::new(),
        closing: false,
    };
    let mut reconnect_delay = config.initial_reconnect_delay;

    loop {
        match connect(&config, &peer_id, &state.session).await {
            Ok((write, read)) => {
                reconnect_delay = config.initial_reconnect_delay;
                info!("Link for session '{}' connected", state.session);

                match run_connected(&mut state, &mut commands, write, read).await {
                    Ok(LinkExit::Shutdown) => break,
                    Ok(LinkExit::Disconnected) => {
                        debug!("Link for session '{}' disconnected", state.session);
                    }
                    Err(e) => {
                        warn!("Link for session '{}' failed: {:#}", state.session, e);
                    }
                }
                if state.closing {
                    break;
                }
                state.report_unavailable("connection to the document server lost");
            }
            Err(e) => {
                warn!(
                    "Failed to connect link for session '{}': {:#}",
                    state.session, e
                );
                state.report_unavailable(&format!("{:#}", e));
            }
        }

        // Wait before reconnecting, serving commands offline meanwhile
        let sleep = tokio::time::sleep(reconnect_delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                command = commands.recv() => {
                    if !state.handle_offline(command) {
                        debug!("Link for session '{}' shut down while offline", state.session);
                        return;
                    }
                }
            }
        }
        reconnect_delay = (reconnect_delay * 2).min(config.max_reconnect_delay);
    }

    debug!("Link for session '{}' closed", state.session);
}

/// Connect and complete the join handshake
async fn connect(
    config: &WsRemoteConfig,
    peer_id: &str,
    session: &SessionId,
) -> Result<(WsWrite, WsRead)> {
    let handshake = connect_and_join(config, peer_id, session);
    tokio::time::timeout(config.handshake_timeout, handshake)
        .await
        .context("Timeout waiting for document server. Check that the server is running.")?
}

async fn connect_and_join(
    config: &WsRemoteConfig,
    peer_id: &str,
    session: &SessionId,
) -> Result<(WsWrite, WsRead)> {
    let (ws_stream, _) = connect_async(&config.url)
        .await
        .with_context(|| format!("Failed to connect to {}", config.url))?;
    let (mut write, mut read) = ws_stream.split();

    let join = ClientMessage::join(peer_id, session.as_str());
    write.send(Message::Binary(join.encode()?)).await?;
    wait_for_joined(&mut read).await?;

    Ok((write, read))
}

/// Wait for the server's `joined` reply
async fn wait_for_joined(read: &mut WsRead) -> Result<()> {
    loop {
        match read.next().await {
            Some(Ok(Message::Binary(data))) => match ServerMessage::decode(&data)? {
                ServerMessage::Joined { .. } => return Ok(()),
                ServerMessage::Error { code, message, .. } => {
                    return Err(code.into_error(message).into())
                }
                _ => {}
            },
            Some(Ok(Message::Close(_))) | None => bail!("Connection closed during handshake"),
            Some(Err(e)) => return Err(e.into()),
            _ => {}
        }
    }
}

/// Serve commands and server messages until the socket closes or the link
/// shuts down
async fn run_connected(
    state: &mut LinkState,
    commands: &mut mpsc::UnboundedReceiver<LinkCommand>,
    mut write: WsWrite,
    mut read: WsRead,
) -> Result<LinkExit> {
    let session = state.session.as_str().to_string();
    let mut pending: HashMap<u64, Reply> = HashMap::new();
    let mut next_request: u64 = 1;

    for (id, sub) in &state.subscriptions {
        let msg = ClientMessage::Subscribe {
            subscription_id: *id,
            session: session.clone(),
            slice: sub.slice.to_string(),
        };
        write.send(Message::Binary(msg.encode()?)).await?;
    }

    loop {
        if state.closing && pending.is_empty() {
            write.close().await.ok();
            return Ok(LinkExit::Shutdown);
        }

        tokio::select! {
            command = commands.recv(), if !state.closing => {
                match command {
                    None | Some(LinkCommand::Shutdown) => state.closing = true,
                    Some(LinkCommand::Subscribe { id, slice, sink }) => {
                        let msg = ClientMessage::Subscribe {
                            subscription_id: id,
                            session: session.clone(),
                            slice: slice.to_string(),
                        };
                        state.subscriptions.insert(id, LinkSubscription { slice, sink });
                        write.send(Message::Binary(msg.encode()?)).await?;
                    }
                    Some(LinkCommand::Unsubscribe { id }) => {
                        if state.subscriptions.remove(&id).is_some() {
                            let msg = ClientMessage::Unsubscribe { subscription_id: id };
                            write.send(Message::Binary(msg.encode()?)).await?;
                        }
                    }
                    Some(LinkCommand::WriteMerge { slice, value, reply }) => {
                        let request_id = next_request;
                        next_request += 1;
                        let encoded =
                            ClientMessage::write_merge(request_id, &session, slice.as_str(), &value)
                                .and_then(|msg| msg.encode());
                        match encoded {
                            Ok(bytes) => {
                                pending.insert(request_id, reply);
                                write.send(Message::Binary(bytes)).await?;
                            }
                            Err(e) => {
                                let _ = reply.send(Err(e));
                            }
                        }
                    }
                    Some(LinkCommand::Delete { slice, reply }) => {
                        let request_id = next_request;
                        next_request += 1;
                        let msg = ClientMessage::Delete {
                            request_id,
                            session: session.clone(),
                            slice: slice.to_string(),
                        };
                        pending.insert(request_id, reply);
                        write.send(Message::Binary(msg.encode()?)).await?;
                    }
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => match ServerMessage::decode(&data) {
                        Ok(message) => handle_server_message(state, &mut pending, message)?,
                        Err(e) => warn!("Dropping undecodable server message: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => return Ok(LinkExit::Disconnected),
                    Some(Err(e)) => return Err(e.into()),
                    _ => {}
                }
            }
        }
    }
}

fn handle_server_message(
    state: &mut LinkState,
    pending: &mut HashMap<u64, Reply>,
    message: ServerMessage,
) -> Result<()> {
    match message {
        ServerMessage::Snapshot {
            subscription_id,
            exists,
            value,
            ..
        } => {
            let Some(sub) = state.subscriptions.get(&subscription_id) else {
                return Ok(());
            };
            let event = if exists {
                match decode_value(&value) {
                    Ok(value) => RemoteEvent::Snapshot(Some(value)),
                    Err(e) => RemoteEvent::Error(e),
                }
            } else {
                RemoteEvent::Snapshot(None)
            };
            let _ = sub.sink.send(event);
        }
        ServerMessage::Ack { request_id } => {
            if let Some(reply) = pending.remove(&request_id) {
                let _ = reply.send(Ok(()));
            }
        }
        ServerMessage::Error {
            request_id: Some(request_id),
            code,
            message,
            ..
        } => {
            if let Some(reply) = pending.remove(&request_id) {
                let _ = reply.send(Err(code.into_error(message)));
            }
        }
        ServerMessage::Error {
            subscription_id: Some(subscription_id),
            code,
            message,
            ..
        } => {
            if let Some(sub) = state.subscriptions.get(&subscription_id) {
                let _ = sub.sink.send(RemoteEvent::Error(code.into_error(message)));
            }
        }
        ServerMessage::Error { code, message, .. } => {
            return Err(code.into_error(message).into());
        }
        ServerMessage::Joined { .. } => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{document_value, DocumentKey, DocumentServer, DocumentStore};
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn start_server() -> (DocumentServer, String) {
        let server = DocumentServer::new(DocumentStore::open_in_memory().unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(server.clone().serve(listener));
        (server, url)
    }

    fn keys() -> (SessionId, SliceKey) {
        (
            SessionId::new("u1").unwrap(),
            SliceKey::new("dashboard-config").unwrap(),
        )
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<RemoteEvent>) -> RemoteEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_write_reaches_server_and_every_subscriber() {
        let (server, url) = start_server().await;
        let (session, slice) = keys();

        let device_a = WsRemote::new(WsRemoteConfig::new(&url));
        let device_b = WsRemote::new(WsRemoteConfig::new(&url));
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let _sub_a = device_a.subscribe(&session, &slice, tx_a);
        let _sub_b = device_b.subscribe(&session, &slice, tx_b);

        assert_eq!(next_event(&mut rx_a).await, RemoteEvent::Snapshot(None));
        assert_eq!(next_event(&mut rx_b).await, RemoteEvent::Snapshot(None));

        let value = json!({"lowThreshold": 65, "highThreshold": 180});
        device_a
            .write_merge(&session, &slice, value.clone())
            .await
            .unwrap();

        let echo = RemoteEvent::Snapshot(Some(value.clone()));
        assert_eq!(next_event(&mut rx_a).await, echo);
        assert_eq!(next_event(&mut rx_b).await, echo);

        let stored = server
            .store()
            .get(&DocumentKey::new(&session, &slice))
            .unwrap()
            .unwrap();
        assert_eq!(document_value(&stored), Some(value));
    }

    #[tokio::test]
    async fn test_write_without_link_is_permission_denied() {
        let remote = WsRemote::new(WsRemoteConfig::new("ws://127.0.0.1:9"));
        let (session, slice) = keys();

        let err = remote
            .write_merge(&session, &slice, json!(1))
            .await
            .unwrap_err();
        assert!(err.is_permission_denied());
    }

    #[tokio::test]
    async fn test_delete_opens_short_lived_link() {
        let (server, url) = start_server().await;
        let (session, slice) = keys();
        let key = DocumentKey::new(&session, &slice);
        server.store().merge(&key, json!([1, 2, 3])).unwrap();

        let remote = WsRemote::new(WsRemoteConfig::new(&url));
        remote.delete(&session, &slice).await.unwrap();

        assert!(server.store().get(&key).unwrap().is_none());
        assert_eq!(remote.link_count(), 0);
    }

    #[tokio::test]
    async fn test_link_closes_with_last_subscription() {
        let (_server, url) = start_server().await;
        let (session, slice) = keys();
        let remote = WsRemote::new(WsRemoteConfig::new(&url));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = remote.subscribe(&session, &slice, tx);
        next_event(&mut rx).await;
        assert_eq!(remote.link_count(), 1);

        drop(sub);
        assert_eq!(remote.link_count(), 0);
        let err = remote
            .write_merge(&session, &slice, json!(1))
            .await
            .unwrap_err();
        assert!(err.is_permission_denied());
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_unavailable() {
        let mut config = WsRemoteConfig::new("ws://127.0.0.1:9");
        config.handshake_timeout = Duration::from_secs(2);
        let remote = WsRemote::new(config);
        let (session, slice) = keys();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = remote.subscribe(&session, &slice, tx);
        assert!(matches!(
            next_event(&mut rx).await,
            RemoteEvent::Error(RemoteError::Unavailable(_))
        ));
    }
}
