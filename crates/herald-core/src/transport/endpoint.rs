//! One relay connection.
//!
//! [`Endpoint`] is the seam the pool talks to. [`WsEndpoint`] is the WebSocket
//! implementation: a single lazily-opened connection per relay with a reader
//! task that routes frames to subscriptions and pending `OK` waiters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use nostr_sdk::prelude::{ClientMessage, Event, EventId, Filter, JsonUtil, RelayMessage, SubscriptionId};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use crate::constants::AUTH_REQUIRED_PREFIX;

#[derive(Debug, Clone, thiserror::Error)]
pub enum EndpointError {
    #[error("Failed to connect to {url}: {message}")]
    Connect { url: String, message: String },
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Connection closed")]
    Closed,
    #[error("Subscription closed by relay: {0}")]
    SubscriptionClosed(String),
}

/// True for OK/CLOSED messages that ask the client to authenticate first.
pub fn is_auth_required(message: &str) -> bool {
    message.starts_with(AUTH_REQUIRED_PREFIX)
}

/// Result of a bounded read
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub events: Vec<Event>,
    /// False when the read ended on the deadline rather than on EOSE
    pub complete: bool,
}

/// Relay answer to an `EVENT` or `AUTH` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted,
    Rejected(String),
    AuthRequired(String),
}

impl SendOutcome {
    fn from_ok(accepted: bool, message: String) -> Self {
        if accepted {
            SendOutcome::Accepted
        } else if is_auth_required(&message) {
            SendOutcome::AuthRequired(message)
        } else {
            SendOutcome::Rejected(message)
        }
    }
}

/// Items delivered by a live stream
#[derive(Debug, Clone)]
pub enum StreamItem {
    Event(Box<Event>),
    Eose,
    Closed(String),
}

/// Keeps a live stream open; dropping it closes the stream.
pub struct StreamGuard {
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl StreamGuard {
    pub fn new(on_close: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_close: Some(Box::new(on_close)),
        }
    }

    pub fn close(mut self) {
        if let Some(f) = self.on_close.take() {
            f();
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Some(f) = self.on_close.take() {
            f();
        }
    }
}

pub type EndpointFuture<'a, T> = BoxFuture<'a, Result<T, EndpointError>>;

pub trait Endpoint: Send + Sync {
    fn url(&self) -> &str;

    /// Read stored events until EOSE or `timeout`. A deadline with partial
    /// results is `Ok` with `complete == false`; a deadline with nothing is
    /// [`EndpointError::Timeout`].
    fn fetch<'a>(&'a self, filter: &'a Filter, timeout: Duration)
        -> EndpointFuture<'a, FetchOutcome>;

    /// Open a live stream that forwards into `sink` until the guard drops.
    fn stream<'a>(
        &'a self,
        filter: &'a Filter,
        sink: mpsc::UnboundedSender<StreamItem>,
    ) -> EndpointFuture<'a, StreamGuard>;

    fn send<'a>(&'a self, event: &'a Event, timeout: Duration) -> EndpointFuture<'a, SendOutcome>;

    /// Answer the outstanding NIP-42 challenge with a signed kind-22242 event.
    fn authenticate<'a>(
        &'a self,
        auth: &'a Event,
        timeout: Duration,
    ) -> EndpointFuture<'a, SendOutcome>;

    /// Most recent `AUTH` challenge received from the relay, if any
    fn auth_challenge(&self) -> Option<String>;
}

/// Opens endpoints for relay URLs; the pool owns one endpoint per URL.
pub trait EndpointFactory: Send + Sync {
    fn open(&self, url: &str) -> Arc<dyn Endpoint>;
}

/// Factory for real WebSocket relays
pub struct WsEndpointFactory {
    connect_timeout: Duration,
}

impl WsEndpointFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl EndpointFactory for WsEndpointFactory {
    fn open(&self, url: &str) -> Arc<dyn Endpoint> {
        Arc::new(WsEndpoint::new(url, self.connect_timeout))
    }
}

/// Relay messages that belong to one subscription
#[derive(Debug)]
enum Inbound {
    Event(Box<Event>),
    Eose,
    Closed(String),
}

#[derive(Default)]
struct Routes {
    subscriptions: HashMap<String, mpsc::UnboundedSender<Inbound>>,
    pending_ok: HashMap<EventId, oneshot::Sender<(bool, String)>>,
}

struct Connection {
    outgoing: mpsc::UnboundedSender<Message>,
    routes: Arc<Mutex<Routes>>,
    alive: Arc<AtomicBool>,
}

impl Connection {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    fn send_message(&self, message: &ClientMessage) -> Result<(), EndpointError> {
        self.outgoing
            .send(Message::Text(message.as_json()))
            .map_err(|_| EndpointError::Closed)
    }

    fn open_subscription(&self, filter: &Filter) -> Result<(String, mpsc::UnboundedReceiver<Inbound>), EndpointError> {
        let subscription_id = SubscriptionId::generate();
        let key = subscription_id.to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().subscriptions.insert(key.clone(), tx);
        if let Err(e) = self.send_message(&ClientMessage::req(subscription_id, filter.clone())) {
            self.routes.lock().subscriptions.remove(&key);
            return Err(e);
        }
        Ok((key, rx))
    }

    fn close_subscription(&self, key: &str) {
        self.routes.lock().subscriptions.remove(key);
        let _ = self.send_message(&ClientMessage::close(SubscriptionId::new(key)));
    }
}

/// WebSocket relay connection
pub struct WsEndpoint {
    url: String,
    connect_timeout: Duration,
    connection: tokio::sync::Mutex<Option<Arc<Connection>>>,
    challenge: Arc<Mutex<Option<String>>>,
}

impl WsEndpoint {
    pub fn new(url: &str, connect_timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            connect_timeout,
            connection: tokio::sync::Mutex::new(None),
            challenge: Arc::new(Mutex::new(None)),
        }
    }

    async fn connection(&self) -> Result<Arc<Connection>, EndpointError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            if conn.is_alive() {
                return Ok(conn.clone());
            }
        }

        let connect_err = |message: String| EndpointError::Connect {
            url: self.url.clone(),
            message,
        };
        let (ws, _) = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await
        .map_err(|_| connect_err(format!("timed out after {:?}", self.connect_timeout)))?
        .map_err(|e| connect_err(e.to_string()))?;
        tracing::debug!(relay = %self.url, "connected");

        let (mut write, mut read) = ws.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let routes = Arc::new(Mutex::new(Routes::default()));
        let alive = Arc::new(AtomicBool::new(true));

        let writer_alive = alive.clone();
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
            writer_alive.store(false, Ordering::Relaxed);
        });

        let reader_routes = routes.clone();
        let reader_alive = alive.clone();
        let challenge = self.challenge.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match RelayMessage::from_json(text.as_str()) {
                    Ok(message) => route_message(&url, message, &reader_routes, &challenge),
                    Err(e) => tracing::debug!(relay = %url, error = %e, "skipping relay message"),
                }
            }
            reader_alive.store(false, Ordering::Relaxed);
            // Dropping the senders ends every waiting fetch, stream and publish.
            let mut routes = reader_routes.lock();
            routes.subscriptions.clear();
            routes.pending_ok.clear();
            tracing::debug!(relay = %url, "connection closed");
        });

        let conn = Arc::new(Connection {
            outgoing,
            routes,
            alive,
        });
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn send_and_wait(
        &self,
        message: ClientMessage<'_>,
        event_id: EventId,
        timeout: Duration,
    ) -> Result<SendOutcome, EndpointError> {
        let conn = self.connection().await?;
        let (tx, rx) = oneshot::channel();
        conn.routes.lock().pending_ok.insert(event_id, tx);
        if let Err(e) = conn.send_message(&message) {
            conn.routes.lock().pending_ok.remove(&event_id);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok((accepted, message))) => Ok(SendOutcome::from_ok(accepted, message)),
            Ok(Err(_)) => Err(EndpointError::Closed),
            Err(_) => {
                conn.routes.lock().pending_ok.remove(&event_id);
                Err(EndpointError::Timeout(timeout))
            }
        }
    }
}

fn route_message(
    url: &str,
    message: RelayMessage,
    routes: &Mutex<Routes>,
    challenge: &Mutex<Option<String>>,
) {
    let (subscription_id, inbound) = match message {
        RelayMessage::Event {
            subscription_id,
            event,
        } => {
            if event.verify().is_err() {
                tracing::debug!(relay = %url, id = %event.id, "dropping event with bad signature");
                return;
            }
            (subscription_id.to_string(), Inbound::Event(Box::new(Event::clone(&event))))
        }
        RelayMessage::EndOfStoredEvents(subscription_id) => (subscription_id.to_string(), Inbound::Eose),
        RelayMessage::Closed {
            subscription_id,
            message,
        } => (
            subscription_id.to_string(),
            Inbound::Closed(message.to_string()),
        ),
        RelayMessage::Ok {
            event_id,
            status,
            message,
        } => {
            if let Some(tx) = routes.lock().pending_ok.remove(&event_id) {
                let _ = tx.send((status, message.to_string()));
            }
            return;
        }
        RelayMessage::Auth { challenge: value } => {
            tracing::debug!(relay = %url, "received AUTH challenge");
            *challenge.lock() = Some(value.to_string());
            return;
        }
        RelayMessage::Notice(message) => {
            tracing::debug!(relay = %url, %message, "relay notice");
            return;
        }
        _ => return,
    };
    if let Some(tx) = routes.lock().subscriptions.get(&subscription_id) {
        let _ = tx.send(inbound);
    }
}

impl Endpoint for WsEndpoint {
    fn url(&self) -> &str {
        &self.url
    }

    fn fetch<'a>(&'a self, filter: &'a Filter, timeout: Duration) -> EndpointFuture<'a, FetchOutcome> {
        Box::pin(async move {
            let deadline = tokio::time::Instant::now() + timeout;
            let conn = tokio::time::timeout_at(deadline, self.connection())
                .await
                .map_err(|_| EndpointError::Timeout(timeout))??;
            let (subscription_id, mut rx) = conn.open_subscription(filter)?;

            let mut events = Vec::new();
            let mut complete = false;
            let mut closed_reason = None;
            loop {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(Inbound::Event(event))) => events.push(*event),
                    Ok(Some(Inbound::Eose)) => {
                        complete = true;
                        break;
                    }
                    Ok(Some(Inbound::Closed(message))) => {
                        closed_reason = Some(message);
                        break;
                    }
                    Ok(None) => {
                        closed_reason = Some("connection dropped".to_string());
                        break;
                    }
                    Err(_) => break,
                }
            }

            if closed_reason.is_none() {
                conn.close_subscription(&subscription_id);
            } else {
                conn.routes.lock().subscriptions.remove(&subscription_id);
            }

            match (events.is_empty(), complete, closed_reason) {
                (true, false, Some(reason)) => Err(EndpointError::SubscriptionClosed(reason)),
                (true, false, None) => Err(EndpointError::Timeout(timeout)),
                _ => Ok(FetchOutcome { events, complete }),
            }
        })
    }

    fn stream<'a>(
        &'a self,
        filter: &'a Filter,
        sink: mpsc::UnboundedSender<StreamItem>,
    ) -> EndpointFuture<'a, StreamGuard> {
        Box::pin(async move {
            let conn = self.connection().await?;
            let (subscription_id, mut rx) = conn.open_subscription(filter)?;

            let forward = tokio::spawn(async move {
                while let Some(inbound) = rx.recv().await {
                    let item = match inbound {
                        Inbound::Event(event) => StreamItem::Event(event),
                        Inbound::Eose => StreamItem::Eose,
                        Inbound::Closed(message) => {
                            let _ = sink.send(StreamItem::Closed(message));
                            return;
                        }
                    };
                    if sink.send(item).is_err() {
                        return;
                    }
                }
                // The reader task drops every route when the socket ends.
                let _ = sink.send(StreamItem::Closed("connection dropped".into()));
            });

            Ok(StreamGuard::new(move || {
                forward.abort();
                conn.close_subscription(&subscription_id);
            }))
        })
    }

    fn send<'a>(&'a self, event: &'a Event, timeout: Duration) -> EndpointFuture<'a, SendOutcome> {
        Box::pin(self.send_and_wait(ClientMessage::event(event.clone()), event.id, timeout))
    }

    fn authenticate<'a>(
        &'a self,
        auth: &'a Event,
        timeout: Duration,
    ) -> EndpointFuture<'a, SendOutcome> {
        Box::pin(self.send_and_wait(ClientMessage::auth(auth.clone()), auth.id, timeout))
    }

    fn auth_challenge(&self) -> Option<String> {
        self.challenge.lock().clone()
    }
}
