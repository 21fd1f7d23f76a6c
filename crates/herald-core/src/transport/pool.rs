//! Relay pool: ranked reads, live subscriptions and quorum writes.
//!
//! Every operation against a relay first takes that relay's single-permit
//! queue, so at most one request is outstanding per relay and the rest wait
//! in FIFO order. Reads are ordered by [`HealthTable::rank`]; writes go to all
//! relays and resolve as soon as enough of them acknowledge. Live streams a
//! relay ends are reopened with backoff until the subscription is dropped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{FuturesUnordered, StreamExt};
use nostr_sdk::prelude::{Alphabet, Event, EventId, Filter, JsonUtil, SingleLetterTag};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use super::endpoint::{Endpoint, EndpointFactory, SendOutcome, StreamItem, WsEndpointFactory};
use super::health::{EndpointHealth, HealthTable};
use crate::config::PoolConfig;

/// Answers a relay's NIP-42 challenge with a signed kind-22242 event.
pub trait ChallengeResponder: Send + Sync {
    fn respond<'a>(
        &'a self,
        relay_url: &'a str,
        challenge: &'a str,
    ) -> BoxFuture<'a, Result<Event, String>>;
}

/// Messages a subscription delivers to its sink
#[derive(Debug, Clone)]
pub enum PoolEvent {
    Event { relay: String, event: Box<Event> },
    Eose { relay: String },
    Closed { relay: String, reason: String },
}

#[derive(Clone)]
pub struct PublishOptions {
    pub success_ratio: f64,
    pub responder: Option<Arc<dyn ChallengeResponder>>,
}

impl PublishOptions {
    pub fn new(success_ratio: f64) -> Self {
        Self {
            success_ratio,
            responder: None,
        }
    }

    pub fn with_responder(mut self, responder: Arc<dyn ChallengeResponder>) -> Self {
        self.responder = Some(responder);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RelayFailure {
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishError {
    #[error("No relays to publish to")]
    NoRelays,
    #[error("Publish reached {acks} of {needed} required acknowledgements")]
    QuorumNotReached {
        acks: usize,
        needed: usize,
        failures: Vec<RelayFailure>,
    },
}

/// Acks needed out of `relays`: nearest integer to `relays * ratio`, at least
/// one and at most every relay.
pub fn quorum(relays: usize, ratio: f64) -> usize {
    if relays == 0 {
        return 0;
    }
    ((relays as f64 * ratio).round() as usize).clamp(1, relays)
}

/// Stable key for a relay set, independent of order and duplicates
pub fn relay_set_key(relays: &[String]) -> String {
    let mut sorted: Vec<&str> = relays.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    sorted.join(",")
}

/// Identifier-keyed filters (`ids` or `#d`) hit at most a few records.
fn is_narrow(filter: &Filter) -> bool {
    filter.ids.is_some()
        || filter
            .generic_tags
            .contains_key(&SingleLetterTag::lowercase(Alphabet::D))
}

fn dedup_key(relays: &[String], filter: &Filter) -> String {
    format!("{}|{}", relay_set_key(relays), filter.as_json())
}

/// How a live stream ended
enum StreamEnd {
    /// The relay closed it or the connection dropped
    Relay { reason: String, delivered: bool },
    /// Nobody is listening any more
    SinkGone,
}

type SharedFetch = Shared<BoxFuture<'static, Arc<Vec<Event>>>>;

struct InFlightFetch {
    started: Instant,
    fut: SharedFetch,
}

struct Slot {
    endpoint: Arc<dyn Endpoint>,
    queue: Arc<Semaphore>,
}

struct PoolInner {
    config: PoolConfig,
    factory: Box<dyn EndpointFactory>,
    slots: Mutex<HashMap<String, Slot>>,
    health: Mutex<HealthTable>,
    inflight: Mutex<HashMap<String, InFlightFetch>>,
}

/// Session-owned relay pool; clones share connections, queues and health.
#[derive(Clone)]
pub struct TransportPool {
    inner: Arc<PoolInner>,
}

/// Keeps a subscription's per-relay tasks alive; dropping it closes them.
pub struct SubscriptionHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl SubscriptionHandle {
    /// Dropping aborts every relay task, which closes their streams.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl TransportPool {
    pub fn new(config: PoolConfig, factory: Box<dyn EndpointFactory>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                slots: Mutex::new(HashMap::new()),
                health: Mutex::new(HealthTable::new()),
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Pool over real WebSocket relays
    pub fn websocket(config: PoolConfig) -> Self {
        let factory = WsEndpointFactory::new(config.connect_timeout());
        Self::new(config, Box::new(factory))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn health_snapshot(&self) -> Vec<(String, EndpointHealth)> {
        self.inner.health.lock().snapshot()
    }

    pub fn rank(&self, relays: &[String]) -> Vec<String> {
        self.inner.health.lock().rank(relays, Instant::now())
    }

    fn slot(&self, url: &str) -> (Arc<dyn Endpoint>, Arc<Semaphore>) {
        let mut slots = self.inner.slots.lock();
        let slot = slots.entry(url.to_string()).or_insert_with(|| Slot {
            endpoint: self.inner.factory.open(url),
            queue: Arc::new(Semaphore::new(1)),
        });
        (slot.endpoint.clone(), slot.queue.clone())
    }

    /// Bounded read across `relays`. Identical calls made while one is still
    /// running, or within the dedup window after it started, share its result.
    pub async fn fetch_once(&self, relays: &[String], filter: Filter) -> Vec<Event> {
        if relays.is_empty() {
            return Vec::new();
        }
        let key = dedup_key(relays, &filter);
        let window = self.inner.config.dedup_window();

        let fut = {
            let mut inflight = self.inner.inflight.lock();
            inflight.retain(|_, f| f.fut.peek().is_none() || f.started.elapsed() < window);
            match inflight.get(&key) {
                Some(existing) => {
                    tracing::trace!("joining in-flight fetch");
                    existing.fut.clone()
                }
                None => {
                    let pool = self.clone();
                    let relays = relays.to_vec();
                    let fut: BoxFuture<'static, Arc<Vec<Event>>> = Box::pin(async move {
                        Arc::new(pool.fetch_ranked(&relays, &filter).await)
                    });
                    let shared = fut.shared();
                    inflight.insert(
                        key,
                        InFlightFetch {
                            started: Instant::now(),
                            fut: shared.clone(),
                        },
                    );
                    shared
                }
            }
        };

        fut.await.as_ref().clone()
    }

    async fn fetch_ranked(&self, relays: &[String], filter: &Filter) -> Vec<Event> {
        let narrow = is_narrow(filter);
        let ranked = self.rank(relays);
        let config = &self.inner.config;
        let fanout = if narrow {
            config.narrow_fanout
        } else {
            config.broad_fanout
        }
        .max(1)
        .min(ranked.len());
        let (primary, secondary) = ranked.split_at(fanout);

        let (events, any_succeeded) = self.query_group(primary, filter).await;
        if !events.is_empty() || secondary.is_empty() || (any_succeeded && !narrow) {
            return events;
        }

        tracing::debug!(
            relays = secondary.len(),
            narrow,
            "primary relays returned nothing, querying the rest"
        );
        self.query_group(secondary, filter).await.0
    }

    async fn query_group(&self, relays: &[String], filter: &Filter) -> (Vec<Event>, bool) {
        let results =
            futures::future::join_all(relays.iter().map(|url| self.query_one(url, filter))).await;

        let mut seen = HashSet::new();
        let mut events = Vec::new();
        let mut any_succeeded = false;
        for result in results.into_iter().flatten() {
            any_succeeded = true;
            for event in result {
                if seen.insert(event.id) {
                    events.push(event);
                }
            }
        }
        (events, any_succeeded)
    }

    /// `None` when the relay failed; failures are soft and only touch health.
    async fn query_one(&self, url: &str, filter: &Filter) -> Option<Vec<Event>> {
        let (endpoint, queue) = self.slot(url);
        let _permit = queue.acquire().await.ok()?;

        let config = &self.inner.config;
        let limit = config.read_timeout() + config.connect_timeout();
        let started = Instant::now();
        let result = tokio::time::timeout(limit, endpoint.fetch(filter, config.read_timeout())).await;

        match result {
            Ok(Ok(outcome)) => {
                self.inner
                    .health
                    .lock()
                    .record_success(url, started.elapsed());
                if !outcome.complete {
                    tracing::debug!(relay = %url, count = outcome.events.len(), "partial read");
                }
                Some(outcome.events)
            }
            Ok(Err(e)) => {
                self.inner.health.lock().record_failure(url);
                tracing::debug!(relay = %url, error = %e, "read failed");
                None
            }
            Err(_) => {
                self.inner.health.lock().record_failure(url);
                tracing::debug!(relay = %url, "read timed out");
                None
            }
        }
    }

    /// Open one live stream per relay, forwarding into `sink` until the
    /// returned handle is closed or dropped. Each relay's stream is reopened
    /// after it ends; `PoolEvent::Closed` reports every interruption.
    pub fn subscribe(
        &self,
        relays: &[String],
        filter: Filter,
        sink: mpsc::UnboundedSender<PoolEvent>,
    ) -> SubscriptionHandle {
        let tasks = relays
            .iter()
            .map(|url| {
                let pool = self.clone();
                let url = url.clone();
                let filter = filter.clone();
                let sink = sink.clone();
                tokio::spawn(async move { pool.run_stream(url, filter, sink).await })
            })
            .collect();
        SubscriptionHandle { tasks }
    }

    async fn run_stream(&self, url: String, filter: Filter, sink: mpsc::UnboundedSender<PoolEvent>) {
        let mut attempt: u32 = 0;
        loop {
            let reason = match self.stream_once(&url, &filter, &sink).await {
                StreamEnd::SinkGone => return,
                StreamEnd::Relay { reason, delivered } => {
                    if delivered {
                        attempt = 0;
                    }
                    reason
                }
            };
            if sink
                .send(PoolEvent::Closed {
                    relay: url.clone(),
                    reason: reason.clone(),
                })
                .is_err()
            {
                return;
            }
            let delay = self.inner.config.resubscribe_delay(attempt);
            attempt = attempt.saturating_add(1);
            tracing::debug!(relay = %url, %reason, ?delay, "live stream ended, reopening");
            tokio::time::sleep(delay).await;
        }
    }

    async fn stream_once(
        &self,
        url: &str,
        filter: &Filter,
        sink: &mpsc::UnboundedSender<PoolEvent>,
    ) -> StreamEnd {
        let (endpoint, queue) = self.slot(url);
        let (tx, mut rx) = mpsc::unbounded_channel();

        // The queue is only held while the stream is being opened.
        let opened = {
            let Ok(_permit) = queue.acquire().await else {
                return StreamEnd::SinkGone;
            };
            tokio::time::timeout(self.inner.config.connect_timeout(), endpoint.stream(filter, tx))
                .await
        };
        let _guard = match opened {
            Ok(Ok(guard)) => guard,
            Ok(Err(e)) => {
                self.inner.health.lock().record_failure(url);
                return StreamEnd::Relay {
                    reason: e.to_string(),
                    delivered: false,
                };
            }
            Err(_) => {
                self.inner.health.lock().record_failure(url);
                return StreamEnd::Relay {
                    reason: "timed out opening stream".into(),
                    delivered: false,
                };
            }
        };

        let mut delivered = false;
        loop {
            let message = match rx.recv().await {
                Some(StreamItem::Event(event)) => {
                    self.inner.health.lock().record_delivery(url);
                    PoolEvent::Event {
                        relay: url.to_string(),
                        event,
                    }
                }
                Some(StreamItem::Eose) => {
                    delivered = true;
                    PoolEvent::Eose {
                        relay: url.to_string(),
                    }
                }
                Some(StreamItem::Closed(reason)) => return StreamEnd::Relay { reason, delivered },
                None => {
                    return StreamEnd::Relay {
                        reason: "connection dropped".into(),
                        delivered,
                    }
                }
            };
            if sink.send(message).is_err() {
                return StreamEnd::SinkGone;
            }
        }
    }

    /// Send `event` to every relay and resolve once the quorum acknowledges.
    /// Relays still working when the quorum is met keep going in the
    /// background. Failures are reported together, once every relay is done.
    pub async fn publish(
        &self,
        relays: &[String],
        event: &Event,
        options: PublishOptions,
    ) -> Result<EventId, PublishError> {
        if relays.is_empty() {
            return Err(PublishError::NoRelays);
        }
        let needed = quorum(relays.len(), options.success_ratio);

        let mut pending: FuturesUnordered<_> = relays
            .iter()
            .map(|url| {
                let pool = self.clone();
                let event = event.clone();
                let responder = options.responder.clone();
                let task_url = url.clone();
                let handle = tokio::spawn(async move {
                    pool.publish_one(&task_url, &event, responder).await
                });
                let url = url.clone();
                async move { (url, handle.await) }
            })
            .collect();

        let mut acks = 0;
        let mut failures = Vec::new();
        while let Some((url, joined)) = pending.next().await {
            match joined {
                Ok(Ok(())) => {
                    acks += 1;
                    if acks >= needed {
                        tracing::debug!(id = %event.id, acks, needed, "publish reached quorum");
                        return Ok(event.id);
                    }
                }
                Ok(Err(reason)) => failures.push(RelayFailure { url, reason }),
                Err(e) => failures.push(RelayFailure {
                    url,
                    reason: e.to_string(),
                }),
            }
        }

        tracing::warn!(id = %event.id, acks, needed, "publish did not reach quorum");
        Err(PublishError::QuorumNotReached {
            acks,
            needed,
            failures,
        })
    }

    async fn publish_one(
        &self,
        url: &str,
        event: &Event,
        responder: Option<Arc<dyn ChallengeResponder>>,
    ) -> Result<(), String> {
        let (endpoint, queue) = self.slot(url);
        let _permit = queue.acquire().await.map_err(|e| e.to_string())?;
        let started = Instant::now();

        let result = match self.send_once(endpoint.as_ref(), event).await {
            Ok(SendOutcome::Accepted) => Ok(()),
            Ok(SendOutcome::Rejected(reason)) => Err(reason),
            Ok(SendOutcome::AuthRequired(message)) => {
                match (responder, endpoint.auth_challenge()) {
                    (Some(responder), Some(challenge)) => {
                        self.authenticate_and_resend(
                            endpoint.as_ref(),
                            responder.as_ref(),
                            &challenge,
                            event,
                        )
                        .await
                    }
                    _ => Err(message),
                }
            }
            Err(reason) => Err(reason),
        };

        let mut health = self.inner.health.lock();
        match &result {
            Ok(()) => health.record_success(url, started.elapsed()),
            Err(reason) => {
                health.record_failure(url);
                tracing::debug!(relay = %url, %reason, "publish failed");
            }
        }
        result
    }

    async fn send_once(&self, endpoint: &dyn Endpoint, event: &Event) -> Result<SendOutcome, String> {
        let timeout = self.inner.config.publish_timeout();
        match tokio::time::timeout(timeout, endpoint.send(event, timeout)).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", timeout)),
        }
    }

    async fn authenticate_and_resend(
        &self,
        endpoint: &dyn Endpoint,
        responder: &dyn ChallengeResponder,
        challenge: &str,
        event: &Event,
    ) -> Result<(), String> {
        let config = &self.inner.config;
        let auth = tokio::time::timeout(
            config.challenge_timeout(),
            responder.respond(endpoint.url(), challenge),
        )
        .await
        .map_err(|_| "auth challenge timed out".to_string())??;

        let timeout = config.publish_timeout();
        match tokio::time::timeout(timeout, endpoint.authenticate(&auth, timeout)).await {
            Ok(Ok(SendOutcome::Accepted)) => {
                tracing::debug!(relay = %endpoint.url(), "authenticated");
            }
            Ok(Ok(SendOutcome::Rejected(reason) | SendOutcome::AuthRequired(reason))) => {
                return Err(format!("auth rejected: {}", reason));
            }
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err(format!("auth timed out after {:?}", timeout)),
        }

        match self.send_once(endpoint, event).await? {
            SendOutcome::Accepted => Ok(()),
            SendOutcome::Rejected(reason) | SendOutcome::AuthRequired(reason) => Err(reason),
        }
    }
}
