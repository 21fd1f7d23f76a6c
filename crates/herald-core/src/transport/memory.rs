//! In-memory relay for tests.
//!
//! Implements [`Endpoint`] over a `Vec<Event>` with NIP-01 filter matching, an
//! optional NIP-42 gate, a switch that turns off tag indexing, and counters
//! for concurrency assertions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nostr_sdk::prelude::{Event, Filter, MatchEventOptions};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::endpoint::{
    Endpoint, EndpointError, EndpointFactory, EndpointFuture, FetchOutcome, SendOutcome,
    StreamGuard, StreamItem,
};
use crate::constants::kinds;

#[derive(Debug, Clone)]
pub struct MemoryRelayOptions {
    /// When false, any filter with a `#x` tag condition matches nothing
    pub indexes_tags: bool,
    pub require_auth: bool,
    /// `send` never resolves
    pub hang_on_send: bool,
    pub fail_reads: bool,
    pub read_delay: Duration,
    pub reject_sends: Option<String>,
}

impl Default for MemoryRelayOptions {
    fn default() -> Self {
        Self {
            indexes_tags: true,
            require_auth: false,
            hang_on_send: false,
            fail_reads: false,
            read_delay: Duration::ZERO,
            reject_sends: None,
        }
    }
}

struct LiveStream {
    id: usize,
    filter: Filter,
    sink: mpsc::UnboundedSender<StreamItem>,
}

pub struct MemoryRelay {
    url: String,
    options: Mutex<MemoryRelayOptions>,
    events: Mutex<Vec<Event>>,
    streams: Arc<Mutex<Vec<LiveStream>>>,
    next_stream: AtomicUsize,
    authed: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fetch_calls: AtomicUsize,
    send_calls: AtomicUsize,
}

struct InFlight<'a>(&'a MemoryRelay);

impl<'a> InFlight<'a> {
    fn enter(relay: &'a MemoryRelay) -> Self {
        let now = relay.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        relay.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(relay)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryRelay {
    pub fn new(url: &str) -> Arc<Self> {
        Self::with_options(url, MemoryRelayOptions::default())
    }

    pub fn with_options(url: &str, options: MemoryRelayOptions) -> Arc<Self> {
        Arc::new(Self {
            url: url.to_string(),
            options: Mutex::new(options),
            events: Mutex::new(Vec::new()),
            streams: Arc::new(Mutex::new(Vec::new())),
            next_stream: AtomicUsize::new(0),
            authed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            send_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_options(&self, options: MemoryRelayOptions) {
        *self.options.lock() = options;
    }

    /// Store an event as if it had been published, replacing older
    /// addressable versions, and push it to matching live streams.
    pub fn insert(&self, event: Event) {
        let indexes_tags = self.options.lock().indexes_tags;
        {
            let mut events = self.events.lock();
            if events.iter().any(|e| e.id == event.id) {
                return;
            }
            if is_addressable(&event) {
                let d = tag_value(&event, "d").map(str::to_string);
                events.retain(|e| {
                    !(e.kind == event.kind
                        && e.pubkey == event.pubkey
                        && tag_value(e, "d").map(str::to_string) == d
                        && e.created_at <= event.created_at)
                });
            }
            events.push(event.clone());
        }
        for stream in self.streams.lock().iter() {
            if filter_matches(&stream.filter, &event, indexes_tags) {
                let _ = stream.sink.send(StreamItem::Event(Box::new(event.clone())));
            }
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn live_streams(&self) -> usize {
        self.streams.lock().len()
    }

    /// End every live stream with a `CLOSED` carrying `reason`, as a relay
    /// restart would.
    pub fn close_streams(&self, reason: &str) {
        for stream in self.streams.lock().drain(..) {
            let _ = stream.sink.send(StreamItem::Closed(reason.to_string()));
        }
    }

    /// Streams opened over the relay's lifetime
    pub fn streams_opened(&self) -> usize {
        self.next_stream.load(Ordering::SeqCst)
    }

    fn query(&self, filter: &Filter) -> Vec<Event> {
        let indexes_tags = self.options.lock().indexes_tags;
        let events = self.events.lock();
        let mut matched: Vec<Event> = events
            .iter()
            .filter(|e| filter_matches(filter, e, indexes_tags))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        matched
    }
}

impl Endpoint for MemoryRelay {
    fn url(&self) -> &str {
        &self.url
    }

    fn fetch<'a>(
        &'a self,
        filter: &'a Filter,
        _timeout: Duration,
    ) -> EndpointFuture<'a, FetchOutcome> {
        Box::pin(async move {
            let _guard = InFlight::enter(self);
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            let options = self.options.lock().clone();
            // Always yield so overlapping callers would actually overlap.
            tokio::time::sleep(options.read_delay.max(Duration::from_millis(1))).await;
            if options.fail_reads {
                return Err(EndpointError::Connect {
                    url: self.url.clone(),
                    message: "refused".into(),
                });
            }
            Ok(FetchOutcome {
                events: self.query(filter),
                complete: true,
            })
        })
    }

    fn stream<'a>(
        &'a self,
        filter: &'a Filter,
        sink: mpsc::UnboundedSender<StreamItem>,
    ) -> EndpointFuture<'a, StreamGuard> {
        Box::pin(async move {
            let _guard = InFlight::enter(self);
            for event in self.query(filter) {
                let _ = sink.send(StreamItem::Event(Box::new(event)));
            }
            let _ = sink.send(StreamItem::Eose);

            let id = self.next_stream.fetch_add(1, Ordering::SeqCst);
            self.streams.lock().push(LiveStream {
                id,
                filter: filter.clone(),
                sink,
            });
            let streams = self.streams.clone();
            Ok(StreamGuard::new(move || {
                streams.lock().retain(|s| s.id != id);
            }))
        })
    }

    fn send<'a>(&'a self, event: &'a Event, _timeout: Duration) -> EndpointFuture<'a, SendOutcome> {
        Box::pin(async move {
            let _guard = InFlight::enter(self);
            self.send_calls.fetch_add(1, Ordering::SeqCst);
            let options = self.options.lock().clone();
            if options.hang_on_send {
                futures::future::pending::<()>().await;
            }
            tokio::task::yield_now().await;
            if options.require_auth && !self.authed.load(Ordering::SeqCst) {
                return Ok(SendOutcome::AuthRequired(
                    "auth-required: sign in first".into(),
                ));
            }
            if let Some(reason) = options.reject_sends {
                return Ok(SendOutcome::Rejected(reason));
            }
            self.insert(event.clone());
            Ok(SendOutcome::Accepted)
        })
    }

    fn authenticate<'a>(
        &'a self,
        auth: &'a Event,
        _timeout: Duration,
    ) -> EndpointFuture<'a, SendOutcome> {
        Box::pin(async move {
            let ok = auth.kind.as_u16() == kinds::CLIENT_AUTH
                && auth.verify().is_ok()
                && tag_value(auth, "challenge") == Some(self.challenge().as_str());
            if ok {
                self.authed.store(true, Ordering::SeqCst);
                Ok(SendOutcome::Accepted)
            } else {
                Ok(SendOutcome::Rejected("invalid: bad auth".into()))
            }
        })
    }

    fn auth_challenge(&self) -> Option<String> {
        self.options
            .lock()
            .require_auth
            .then(|| self.challenge())
    }
}

impl MemoryRelay {
    fn challenge(&self) -> String {
        format!("challenge-for-{}", self.url)
    }
}

/// Hands out one shared [`MemoryRelay`] per URL and counts opens.
#[derive(Default)]
pub struct MemoryRelayFactory {
    relays: Mutex<HashMap<String, Arc<MemoryRelay>>>,
    opens: AtomicUsize,
}

impl MemoryRelayFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn relay(&self, url: &str) -> Arc<MemoryRelay> {
        self.relays
            .lock()
            .entry(url.to_string())
            .or_insert_with(|| MemoryRelay::new(url))
            .clone()
    }

    pub fn add(&self, relay: Arc<MemoryRelay>) {
        self.relays.lock().insert(relay.url.clone(), relay);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Reads, streams and sends across every relay
    pub fn total_calls(&self) -> usize {
        self.relays
            .lock()
            .values()
            .map(|r| r.fetch_calls() + r.send_calls() + r.live_streams())
            .sum()
    }

    /// Insert into every relay known to the factory
    pub fn broadcast(&self, event: Event) {
        for relay in self.relays.lock().values() {
            relay.insert(event.clone());
        }
    }
}

impl EndpointFactory for Arc<MemoryRelayFactory> {
    fn open(&self, url: &str) -> Arc<dyn Endpoint> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.relay(url)
    }
}

fn is_addressable(event: &Event) -> bool {
    (30_000..40_000).contains(&event.kind.as_u16())
}

fn tag_value<'a>(event: &'a Event, name: &str) -> Option<&'a str> {
    event.tags.iter().find_map(|tag| {
        let parts = tag.as_slice();
        (parts.first().map(String::as_str) == Some(name))
            .then(|| parts.get(1).map(String::as_str))
            .flatten()
    })
}

/// NIP-01 matching. A relay that does not index tags matches nothing for a
/// filter with tag conditions.
pub(crate) fn filter_matches(filter: &Filter, event: &Event, indexes_tags: bool) -> bool {
    if !indexes_tags && !filter.generic_tags.is_empty() {
        return false;
    }
    filter.match_event(event, MatchEventOptions::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_sdk::prelude::*;

    fn record(keys: &Keys, d: &str, ts: u64) -> Event {
        EventBuilder::new(Kind::from(kinds::LEDGER_RECORD), "x")
            .tag(Tag::identifier(d))
            .custom_created_at(Timestamp::from(ts))
            .sign_with_keys(keys)
            .unwrap()
    }

    #[test]
    fn test_filter_matching() {
        let keys = Keys::generate();
        let event = record(&keys, "mb:index", 1_000);
        let by_d = Filter::new()
            .kind(Kind::from(kinds::LEDGER_RECORD))
            .author(keys.public_key())
            .custom_tag(SingleLetterTag::lowercase(Alphabet::D), "mb:index");
        assert!(filter_matches(&by_d, &event, true));
        assert!(!filter_matches(&by_d, &event, false));

        let too_new = Filter::new().since(Timestamp::from(2_000));
        assert!(!filter_matches(&too_new, &event, true));
    }

    #[test]
    fn test_addressable_replacement() {
        let keys = Keys::generate();
        let relay = MemoryRelay::new("wss://mem");
        relay.insert(record(&keys, "mb:index", 1_000));
        relay.insert(record(&keys, "mb:index", 2_000));
        relay.insert(record(&keys, "mb:other", 1_500));
        let events = relay.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().any(|e| e.created_at.as_u64() == 2_000));
    }
}
