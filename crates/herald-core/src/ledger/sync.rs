//! Ledger sync task.
//!
//! One task per open ledger owns the [`MergeEngine`]. Live relay events, fetch
//! results and handle commands are all messages into that task, so sync state
//! is never shared. The handle only sees a [`watch`] of [`LedgerView`].

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use nostr_sdk::prelude::{Event, EventId, Filter, Kind, Timestamp};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::cache::{LedgerCache, LedgerCacheEntry};
use super::engine::{LedgerSnapshot, MergeEngine, SyncPhase};
use super::records::{d_tag, decode_record, LedgerRecord, RecordAddress};
use crate::bootstrap::MailboxKeys;
use crate::constants::{kinds, store_keys};
use crate::session::Session;
use crate::storage::LocalStoreExt;
use crate::transport::{relay_set_key, PoolEvent};

/// Event ids remembered for redelivery checks. Records are replaceable, so a
/// forgotten id only costs one more decode that the engine ignores.
pub const SEEN_EVENTS_CAPACITY: usize = 8_192;

/// What a ledger consumer sees
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerView {
    pub phase: SyncPhase,
    /// Requested pending pages not yet accepted at the current revision
    pub missing: usize,
    /// The convergence timeout passed with pages still missing
    pub still_syncing: bool,
    /// The relay set ignores `#d` queries; reads use broad scans
    pub non_indexing: bool,
    /// A relay has served the index since the ledger opened
    pub live: bool,
    /// Last committed snapshot. Not replaced while a newer revision syncs.
    pub snapshot: Arc<LedgerSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FetchPurpose {
    Index,
    /// Broad scan after an identifier query for the index came back empty
    IndexScan,
    Pages(Vec<String>),
    History,
    Scan,
}

enum Input {
    Fetched {
        purpose: FetchPurpose,
        events: Vec<Event>,
    },
    LoadMorePending,
    LoadMoreHistory(oneshot::Sender<bool>),
}

pub struct LedgerSync {
    session: Session,
    keys: MailboxKeys,
    engine: MergeEngine,
    cache: LedgerCache,
    inputs: mpsc::UnboundedSender<Input>,
    view: watch::Sender<LedgerView>,
    relay_set: String,
    non_indexing: bool,
    live: bool,
    still_syncing: bool,
    seen: LruCache<EventId, ()>,
    /// Pages asked for since the last convergence round
    pages_asked: HashSet<String>,
    scan_in_flight: bool,
    convergence_at: Option<Instant>,
    rebuild_at: Option<Instant>,
}

impl LedgerSync {
    /// Spawn the sync task for `keys.mailbox_id`. Must be called inside a
    /// Tokio runtime.
    pub fn start(session: Session, keys: MailboxKeys) -> LedgerHandle {
        let sync_config = &session.config().sync;
        let engine = MergeEngine::new(
            sync_config.eager_history_buckets,
            sync_config.max_page_staleness,
        );
        let relay_set = relay_set_key(session.relays());
        let non_indexing = session
            .store()
            .get_as::<bool>(&store_keys::non_indexing(&relay_set))
            .unwrap_or(false);
        let cache = LedgerCache::new(session.store().clone(), &keys.mailbox_id);

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (view_tx, view_rx) = watch::channel(LedgerView {
            phase: SyncPhase::Idle,
            missing: 0,
            still_syncing: false,
            non_indexing,
            live: false,
            snapshot: engine.snapshot(),
        });

        let sync = Self {
            session,
            keys,
            engine,
            cache,
            inputs: input_tx.clone(),
            view: view_tx,
            relay_set,
            non_indexing,
            live: false,
            still_syncing: false,
            seen: LruCache::new(
                NonZeroUsize::new(SEEN_EVENTS_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            ),
            pages_asked: HashSet::new(),
            scan_in_flight: false,
            convergence_at: None,
            rebuild_at: None,
        };
        let task = tokio::spawn(sync.run(input_rx, cancel_rx));

        LedgerHandle {
            inputs: input_tx,
            view: view_rx,
            cancel: cancel_tx,
            task: Some(task),
        }
    }

    async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<Input>,
        mut cancel: watch::Receiver<bool>,
    ) {
        tracing::info!(
            mailbox = %self.keys.mailbox_id,
            non_indexing = self.non_indexing,
            "opening ledger"
        );
        self.restore();
        self.engine.begin();

        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
        let _subscription =
            self.session
                .pool()
                .subscribe(self.session.relays(), self.live_filter(), relay_tx);
        self.fetch_index();
        self.arm_convergence();

        let mut poll = tokio::time::interval(self.session.config().sync.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately and the index fetch above covers it.
        poll.tick().await;

        self.settle();
        loop {
            let convergence = deadline(self.convergence_at);
            let rebuild = deadline(self.rebuild_at);
            let polling = self.non_indexing;
            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                }
                Some(input) = inputs.recv() => self.handle(input),
                Some(event) = relay_rx.recv() => self.on_relay(event),
                _ = convergence => self.on_convergence_timeout(),
                _ = rebuild => self.rebuild(),
                _ = poll.tick(), if polling => self.scan(FetchPurpose::Scan),
            }
            self.settle();
        }
        tracing::debug!(mailbox = %self.keys.mailbox_id, "ledger closed");
    }

    /// Replay the cached snapshot as ordinary merge input.
    fn restore(&mut self) {
        let Some(entry) = self.cache.load() else {
            return;
        };
        tracing::debug!(rev = entry.index.rev, "replaying cached ledger");
        for record in entry.into_records() {
            self.engine.apply(record);
        }
        self.engine.take_rebuild();
    }

    fn handle(&mut self, input: Input) {
        match input {
            Input::Fetched { purpose, events } => self.on_fetched(purpose, events),
            Input::LoadMorePending => match self.engine.load_more_pending() {
                Some(d) => {
                    tracing::debug!(page = %d, "loading another pending page");
                    if self.convergence_at.is_none() && !self.engine.missing_pages().is_empty() {
                        self.arm_convergence();
                    }
                }
                None => tracing::debug!("pending manifest exhausted"),
            },
            Input::LoadMoreHistory(reply) => {
                let pages = self.session.config().sync.history_pages_per_load;
                self.engine.load_more_history(pages);
                let _ = reply.send(self.engine.history().has_more());
            }
        }
    }

    fn on_relay(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Event { event, .. } => self.ingest(&event),
            PoolEvent::Eose { relay } => tracing::trace!(%relay, "ledger stream caught up"),
            PoolEvent::Closed { relay, reason } => {
                tracing::debug!(%relay, %reason, "ledger stream closed")
            }
        }
    }

    fn on_fetched(&mut self, purpose: FetchPurpose, events: Vec<Event>) {
        match &purpose {
            FetchPurpose::Scan | FetchPurpose::IndexScan => self.scan_in_flight = false,
            FetchPurpose::Pages(pages) => {
                tracing::trace!(pages = pages.len(), events = events.len(), "page fetch done")
            }
            _ => {}
        }
        let index_d = RecordAddress::Index.d_tag(&self.keys.mailbox_id);
        let has_index = events.iter().any(|e| d_tag(e) == Some(index_d.as_str()));
        for event in &events {
            self.ingest(event);
        }

        match purpose {
            FetchPurpose::Index if !has_index && !self.non_indexing => {
                tracing::debug!("index lookup returned nothing, retrying with a broad scan");
                self.scan(FetchPurpose::IndexScan);
            }
            FetchPurpose::IndexScan if has_index => self.mark_non_indexing(),
            // Asked-for records the relays did not have yet: ask again next round.
            FetchPurpose::History
                if self.engine.history().has_outstanding() && self.convergence_at.is_none() =>
            {
                self.arm_convergence();
            }
            _ => {}
        }
    }

    fn ingest(&mut self, event: &Event) {
        if self.seen.put(event.id, ()).is_some() {
            return;
        }
        let record = match decode_record(
            event,
            &self.keys.mailbox_id,
            &self.session.scheduler(),
            self.keys.keys.mailbox(),
        ) {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!(id = %event.id, error = %e, "skipping ledger record");
                return;
            }
        };
        if matches!(record, LedgerRecord::Index(_)) {
            self.live = true;
        }

        let before = self.engine.current_rev();
        self.engine.apply(record);
        if self.engine.current_rev() != before {
            // New revision: every page is wanted again.
            self.still_syncing = false;
            self.pages_asked.clear();
            self.arm_convergence();
        }
    }

    fn on_convergence_timeout(&mut self) {
        self.convergence_at = None;
        if self.engine.history().has_outstanding() {
            tracing::debug!("history records still missing, asking again");
        }
        self.engine.reset_history_requests();
        let missing = self.engine.missing_pages();
        if missing.is_empty() && self.live {
            return;
        }
        if missing.is_empty() {
            tracing::debug!("ledger index not confirmed by any relay yet, asking again");
        } else {
            tracing::warn!(missing = missing.len(), "ledger still syncing");
        }
        self.still_syncing = true;
        self.pages_asked.clear();
        self.fetch_index();
        self.arm_convergence();
    }

    fn rebuild(&mut self) {
        self.rebuild_at = None;
        if self.engine.take_rebuild().is_some() {
            self.persist();
        }
    }

    fn persist(&self) {
        let Some(entry) = LedgerCacheEntry::capture(&self.engine) else {
            return;
        };
        if let Err(e) = self.cache.save(&entry) {
            tracing::warn!(error = %e, "failed to cache ledger snapshot");
        }
    }

    fn mark_non_indexing(&mut self) {
        if self.non_indexing {
            return;
        }
        self.non_indexing = true;
        tracing::info!(
            relays = %self.relay_set,
            "relay set does not index identifiers, switching to broad scans"
        );
        let key = store_keys::non_indexing(&self.relay_set);
        if let Err(e) = self.session.store().put_as(&key, &true) {
            tracing::debug!(error = %e, "failed to remember non-indexing relay set");
        }
    }

    /// Ask for whatever the engine is missing, schedule a rebuild if one is
    /// due and publish the view.
    fn settle(&mut self) {
        self.plan_fetches();
        if self.engine.is_dirty() && self.rebuild_at.is_none() {
            self.rebuild_at = Some(Instant::now() + self.session.config().sync.rebuild_debounce());
        }
        self.publish_view();
    }

    fn plan_fetches(&mut self) {
        let pages: Vec<String> = self
            .engine
            .missing_pages()
            .into_iter()
            .filter(|d| !self.pages_asked.contains(d))
            .collect();
        let history = self.engine.next_history_fetch();
        if pages.is_empty() && history.is_empty() {
            return;
        }
        self.pages_asked.extend(pages.iter().cloned());

        if self.non_indexing {
            self.scan(FetchPurpose::Scan);
            return;
        }
        if !pages.is_empty() {
            let filter = self.record_filter(pages.iter().cloned());
            self.spawn_fetch(FetchPurpose::Pages(pages), filter);
        }
        if !history.is_empty() {
            let mailbox = &self.keys.mailbox_id;
            let addresses: Vec<String> = history
                .buckets
                .iter()
                .map(|id| RecordAddress::Bucket(id.clone()).d_tag(mailbox))
                .chain(history.pages)
                .collect();
            let filter = self.record_filter(addresses);
            self.spawn_fetch(FetchPurpose::History, filter);
        }
    }

    fn fetch_index(&mut self) {
        if self.non_indexing {
            self.scan(FetchPurpose::Scan);
            return;
        }
        let index_d = RecordAddress::Index.d_tag(&self.keys.mailbox_id);
        let filter = self.record_filter([index_d]);
        self.spawn_fetch(FetchPurpose::Index, filter);
    }

    fn scan(&mut self, purpose: FetchPurpose) {
        if self.scan_in_flight {
            return;
        }
        self.scan_in_flight = true;
        let window = self.session.config().sync.broad_scan_window_secs;
        let since = Timestamp::from(Timestamp::now().as_u64().saturating_sub(window));
        let filter = self.scheduler_records().since(since);
        self.spawn_fetch(purpose, filter);
    }

    /// Results arriving after the ledger closed have nowhere to go and are
    /// dropped.
    fn spawn_fetch(&self, purpose: FetchPurpose, filter: Filter) {
        let pool = self.session.pool().clone();
        let relays = self.session.relays().to_vec();
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            let events = pool.fetch_once(&relays, filter).await;
            let _ = inputs.send(Input::Fetched { purpose, events });
        });
    }

    fn publish_view(&mut self) {
        let phase = self.engine.phase();
        if matches!(phase, SyncPhase::Complete(_)) {
            self.still_syncing = false;
        }
        let next = LedgerView {
            phase,
            missing: self.engine.missing_pages().len(),
            still_syncing: self.still_syncing,
            non_indexing: self.non_indexing,
            live: self.live,
            snapshot: self.engine.snapshot(),
        };
        self.view.send_if_modified(move |current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn arm_convergence(&mut self) {
        self.convergence_at =
            Some(Instant::now() + self.session.config().sync.convergence_timeout());
    }

    fn scheduler_records(&self) -> Filter {
        Filter::new()
            .kind(Kind::from(kinds::LEDGER_RECORD))
            .author(self.session.scheduler())
    }

    fn record_filter<I, S>(&self, addresses: I) -> Filter
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scheduler_records().identifiers(addresses)
    }

    /// Live stream of every new record from the scheduler. Broad on purpose:
    /// it keeps working against relays that do not index `d`.
    fn live_filter(&self) -> Filter {
        self.scheduler_records().since(Timestamp::now())
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Handle to a running ledger. Dropping it closes the ledger.
pub struct LedgerHandle {
    inputs: mpsc::UnboundedSender<Input>,
    view: watch::Receiver<LedgerView>,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl LedgerHandle {
    pub fn view(&self) -> LedgerView {
        self.view.borrow().clone()
    }

    pub fn snapshot(&self) -> Arc<LedgerSnapshot> {
        self.view.borrow().snapshot.clone()
    }

    /// Receiver that changes whenever the view does.
    pub fn watch(&self) -> watch::Receiver<LedgerView> {
        self.view.clone()
    }

    /// Extend the requested pending pages by the next manifest entry.
    pub fn load_more_pending(&self) {
        let _ = self.inputs.send(Input::LoadMorePending);
    }

    /// Widen the history walk. Returns whether older history remains.
    pub async fn load_more_history(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.inputs.send(Input::LoadMoreHistory(reply)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Wait until `ready` holds for the view, or give up after `timeout`.
    pub async fn wait_until<F>(&self, timeout: Duration, ready: F) -> Option<LedgerView>
    where
        F: FnMut(&LedgerView) -> bool,
    {
        let mut rx = self.view.clone();
        let result = match tokio::time::timeout(timeout, rx.wait_for(ready)).await {
            Ok(Ok(view)) => Some(view.clone()),
            _ => None,
        };
        result
    }

    /// Wait for a relay-confirmed revision to be committed and rendered.
    pub async fn wait_for_complete(&self, timeout: Duration) -> Option<LedgerView> {
        self.wait_until(timeout, |view| match view.phase {
            SyncPhase::Complete(rev) => view.live && view.snapshot.rev == Some(rev),
            _ => false,
        })
        .await
    }

    /// Cancel live subscriptions and retries and wait for the task to stop.
    /// In-flight fetches finish on their own; their results are discarded.
    pub async fn close(mut self) {
        let _ = self.cancel.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for LedgerHandle {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{MasterKeySet, RootSecret};
    use crate::ledger::records::fixtures::{index, pending, record_event};
    use crate::ledger::records::{BucketPageRef, HistoryBucket, HistoryPage, MailboxIndex, PendingPage};
    use crate::session::testing::{signing_session, RELAYS};
    use crate::transport::memory::{MemoryRelay, MemoryRelayFactory, MemoryRelayOptions};
    use nostr_sdk::prelude::Keys;
    use serde::Serialize;
    use serde_json::json;

    const MAILBOX: &str = "mb-test";
    const WAIT: Duration = Duration::from_secs(3);
    const OLD: u64 = 1_700_000_000;

    struct Fixture {
        scheduler: Keys,
        keys: MailboxKeys,
        factory: Arc<MemoryRelayFactory>,
        session: Session,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_factory(MemoryRelayFactory::new())
        }

        fn with_factory(factory: Arc<MemoryRelayFactory>) -> Self {
            let scheduler = Keys::generate();
            let session = signing_session(&Keys::generate(), &scheduler, &factory);
            let keys = MailboxKeys {
                mailbox_id: MAILBOX.to_string(),
                keys: MasterKeySet::derive(RootSecret::generate()).unwrap(),
            };
            Self {
                scheduler,
                keys,
                factory,
                session,
            }
        }

        fn record<T: Serialize>(&self, d: &str, body: &T, created_at: u64) -> Event {
            record_event(&self.scheduler, self.keys.keys.mailbox(), d, body, created_at)
        }

        /// Store a record on every relay without touching live streams.
        fn seed<T: Serialize>(&self, d: &str, body: &T, created_at: u64) {
            let event = self.record(d, body, created_at);
            for url in RELAYS {
                self.factory.relay(url).insert(event.clone());
            }
        }

        fn seed_index(&self, index: &MailboxIndex, created_at: u64) {
            self.seed(&format!("{}:index", MAILBOX), index, created_at);
        }

        fn seed_page(&self, d: &str, page: &PendingPage, created_at: u64) {
            self.seed(d, page, created_at);
        }

        fn start(&self) -> LedgerHandle {
            LedgerSync::start(self.session.clone(), self.keys.clone())
        }
    }

    fn now() -> u64 {
        Timestamp::now().as_u64()
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn pending_ids(view: &LedgerView) -> Vec<String> {
        view.snapshot.pending.iter().map(|j| j.id.clone()).collect()
    }

    #[tokio::test]
    async fn test_initial_sync_commits_and_caches() {
        let fx = Fixture::new();
        let p1 = pending(1, &["a", "b"]);
        fx.seed_index(&index(1, &[("p1", &p1)]), OLD);
        fx.seed_page("p1", &p1, OLD);

        let ledger = fx.start();
        let view = ledger.wait_for_complete(WAIT).await.unwrap();
        assert_eq!(view.phase, SyncPhase::Complete(1));
        assert_eq!(pending_ids(&view), vec!["a", "b"]);
        assert!(!view.non_indexing);

        let cached = LedgerCache::new(fx.session.store().clone(), MAILBOX)
            .load()
            .unwrap();
        assert_eq!(cached.index.rev, 1);
        ledger.close().await;
    }

    #[tokio::test]
    async fn test_new_revision_arrives_over_live_stream() {
        let fx = Fixture::new();
        let p1 = pending(1, &["a"]);
        fx.seed_index(&index(1, &[("p1", &p1)]), OLD);
        fx.seed_page("p1", &p1, OLD);

        let ledger = fx.start();
        ledger.wait_for_complete(WAIT).await.unwrap();
        eventually(|| RELAYS.iter().all(|u| fx.factory.relay(u).live_streams() == 1)).await;

        let p1 = pending(2, &["a", "c"]);
        let ts = now();
        fx.factory.broadcast(fx.record("p1", &p1, ts));
        fx.factory
            .broadcast(fx.record(&format!("{}:index", MAILBOX), &index(2, &[("p1", &p1)]), ts));

        let view = ledger
            .wait_until(WAIT, |v| v.snapshot.rev == Some(2))
            .await
            .unwrap();
        assert_eq!(pending_ids(&view), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_missing_page_is_retried_until_it_appears() {
        let fx = Fixture::new();
        let p1 = pending(1, &["a"]);
        fx.seed_index(&index(1, &[("p1", &p1)]), OLD);

        let ledger = fx.start();
        let view = ledger
            .wait_until(WAIT, |v| v.still_syncing)
            .await
            .unwrap();
        assert_eq!(view.phase, SyncPhase::Syncing(1));
        assert_eq!(view.missing, 1);
        assert_eq!(view.snapshot.rev, None);

        // Old timestamp: only a re-fetch can find it, not the live stream.
        fx.seed_page("p1", &p1, OLD);
        let view = ledger.wait_for_complete(WAIT).await.unwrap();
        assert!(!view.still_syncing);
        assert_eq!(pending_ids(&view), vec!["a"]);
    }

    #[tokio::test]
    async fn test_lower_revision_page_with_matching_hash_commits() {
        let fx = Fixture::new();
        let p1_old = pending(4, &["a"]);
        fx.seed_index(&index(5, &[("p1", &p1_old)]), OLD);
        fx.seed_page("p1", &p1_old, OLD);

        let ledger = fx.start();
        let view = ledger.wait_for_complete(WAIT).await.unwrap();
        assert_eq!(view.phase, SyncPhase::Complete(5));
        assert_eq!(pending_ids(&view), vec!["a"]);
    }

    #[tokio::test]
    async fn test_non_indexing_relay_set_falls_back_to_scans() {
        let factory = MemoryRelayFactory::new();
        for url in RELAYS {
            factory.add(MemoryRelay::with_options(
                url,
                MemoryRelayOptions {
                    indexes_tags: false,
                    ..MemoryRelayOptions::default()
                },
            ));
        }
        let fx = Fixture::with_factory(factory);
        let p1 = pending(1, &["a"]);
        let ts = now().saturating_sub(60);
        fx.seed_index(&index(1, &[("p1", &p1)]), ts);
        fx.seed_page("p1", &p1, ts);

        let ledger = fx.start();
        let view = ledger.wait_for_complete(WAIT).await.unwrap();
        assert!(view.non_indexing);
        assert_eq!(pending_ids(&view), vec!["a"]);

        let key = store_keys::non_indexing(&relay_set_key(fx.session.relays()));
        assert_eq!(fx.session.store().get_as::<bool>(&key), Some(true));
    }

    #[tokio::test]
    async fn test_load_more_pending_extends_the_list() {
        let fx = Fixture::new();
        let p1 = pending(1, &["a"]);
        let p2 = pending(1, &["b"]);
        fx.seed_index(&index(1, &[("p1", &p1), ("p2", &p2)]), OLD);
        fx.seed_page("p1", &p1, OLD);
        fx.seed_page("p2", &p2, OLD);

        let ledger = fx.start();
        let view = ledger.wait_for_complete(WAIT).await.unwrap();
        assert_eq!(pending_ids(&view), vec!["a"]);
        assert!(view.snapshot.has_more_pending);

        ledger.load_more_pending();
        let view = ledger
            .wait_until(WAIT, |v| v.snapshot.pending.len() == 2)
            .await
            .unwrap();
        assert_eq!(pending_ids(&view), vec!["a", "b"]);
        assert!(!view.snapshot.has_more_pending);
    }

    #[tokio::test]
    async fn test_history_backfill_walks_buckets() {
        let fx = Fixture::new();
        let mut idx = index(1, &[]);
        idx.buckets = vec!["2024-06".into(), "2024-05".into()];
        fx.seed_index(&idx, OLD);

        let bucket = |pages: &[&str]| HistoryBucket {
            pages: pages
                .iter()
                .enumerate()
                .map(|(i, d)| BucketPageRef {
                    page: i.to_string(),
                    d: d.to_string(),
                })
                .collect(),
        };
        let page = |id: &str| HistoryPage {
            items: vec![json!({
                "id": id,
                "type": "note",
                "scheduledAt": OLD,
                "updatedAt": OLD,
                "status": "published",
                "summary": id
            })],
        };
        fx.seed(&format!("{}:bucket:2024-06", MAILBOX), &bucket(&["h6"]), OLD);
        fx.seed(&format!("{}:bucket:2024-05", MAILBOX), &bucket(&["h5a", "h5b"]), OLD);
        fx.seed("h6", &page("june"), OLD);
        fx.seed("h5a", &page("may-1"), OLD);
        fx.seed("h5b", &page("may-2"), OLD);

        let ledger = fx.start();
        let view = ledger
            .wait_until(WAIT, |v| v.snapshot.history.len() == 1)
            .await
            .unwrap();
        assert_eq!(view.snapshot.history[0].id, "june");
        assert!(view.snapshot.has_more_history);

        // The older bucket's page list is not known yet.
        assert!(ledger.load_more_history().await);
        let view = ledger
            .wait_until(WAIT, |v| v.snapshot.history.len() == 3)
            .await
            .unwrap();
        let ids: Vec<&str> = view.snapshot.history.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["june", "may-1", "may-2"]);
        assert!(!view.snapshot.has_more_history);
    }

    #[tokio::test]
    async fn test_history_published_after_complete_is_fetched() {
        let fx = Fixture::new();
        let mut idx = index(1, &[]);
        idx.buckets = vec!["2024-07".into()];
        fx.seed_index(&idx, OLD);

        let ledger = fx.start();
        let view = ledger.wait_for_complete(WAIT).await.unwrap();
        assert!(view.snapshot.history.is_empty());
        assert!(view.snapshot.has_more_history);

        // Let the first bucket lookup come back empty before the records land.
        tokio::time::sleep(Duration::from_millis(100)).await;
        fx.seed(
            &format!("{}:bucket:2024-07", MAILBOX),
            &HistoryBucket {
                pages: vec![BucketPageRef {
                    page: "0".into(),
                    d: "h7".into(),
                }],
            },
            OLD,
        );
        fx.seed(
            "h7",
            &HistoryPage {
                items: vec![json!({
                    "id": "july",
                    "type": "note",
                    "scheduledAt": OLD,
                    "updatedAt": OLD,
                    "status": "published",
                    "summary": "july"
                })],
            },
            OLD,
        );

        let view = ledger
            .wait_until(WAIT, |v| v.snapshot.history.len() == 1)
            .await
            .unwrap();
        assert_eq!(view.snapshot.history[0].id, "july");
        assert!(!view.snapshot.has_more_history);
    }

    #[tokio::test]
    async fn test_revision_after_relay_closes_stream_still_arrives() {
        let fx = Fixture::new();
        let p1 = pending(1, &["a"]);
        fx.seed_index(&index(1, &[("p1", &p1)]), OLD);
        fx.seed_page("p1", &p1, OLD);

        let ledger = fx.start();
        ledger.wait_for_complete(WAIT).await.unwrap();
        eventually(|| RELAYS.iter().all(|u| fx.factory.relay(u).live_streams() == 1)).await;

        for url in RELAYS {
            fx.factory.relay(url).close_streams("error: shutting down");
        }
        eventually(|| {
            RELAYS.iter().all(|u| {
                let relay = fx.factory.relay(u);
                relay.streams_opened() >= 2 && relay.live_streams() == 1
            })
        })
        .await;

        let p1 = pending(2, &["b"]);
        let ts = now();
        fx.factory.broadcast(fx.record("p1", &p1, ts));
        fx.factory
            .broadcast(fx.record(&format!("{}:index", MAILBOX), &index(2, &[("p1", &p1)]), ts));

        let view = ledger
            .wait_until(WAIT, |v| v.snapshot.rev == Some(2))
            .await
            .unwrap();
        assert_eq!(pending_ids(&view), vec!["b"]);
    }

    #[tokio::test]
    async fn test_cached_snapshot_is_shown_before_relays_answer() {
        let factory = MemoryRelayFactory::new();
        for url in RELAYS {
            factory.add(MemoryRelay::with_options(
                url,
                MemoryRelayOptions {
                    fail_reads: true,
                    ..MemoryRelayOptions::default()
                },
            ));
        }
        let fx = Fixture::with_factory(factory);
        let p1 = pending(7, &["cached"]);
        let entry = LedgerCacheEntry {
            schema: super::super::cache::LEDGER_CACHE_SCHEMA,
            index: index(7, &[("p1", &p1)]),
            pages: vec![("p1".into(), p1)],
            buckets: Vec::new(),
            history: Vec::new(),
        };
        LedgerCache::new(fx.session.store().clone(), MAILBOX)
            .save(&entry)
            .unwrap();

        let ledger = fx.start();
        let view = ledger
            .wait_until(WAIT, |v| v.snapshot.rev == Some(7))
            .await
            .unwrap();
        assert_eq!(pending_ids(&view), vec!["cached"]);
        assert!(!view.live);
        assert!(ledger.wait_for_complete(Duration::from_millis(300)).await.is_none());
    }

    #[tokio::test]
    async fn test_close_tears_down_live_streams() {
        let fx = Fixture::new();
        let ledger = fx.start();
        eventually(|| RELAYS.iter().all(|u| fx.factory.relay(u).live_streams() == 1)).await;
        assert_eq!(fx.factory.relay(RELAYS[0]).live_streams(), 1);
        ledger.close().await;

        eventually(|| RELAYS.iter().all(|u| fx.factory.relay(u).live_streams() == 0)).await;
        for url in RELAYS {
            assert_eq!(fx.factory.relay(url).live_streams(), 0);
        }
    }
}
