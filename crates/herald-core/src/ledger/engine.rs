//! Revision-gated merge of ledger records.
//!
//! Pure state: records go in through `apply_*`, the sync task asks for the
//! pages still missing and takes a rebuilt snapshot when one is due. The
//! engine never does I/O, which is what lets the permutation tests below
//! drive it directly.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;

use super::history::{HistoryFetch, HistoryState};
use super::records::{HistoryBucket, HistoryPage, Job, LedgerRecord, MailboxIndex, PendingPage};
use crate::keys::PreviewKeyCapsule;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    AwaitingIndex,
    Syncing(u64),
    Complete(u64),
}

/// What the UI renders. Only replaced on commit or history change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerSnapshot {
    pub rev: Option<u64>,
    pub pending: Vec<Job>,
    pub history: Vec<Job>,
    pub counts: BTreeMap<String, u64>,
    pub support: Value,
    pub preview_key_capsules: Vec<PreviewKeyCapsule>,
    pub has_more_pending: bool,
    pub has_more_history: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    /// Higher revision: manifest replaced, syncing from the first page
    Replaced,
    /// Same revision: manifest hashes refreshed
    Refreshed,
    Ignored,
}

/// Committed state worth persisting
#[derive(Debug, Clone)]
pub struct CommittedState {
    pub index: MailboxIndex,
    pub pages: Vec<(String, PendingPage)>,
}

pub struct MergeEngine {
    phase: SyncPhase,
    index: Option<MailboxIndex>,
    /// Every pending page seen, by `d` then declared revision
    candidates: HashMap<String, BTreeMap<u64, PendingPage>>,
    /// Length of the manifest prefix the UI has asked for
    requested: usize,
    /// Accepted pages for the current revision
    working: HashMap<String, PendingPage>,
    committed: Option<CommittedState>,
    history: HistoryState,
    max_staleness: Option<u64>,
    dirty: bool,
    rebuilds: u64,
    snapshot: Arc<LedgerSnapshot>,
}

impl MergeEngine {
    pub fn new(eager_history_buckets: usize, max_staleness: Option<u64>) -> Self {
        Self {
            phase: SyncPhase::Idle,
            index: None,
            candidates: HashMap::new(),
            requested: 0,
            working: HashMap::new(),
            committed: None,
            history: HistoryState::new(eager_history_buckets),
            max_staleness,
            dirty: false,
            rebuilds: 0,
            snapshot: Arc::new(LedgerSnapshot::default()),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// The sync task calls this once it has asked for the index.
    pub fn begin(&mut self) {
        if self.phase == SyncPhase::Idle {
            self.phase = SyncPhase::AwaitingIndex;
        }
    }

    pub fn current_rev(&self) -> Option<u64> {
        self.index.as_ref().map(|i| i.rev)
    }

    pub fn index(&self) -> Option<&MailboxIndex> {
        self.index.as_ref()
    }

    pub fn committed(&self) -> Option<&CommittedState> {
        self.committed.as_ref()
    }

    pub fn history(&self) -> &HistoryState {
        &self.history
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    pub fn snapshot(&self) -> Arc<LedgerSnapshot> {
        self.snapshot.clone()
    }

    pub fn apply(&mut self, record: LedgerRecord) {
        match record {
            LedgerRecord::Index(index) => {
                self.apply_index(index);
            }
            LedgerRecord::Pending { d, page } => self.apply_page(&d, page),
            LedgerRecord::Bucket { id, bucket } => self.apply_bucket(&id, bucket),
            LedgerRecord::History { d, page } => self.apply_history_page(&d, page),
        }
    }

    pub fn apply_index(&mut self, index: MailboxIndex) -> IndexOutcome {
        let outcome = match self.current_rev() {
            Some(current) if index.rev < current => return IndexOutcome::Ignored,
            Some(current) if index.rev == current => {
                let Some(existing) = self.index.as_mut() else {
                    return IndexOutcome::Ignored;
                };
                if existing.pending_pages == index.pending_pages {
                    return IndexOutcome::Ignored;
                }
                existing.pending_pages = index.pending_pages;
                // A page accepted under the old hash may no longer qualify.
                self.working.clear();
                IndexOutcome::Refreshed
            }
            _ => {
                tracing::info!(rev = index.rev, pages = index.pending_pages.len(), "new ledger index");
                self.requested = 1;
                self.working.clear();
                if self.history.set_buckets(&index.buckets) {
                    self.dirty = true;
                }
                self.index = Some(index);
                IndexOutcome::Replaced
            }
        };

        let rev = self.current_rev().unwrap_or_default();
        self.phase = SyncPhase::Syncing(rev);
        let wanted: Vec<String> = self.requested_pages();
        for d in wanted {
            self.evaluate(&d);
        }
        self.try_commit();
        outcome
    }

    pub fn apply_page(&mut self, d: &str, page: PendingPage) {
        let by_rev = self.candidates.entry(d.to_string()).or_default();
        if by_rev.get(&page.rev) == Some(&page) {
            return;
        }
        by_rev.insert(page.rev, page);
        if self.requested_pages().iter().any(|r| r == d) {
            self.evaluate(d);
            self.try_commit();
        }
    }

    pub fn apply_bucket(&mut self, id: &str, bucket: HistoryBucket) {
        if self.history.apply_bucket(id, bucket) {
            self.dirty = true;
        }
    }

    pub fn apply_history_page(&mut self, d: &str, page: HistoryPage) {
        if self.history.apply_page(d, page) {
            self.dirty = true;
        }
    }

    /// Manifest prefix the UI wants, in manifest order
    pub fn requested_pages(&self) -> Vec<String> {
        self.index
            .as_ref()
            .map(|index| {
                index
                    .pending_pages
                    .iter()
                    .take(self.requested)
                    .map(|p| p.d.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Requested pages not yet accepted at the current revision
    pub fn missing_pages(&self) -> Vec<String> {
        self.requested_pages()
            .into_iter()
            .filter(|d| !self.working.contains_key(d))
            .collect()
    }

    /// Ask for one more manifest page. Returns its `d` tag, or `None` when the
    /// manifest is exhausted.
    pub fn load_more_pending(&mut self) -> Option<String> {
        let next = self
            .index
            .as_ref()?
            .pending_pages
            .get(self.requested)?
            .d
            .clone();
        self.requested += 1;
        if let SyncPhase::Complete(rev) = self.phase {
            self.phase = SyncPhase::Syncing(rev);
        }
        self.evaluate(&next);
        self.try_commit();
        Some(next)
    }

    pub fn load_more_history(&mut self, pages: usize) {
        self.history.load_more(pages);
        // has_more_history may have flipped
        self.dirty = true;
    }

    pub fn next_history_fetch(&mut self) -> HistoryFetch {
        self.history.next_fetch()
    }

    pub fn reset_history_requests(&mut self) {
        self.history.reset_requests();
    }

    /// Freshness gate: the exact revision wins; otherwise the newest lower
    /// revision whose items hash to the manifest entry.
    fn select(&self, d: &str) -> Option<&PendingPage> {
        let index = self.index.as_ref()?;
        let rev = index.rev;
        let by_rev = self.candidates.get(d)?;
        if let Some(exact) = by_rev.get(&rev) {
            return Some(exact);
        }
        let expected = index.page_hash(d)?;
        by_rev
            .range(..rev)
            .rev()
            .filter(|(page_rev, _)| {
                self.max_staleness
                    .map_or(true, |max| rev.saturating_sub(**page_rev) <= max)
            })
            .map(|(_, page)| page)
            .find(|page| page.items_hash() == expected)
    }

    fn evaluate(&mut self, d: &str) {
        let Some(selected) = self.select(d).cloned() else {
            return;
        };
        if self.working.get(d) == Some(&selected) {
            return;
        }
        if selected.rev != self.current_rev().unwrap_or_default() {
            tracing::debug!(page = d, declared = selected.rev, "accepting page by hash");
        }
        self.working.insert(d.to_string(), selected.clone());
        if !matches!(self.phase, SyncPhase::Complete(_)) {
            return;
        }
        // Passed the same gate as at commit, so it replaces the committed copy.
        let accepted = selected.rev;
        let Some(committed) = self.committed.as_mut() else {
            return;
        };
        if let Some(slot) = committed.pages.iter_mut().find(|(page_d, _)| page_d == d) {
            slot.1 = selected;
            self.dirty = true;
        }
        self.prune_candidates(d, accepted);
    }

    /// Drop candidates older than the page accepted for `d`; the gate
    /// prefers the newest match, so they can no longer win.
    fn prune_candidates(&mut self, d: &str, accepted: u64) {
        if let Some(by_rev) = self.candidates.get_mut(d) {
            *by_rev = by_rev.split_off(&accepted);
        }
    }

    fn try_commit(&mut self) {
        let SyncPhase::Syncing(rev) = self.phase else {
            return;
        };
        if !self.missing_pages().is_empty() {
            return;
        }
        let Some(index) = self.index.clone() else {
            return;
        };
        let pages: Vec<(String, PendingPage)> = self
            .requested_pages()
            .into_iter()
            .filter_map(|d| self.working.get(&d).cloned().map(|p| (d, p)))
            .collect();
        for (d, page) in &pages {
            self.prune_candidates(d, page.rev);
        }
        tracing::info!(rev, "ledger revision complete");
        self.committed = Some(CommittedState { index, pages });
        self.phase = SyncPhase::Complete(rev);
        self.dirty = true;
    }

    /// Rebuild the snapshot if anything changed since the last one.
    pub fn take_rebuild(&mut self) -> Option<Arc<LedgerSnapshot>> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;

        let mut next = (*self.snapshot).clone();
        if let Some(committed) = &self.committed {
            next.rev = Some(committed.index.rev);
            next.pending = committed.pages.iter().flat_map(|(_, p)| p.jobs()).collect();
            next.counts = committed.index.counts.clone();
            next.support = committed.index.support.clone();
            next.preview_key_capsules = committed.index.preview_key_capsules.clone();
            next.has_more_pending = committed.pages.len() < committed.index.pending_pages.len();
        }
        next.history = self.history.jobs();
        next.has_more_history = self.history.has_more();

        if next == *self.snapshot {
            return None;
        }
        self.rebuilds += 1;
        self.snapshot = Arc::new(next);
        Some(self.snapshot.clone())
    }
}
