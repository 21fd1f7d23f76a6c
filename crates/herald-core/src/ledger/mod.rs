//! The scheduler's job ledger for one mailbox: an encrypted index, pending
//! pages gated by revision, and append-only history buckets.

pub mod cache;
pub mod engine;
pub mod history;
pub mod records;
pub mod sync;

pub use cache::{LedgerCache, LedgerCacheEntry, LEDGER_CACHE_SCHEMA};
pub use engine::{IndexOutcome, LedgerSnapshot, MergeEngine, SyncPhase};
pub use history::{HistoryFetch, HistoryState};
pub use records::{
    canonical_json, decode_record, items_hash, Job, JobKind, JobStatus, LedgerRecord,
    MailboxIndex, PageRef, PendingPage, RecordAddress, RecordError,
};
pub use sync::{LedgerHandle, LedgerSync, LedgerView};
