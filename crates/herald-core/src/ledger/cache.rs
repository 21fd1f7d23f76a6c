//! Last committed ledger state, persisted so the next start has something to
//! show before the relays answer. Replayed as ordinary merge input, so a stale
//! or partial cache can never override what the relays say.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::engine::MergeEngine;
use super::records::{HistoryBucket, HistoryPage, LedgerRecord, MailboxIndex, PendingPage};
use crate::constants::store_keys;
use crate::storage::{LocalStore, LocalStoreExt, StoreError};

/// Bump when the cached shape changes; older entries are dropped.
pub const LEDGER_CACHE_SCHEMA: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerCacheEntry {
    pub schema: u32,
    pub index: MailboxIndex,
    pub pages: Vec<(String, PendingPage)>,
    #[serde(default)]
    pub buckets: Vec<(String, HistoryBucket)>,
    #[serde(default)]
    pub history: Vec<(String, HistoryPage)>,
}

impl LedgerCacheEntry {
    /// `None` until a revision has been committed.
    pub fn capture(engine: &MergeEngine) -> Option<Self> {
        let committed = engine.committed()?;
        let history = engine.history();
        Some(Self {
            schema: LEDGER_CACHE_SCHEMA,
            index: committed.index.clone(),
            pages: committed.pages.clone(),
            buckets: history
                .loaded_buckets()
                .map(|(id, b)| (id.clone(), b.clone()))
                .collect(),
            history: history
                .loaded_pages()
                .map(|(d, p)| (d.clone(), p.clone()))
                .collect(),
        })
    }

    pub fn into_records(self) -> Vec<LedgerRecord> {
        let mut records = vec![LedgerRecord::Index(self.index)];
        records.extend(
            self.pages
                .into_iter()
                .map(|(d, page)| LedgerRecord::Pending { d, page }),
        );
        records.extend(
            self.buckets
                .into_iter()
                .map(|(id, bucket)| LedgerRecord::Bucket { id, bucket }),
        );
        records.extend(
            self.history
                .into_iter()
                .map(|(d, page)| LedgerRecord::History { d, page }),
        );
        records
    }
}

pub struct LedgerCache {
    store: Arc<dyn LocalStore>,
    key: String,
}

impl LedgerCache {
    pub fn new(store: Arc<dyn LocalStore>, mailbox: &str) -> Self {
        Self {
            store,
            key: store_keys::ledger(mailbox),
        }
    }

    pub fn load(&self) -> Option<LedgerCacheEntry> {
        let entry: LedgerCacheEntry = self.store.get_as(&self.key)?;
        if entry.schema != LEDGER_CACHE_SCHEMA {
            tracing::debug!(found = entry.schema, "dropping ledger cache with old schema");
            let _ = self.store.remove(&self.key);
            return None;
        }
        Some(entry)
    }

    pub fn save(&self, entry: &LedgerCacheEntry) -> Result<(), StoreError> {
        self.store.put_as(&self.key, entry)
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.store.remove(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::engine::SyncPhase;
    use crate::ledger::records::fixtures::{index, pending};
    use crate::storage::{JsonFileStore, MemoryStore};
    use serde_json::json;

    fn committed_engine() -> MergeEngine {
        let p1 = pending(3, &["a", "b"]);
        let mut engine = MergeEngine::new(1, None);
        engine.begin();
        engine.apply_index(index(3, &[("p1", &p1)]));
        engine.apply_page("p1", p1);
        engine.take_rebuild();
        engine
    }

    #[test]
    fn test_replay_restores_committed_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LedgerCache::new(Arc::new(JsonFileStore::new(dir.path())), "mb");
        let entry = LedgerCacheEntry::capture(&committed_engine()).unwrap();
        cache.save(&entry).unwrap();

        // fresh process
        let cache = LedgerCache::new(Arc::new(JsonFileStore::new(dir.path())), "mb");
        let mut engine = MergeEngine::new(1, None);
        engine.begin();
        for record in cache.load().unwrap().into_records() {
            engine.apply(record);
        }
        assert_eq!(engine.phase(), SyncPhase::Complete(3));
        let snapshot = engine.take_rebuild().unwrap();
        assert_eq!(snapshot.pending.len(), 2);
    }

    #[test]
    fn test_uncommitted_engine_captures_nothing() {
        let mut engine = MergeEngine::new(1, None);
        engine.begin();
        engine.apply_index(index(1, &[("p1", &pending(1, &["a"]))]));
        assert!(LedgerCacheEntry::capture(&engine).is_none());
    }

    #[test]
    fn test_old_schema_is_discarded() {
        let store = Arc::new(MemoryStore::new());
        store
            .put(
                &store_keys::ledger("mb"),
                json!({"schema": 0, "index": {"rev": 1}, "pages": []}),
            )
            .unwrap();
        let cache = LedgerCache::new(store.clone(), "mb");
        assert!(cache.load().is_none());
        assert!(store.is_empty());
    }
}
