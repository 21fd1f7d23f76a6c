//! History backfill.
//!
//! History is append-only and not revision gated. Buckets are walked in the
//! order the index lists them, which the scheduler keeps newest first; the
//! first `eager_buckets` are wanted in full, after that only as
//! many pages as `load_more` has asked for. What is wanted only ever grows.

use std::collections::{HashMap, HashSet};

use super::records::{HistoryBucket, HistoryPage, Job};

/// Records the history walk still needs from the relays
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryFetch {
    pub buckets: Vec<String>,
    pub pages: Vec<String>,
}

impl HistoryFetch {
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty() && self.pages.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct HistoryState {
    /// Index order, duplicates dropped
    buckets: Vec<String>,
    bucket_pages: HashMap<String, HistoryBucket>,
    pages: HashMap<String, HistoryPage>,
    eager_buckets: usize,
    extra_pages: usize,
    requested_buckets: HashSet<String>,
    requested_pages: HashSet<String>,
}

impl HistoryState {
    pub fn new(eager_buckets: usize) -> Self {
        Self {
            eager_buckets,
            ..Self::default()
        }
    }

    /// Adopt the bucket list of a new index. Returns true if it changed.
    pub fn set_buckets(&mut self, buckets: &[String]) -> bool {
        let mut seen = HashSet::new();
        let ordered: Vec<String> = buckets
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();
        if ordered == self.buckets {
            return false;
        }
        self.buckets = ordered;
        true
    }

    /// Returns true when the bucket's page list changed.
    pub fn apply_bucket(&mut self, id: &str, bucket: HistoryBucket) -> bool {
        self.requested_buckets.remove(id);
        if self.bucket_pages.get(id) == Some(&bucket) {
            return false;
        }
        self.bucket_pages.insert(id.to_string(), bucket);
        true
    }

    /// Returns true when the page is new or its items changed.
    pub fn apply_page(&mut self, d: &str, page: HistoryPage) -> bool {
        self.requested_pages.remove(d);
        if self.pages.get(d) == Some(&page) {
            return false;
        }
        self.pages.insert(d.to_string(), page);
        true
    }

    /// Widen the walk by `pages` more pages.
    pub fn load_more(&mut self, pages: usize) {
        self.extra_pages += pages;
    }

    /// Pages and bucket lists the current walk needs that are neither loaded
    /// nor already requested; the returned records are marked requested.
    pub fn next_fetch(&mut self) -> HistoryFetch {
        let mut fetch = HistoryFetch::default();
        let mut extra = self.extra_pages;
        for (i, id) in self.buckets.iter().enumerate() {
            let eager = i < self.eager_buckets;
            if !eager && extra == 0 {
                break;
            }
            let Some(bucket) = self.bucket_pages.get(id) else {
                if self.requested_buckets.insert(id.clone()) {
                    fetch.buckets.push(id.clone());
                }
                // Later buckets wait until this page list is known.
                break;
            };
            for page in &bucket.pages {
                if !eager {
                    if extra == 0 {
                        break;
                    }
                    extra -= 1;
                }
                if !self.pages.contains_key(&page.d) && self.requested_pages.insert(page.d.clone()) {
                    fetch.pages.push(page.d.clone());
                }
            }
        }
        fetch
    }

    /// Whether records have been asked for and not yet arrived.
    pub fn has_outstanding(&self) -> bool {
        !self.requested_buckets.is_empty() || !self.requested_pages.is_empty()
    }

    /// Forget outstanding requests so a retry asks again.
    pub fn reset_requests(&mut self) {
        self.requested_buckets.clear();
        self.requested_pages.clear();
    }

    /// Whether pages exist beyond what has been wanted so far.
    pub fn has_more(&self) -> bool {
        let mut extra = self.extra_pages;
        for (i, id) in self.buckets.iter().enumerate() {
            let Some(bucket) = self.bucket_pages.get(id) else {
                return true;
            };
            if i < self.eager_buckets {
                continue;
            }
            if bucket.pages.len() > extra {
                return true;
            }
            extra -= bucket.pages.len();
        }
        false
    }

    /// Loaded jobs in walk order
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs = Vec::new();
        for id in &self.buckets {
            let Some(bucket) = self.bucket_pages.get(id) else {
                break;
            };
            for page in &bucket.pages {
                if let Some(loaded) = self.pages.get(&page.d) {
                    jobs.extend(loaded.jobs());
                }
            }
        }
        jobs
    }

    pub fn loaded_buckets(&self) -> impl Iterator<Item = (&String, &HistoryBucket)> {
        self.bucket_pages.iter()
    }

    pub fn loaded_pages(&self) -> impl Iterator<Item = (&String, &HistoryPage)> {
        self.pages.iter()
    }

    pub fn loaded_page_count(&self) -> usize {
        self.pages.len()
    }
}
