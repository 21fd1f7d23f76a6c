//! Ledger record formats.
//!
//! Every record is a kind-30078 addressable event authored by the scheduler,
//! its content sealed under the mailbox subkey. The `d` tag says what it is:
//! `<mailbox>:index`, `<mailbox>:bucket:<id>`, or an opaque page id.

use std::collections::BTreeMap;

use nostr_sdk::prelude::{Event, PublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::constants::kinds;
use crate::keys::{CipherError, PreviewKeyCapsule, SubKey};

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("Not a ledger record (kind {0})")]
    WrongKind(u16),
    #[error("Record not authored by the scheduler")]
    WrongAuthor,
    #[error("Record has no d tag")]
    MissingAddress,
    #[error("Record payload could not be opened: {0}")]
    Cipher(#[from] CipherError),
    #[error("Record payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Page record {0} is neither a pending nor a history page")]
    UnknownPageShape(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordAddress {
    Index,
    Bucket(String),
    Page(String),
}

impl RecordAddress {
    pub fn parse(mailbox: &str, d: &str) -> Self {
        match d.strip_prefix(mailbox).and_then(|rest| rest.strip_prefix(':')) {
            Some("index") => RecordAddress::Index,
            Some(rest) => match rest.strip_prefix("bucket:") {
                Some(id) => RecordAddress::Bucket(id.to_string()),
                None => RecordAddress::Page(d.to_string()),
            },
            None => RecordAddress::Page(d.to_string()),
        }
    }

    pub fn d_tag(&self, mailbox: &str) -> String {
        match self {
            RecordAddress::Index => format!("{}:index", mailbox),
            RecordAddress::Bucket(id) => format!("{}:bucket:{}", mailbox, id),
            RecordAddress::Page(d) => d.clone(),
        }
    }
}

/// Entry of the pending page manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRef {
    pub d: String,
    pub hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MailboxIndex {
    pub rev: u64,
    #[serde(default)]
    pub pending_pages: Vec<PageRef>,
    #[serde(default)]
    pub buckets: Vec<String>,
    #[serde(default)]
    pub counts: BTreeMap<String, u64>,
    #[serde(default)]
    pub support: Value,
    #[serde(default, rename = "previewKeyCapsules")]
    pub preview_key_capsules: Vec<PreviewKeyCapsule>,
}

impl MailboxIndex {
    pub fn page_hash(&self, d: &str) -> Option<&str> {
        self.pending_pages
            .iter()
            .find(|p| p.d == d)
            .map(|p| p.hash.as_str())
    }
}

/// Page of in-flight jobs. Items stay as raw JSON so the hash is computed over
/// exactly what the scheduler wrote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPage {
    pub rev: u64,
    #[serde(default)]
    pub pending: Vec<Value>,
}

impl PendingPage {
    pub fn items_hash(&self) -> String {
        items_hash(&self.pending)
    }

    pub fn jobs(&self) -> Vec<Job> {
        parse_jobs(&self.pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketPageRef {
    pub page: String,
    pub d: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryBucket {
    #[serde(default)]
    pub pages: Vec<BucketPageRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    #[serde(default)]
    pub items: Vec<Value>,
}

impl HistoryPage {
    pub fn jobs(&self) -> Vec<Job> {
        parse_jobs(&self.items)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Scheduled,
    Queued,
    Publishing,
    Published,
    Sent,
    Failed,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Published | JobStatus::Sent | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum JobKind {
    Note {
        /// First characters of the note, for list rendering
        #[serde(default)]
        summary: Option<String>,
    },
    Repost {
        target_id: String,
    },
    /// `preview` is sealed under the user's preview key
    Dm {
        recipient: String,
        #[serde(default)]
        preview: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub scheduled_at: u64,
    #[serde(default)]
    pub updated_at: u64,
    pub status: JobStatus,
    #[serde(default)]
    pub status_detail: Option<String>,
    #[serde(flatten)]
    pub kind: JobKind,
}

/// Items that do not parse as jobs are skipped; they still count toward the
/// page hash.
fn parse_jobs(items: &[Value]) -> Vec<Job> {
    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<Job>(item.clone()) {
            Ok(job) => Some(job),
            Err(e) => {
                tracing::debug!(error = %e, "skipping unreadable job");
                None
            }
        })
        .collect()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Compact JSON with object keys sorted
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Lowercase hex SHA-256 of the canonical item array.
pub fn items_hash(items: &[Value]) -> String {
    let canonical = canonical_json(&Value::Array(items.to_vec()));
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerRecord {
    Index(MailboxIndex),
    Bucket { id: String, bucket: HistoryBucket },
    Pending { d: String, page: PendingPage },
    History { d: String, page: HistoryPage },
}

pub fn d_tag(event: &Event) -> Option<&str> {
    event.tags.iter().find_map(|tag| {
        let parts = tag.as_slice();
        match (parts.first().map(String::as_str), parts.get(1)) {
            (Some("d"), Some(value)) => Some(value.as_str()),
            _ => None,
        }
    })
}

/// Check provenance, open and classify one record.
pub fn decode_record(
    event: &Event,
    mailbox: &str,
    scheduler: &PublicKey,
    key: &SubKey,
) -> Result<LedgerRecord, RecordError> {
    if event.kind.as_u16() != kinds::LEDGER_RECORD {
        return Err(RecordError::WrongKind(event.kind.as_u16()));
    }
    if event.pubkey != *scheduler {
        return Err(RecordError::WrongAuthor);
    }
    let d = d_tag(event).ok_or(RecordError::MissingAddress)?;
    let plaintext = key.open(&event.content)?;

    Ok(match RecordAddress::parse(mailbox, d) {
        RecordAddress::Index => LedgerRecord::Index(serde_json::from_slice(&plaintext)?),
        RecordAddress::Bucket(id) => LedgerRecord::Bucket {
            id,
            bucket: serde_json::from_slice(&plaintext)?,
        },
        RecordAddress::Page(d) => {
            let value: Value = serde_json::from_slice(&plaintext)?;
            if value.get("pending").is_some() {
                LedgerRecord::Pending {
                    page: serde_json::from_value(value)?,
                    d,
                }
            } else if value.get("items").is_some() {
                LedgerRecord::History {
                    page: serde_json::from_value(value)?,
                    d,
                }
            } else {
                return Err(RecordError::UnknownPageShape(d));
            }
        }
    })
}
