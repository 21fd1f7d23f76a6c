//! Application-wide constants
//!
//! Event kinds, key-derivation labels and the default tunables shared by the
//! transport, envelope and ledger modules.

/// Default relays used when the configuration names none
pub const DEFAULT_RELAYS: &[&str] = &["wss://relay.damus.io", "wss://nos.lol", "wss://relay.primal.net"];

/// Fraction of relays that must acknowledge a publish
pub const DEFAULT_SUCCESS_RATIO: f64 = 0.34;

/// Prefix relays use in OK/CLOSED messages when NIP-42 authentication is needed
pub const AUTH_REQUIRED_PREFIX: &str = "auth-required:";

// Nostr event kinds used by Herald
pub mod kinds {
    /// Seal (NIP-59): rumor encrypted to the recipient, signed by the sender
    pub const SEAL: u16 = 13;
    /// Gift wrap (NIP-59): seal encrypted by a throwaway key
    pub const WRAP: u16 = 1059;
    /// Scheduler request rumor (client -> scheduler)
    pub const SCHEDULER_REQUEST: u16 = 7701;
    /// Scheduler response rumor (scheduler -> client)
    pub const SCHEDULER_RESPONSE: u16 = 7702;
    /// Client authentication (NIP-42)
    pub const CLIENT_AUTH: u16 = 22242;
    /// Application-specific addressable data: index, buckets and pages
    pub const LEDGER_RECORD: u16 = 30078;
}

/// HKDF context labels, one per payload category
pub mod labels {
    pub const SALT: &[u8] = b"herald-master-key-set";
    pub const MAILBOX: &[u8] = b"herald/v1/mailbox";
    pub const SUBMIT: &[u8] = b"herald/v1/submit";
    pub const DM: &[u8] = b"herald/v1/dm";
    pub const BLOB: &[u8] = b"herald/v1/blob";
}

/// Store keys for the local cache
pub mod store_keys {
    /// `bootstrap:<user>:<scheduler>` -> cached key grant
    pub fn bootstrap(user: &str, scheduler: &str) -> String {
        format!("bootstrap:{}:{}", user, scheduler)
    }

    /// `ledger:<mailbox>` -> last committed ledger snapshot
    pub fn ledger(mailbox: &str) -> String {
        format!("ledger:{}", mailbox)
    }

    /// `preview-key:<user>` -> DM preview key
    pub fn preview_key(user: &str) -> String {
        format!("preview-key:{}", user)
    }

    /// `non-indexing:<relay-set>` -> relay set that fails identifier queries
    pub fn non_indexing(relay_set: &str) -> String {
        format!("non-indexing:{}", relay_set)
    }
}
