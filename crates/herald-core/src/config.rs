use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_RELAYS, DEFAULT_SUCCESS_RATIO};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Engine configuration. Every field has a default so a partial JSON file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    pub data_dir: PathBuf,
    pub relays: Vec<String>,
    /// Hex or npub of the scheduler service
    pub scheduler_pubkey: Option<String>,
    /// Keep the bootstrap root secret in the OS keyring instead of the cache file
    pub use_os_keyring: bool,
    pub pool: PoolConfig,
    pub signer: SignerTimeouts,
    pub bootstrap: BootstrapConfig,
    pub sync: SyncConfig,
}

impl CoreConfig {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `<data_dir>/config.json` when present, defaults otherwise.
    pub fn load_from_data_dir<P: AsRef<Path>>(data_dir: P) -> Result<Self, ConfigError> {
        let path = data_dir.as_ref().join("config.json");
        let mut config = if path.exists() {
            Self::load(&path)?
        } else {
            Self::default()
        };
        config.data_dir = data_dir.as_ref().to_path_buf();
        Ok(config)
    }

    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("herald"))
            .unwrap_or_else(|| PathBuf::from("herald_data"))
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
            relays: DEFAULT_RELAYS.iter().map(|r| r.to_string()).collect(),
            scheduler_pubkey: None,
            use_os_keyring: false,
            pool: PoolConfig::default(),
            signer: SignerTimeouts::default(),
            bootstrap: BootstrapConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

/// Transport pool tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolConfig {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub publish_timeout_ms: u64,
    pub challenge_timeout_ms: u64,
    /// Identical concurrent reads within this window share one result
    pub dedup_window_ms: u64,
    /// Relays queried first for identifier-keyed filters
    pub narrow_fanout: usize,
    /// Relays queried first for broad filters
    pub broad_fanout: usize,
    pub success_ratio: f64,
    /// First delay before reopening a live stream the relay ended
    pub resubscribe_min_ms: u64,
    /// Reopen delays double up to this cap
    pub resubscribe_max_ms: u64,
}

impl PoolConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_millis(self.challenge_timeout_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    /// Delay before reopen attempt `attempt` (zero-based)
    pub fn resubscribe_delay(&self, attempt: u32) -> Duration {
        let max = self.resubscribe_max_ms.max(self.resubscribe_min_ms);
        let delay = self
            .resubscribe_min_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(max);
        Duration::from_millis(delay)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            read_timeout_ms: 6_000,
            publish_timeout_ms: 8_000,
            challenge_timeout_ms: 30_000,
            dedup_window_ms: 750,
            narrow_fanout: 2,
            broad_fanout: 4,
            success_ratio: DEFAULT_SUCCESS_RATIO,
            resubscribe_min_ms: 1_000,
            resubscribe_max_ms: 60_000,
        }
    }
}

/// Per-operation signer timeouts. Remote signers may wait on a human, so
/// these are deliberately generous and tuned independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SignerTimeouts {
    pub public_key_ms: u64,
    pub sign_ms: u64,
    pub encrypt_ms: u64,
    pub decrypt_ms: u64,
}

impl SignerTimeouts {
    /// Timeouts for an in-process key, where nothing should ever take long
    pub fn local() -> Self {
        Self {
            public_key_ms: 1_000,
            sign_ms: 2_000,
            encrypt_ms: 2_000,
            decrypt_ms: 2_000,
        }
    }

    pub fn public_key(&self) -> Duration {
        Duration::from_millis(self.public_key_ms)
    }

    pub fn sign(&self) -> Duration {
        Duration::from_millis(self.sign_ms)
    }

    pub fn encrypt(&self) -> Duration {
        Duration::from_millis(self.encrypt_ms)
    }

    pub fn decrypt(&self) -> Duration {
        Duration::from_millis(self.decrypt_ms)
    }
}

impl Default for SignerTimeouts {
    fn default() -> Self {
        Self {
            public_key_ms: 30_000,
            sign_ms: 90_000,
            encrypt_ms: 60_000,
            decrypt_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BootstrapConfig {
    /// Upper bound on wraps opened per scan
    pub max_decrypt_attempts: usize,
    /// Number of recent wraps requested per scan
    pub scan_limit: usize,
    pub response_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl BootstrapConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            max_decrypt_attempts: 6,
            scan_limit: 40,
            response_timeout_ms: 45_000,
            poll_interval_ms: 3_000,
        }
    }
}

/// Ledger sync tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Time allowed for every requested pending page to arrive before re-fetching
    pub convergence_timeout_ms: u64,
    /// Delay that coalesces bursts of incoming records into one rebuild
    pub rebuild_debounce_ms: u64,
    /// Poll interval used against relay sets that do not index `d` tags
    pub poll_interval_ms: u64,
    /// Look-back window of the broad scan fallback
    pub broad_scan_window_secs: u64,
    /// History buckets loaded without being asked
    pub eager_history_buckets: usize,
    /// History pages loaded per `load_more_history` call
    pub history_pages_per_load: usize,
    /// Oldest revision gap a hash-matched page may have; `None` accepts any
    pub max_page_staleness: Option<u64>,
}

impl SyncConfig {
    pub fn convergence_timeout(&self) -> Duration {
        Duration::from_millis(self.convergence_timeout_ms)
    }

    pub fn rebuild_debounce(&self) -> Duration {
        Duration::from_millis(self.rebuild_debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            convergence_timeout_ms: 12_000,
            rebuild_debounce_ms: 16,
            poll_interval_ms: 20_000,
            broad_scan_window_secs: 14 * 24 * 60 * 60,
            eager_history_buckets: 1,
            history_pages_per_load: 2,
            max_page_staleness: None,
        }
    }
}
