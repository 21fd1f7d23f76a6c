//! Per-session state shared by bootstrap, ledger sync and the scheduler
//! client: the relay pool (connections, queues, health), the local store and
//! the decrypt cache. Nothing here is process-global.

use std::sync::Arc;

use nostr_sdk::prelude::PublicKey;

use crate::config::CoreConfig;
use crate::constants::DEFAULT_RELAYS;
use crate::envelope::DecryptCache;
use crate::signer::{parse_public_key, Identity, SessionSigner};
use crate::storage::{JsonFileStore, LocalStore};
use crate::transport::{PublishOptions, TransportPool};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No scheduler public key configured")]
    MissingScheduler,
    #[error("Invalid scheduler public key: {0}")]
    InvalidScheduler(String),
}

struct SessionInner {
    config: CoreConfig,
    relays: Vec<String>,
    scheduler: PublicKey,
    identity: Identity,
    pool: TransportPool,
    store: Arc<dyn LocalStore>,
    decrypt_cache: DecryptCache,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(
        config: CoreConfig,
        identity: Identity,
        pool: TransportPool,
        store: Arc<dyn LocalStore>,
    ) -> Result<Self, SessionError> {
        let scheduler = config
            .scheduler_pubkey
            .as_deref()
            .ok_or(SessionError::MissingScheduler)
            .and_then(|value| {
                parse_public_key(value).map_err(|e| SessionError::InvalidScheduler(e.to_string()))
            })?;
        let relays = if config.relays.is_empty() {
            DEFAULT_RELAYS.iter().map(|r| r.to_string()).collect()
        } else {
            config.relays.clone()
        };
        tracing::info!(
            user = %identity.public_key(),
            scheduler = %scheduler,
            relays = relays.len(),
            read_only = identity.signer().is_none(),
            "session opened"
        );
        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                relays,
                scheduler,
                identity,
                pool,
                store,
                decrypt_cache: DecryptCache::new(),
            }),
        })
    }

    /// Session over WebSocket relays with the JSON cache under `data_dir`.
    pub fn open(config: CoreConfig, identity: Identity) -> Result<Self, SessionError> {
        let pool = TransportPool::websocket(config.pool.clone());
        let store: Arc<dyn LocalStore> = Arc::new(JsonFileStore::new(&config.data_dir));
        Self::new(config, identity, pool, store)
    }

    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    pub fn relays(&self) -> &[String] {
        &self.inner.relays
    }

    pub fn scheduler(&self) -> PublicKey {
        self.inner.scheduler
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn user(&self) -> PublicKey {
        self.inner.identity.public_key()
    }

    pub fn signer(&self) -> Option<&SessionSigner> {
        self.inner.identity.signer()
    }

    pub fn pool(&self) -> &TransportPool {
        &self.inner.pool
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.inner.store
    }

    pub fn decrypt_cache(&self) -> &DecryptCache {
        &self.inner.decrypt_cache
    }

    /// Publish options with the configured ratio; the signer answers AUTH.
    pub fn publish_options(&self, signer: &SessionSigner) -> PublishOptions {
        PublishOptions::new(self.inner.config.pool.success_ratio)
            .with_responder(Arc::new(signer.clone()))
    }
}
