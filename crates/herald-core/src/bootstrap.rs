//! Key bootstrap: obtain the root secret and mailbox id from the scheduler
//! once per (user, scheduler) pair.
//!
//! A cache hit is answered without touching the network. Otherwise recent
//! wraps addressed to the user are scanned for an earlier grant, and only if
//! none is found a key request is published and the relays are polled for
//! the answer.

use std::time::Duration;

use nostr_sdk::prelude::{Event, Filter, Kind, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::constants::{kinds, store_keys};
use crate::envelope::{build_wrap, rumor, EnvelopeError, OpenedEnvelope};
use crate::keys::{CipherError, MasterKeySet, RootSecret};
use crate::protocol::{SchedulerRequest, SchedulerResponse};
use crate::secure_storage::{RootSecretVault, SecureStorageError};
use crate::session::Session;
use crate::signer::{SessionSigner, SignerError};
use crate::storage::{LocalStoreExt, StoreError};
use crate::transport::PublishError;

/// Wraps published shortly before the request are still considered answers.
pub(crate) const POLL_SLACK_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapState {
    NoCache,
    ScanningExistingWraps,
    RequestSent,
    WaitingForResponse,
    Ready,
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error("Failed to send key request: {0}")]
    Envelope(EnvelopeError),
    #[error("Failed to publish key request: {0}")]
    Publish(#[from] PublishError),
    #[error("Scheduler did not answer the key request within {0:?}")]
    Timeout(Duration),
    #[error("Invalid key grant: {0}")]
    InvalidGrant(#[from] CipherError),
    #[error("Failed to cache key grant: {0}")]
    Store(#[from] StoreError),
    #[error("Failed to encode key request: {0}")]
    Encode(#[from] serde_json::Error),
}

impl BootstrapError {
    pub fn is_fatal(&self) -> bool {
        match self {
            BootstrapError::Signer(e) => e.is_fatal(),
            BootstrapError::Envelope(e) => e.is_fatal(),
            _ => false,
        }
    }
}

impl From<EnvelopeError> for BootstrapError {
    fn from(e: EnvelopeError) -> Self {
        match e {
            EnvelopeError::Signer(e) => BootstrapError::Signer(e),
            other => BootstrapError::Envelope(other),
        }
    }
}

/// Working keys for one mailbox
#[derive(Debug, Clone)]
pub struct MailboxKeys {
    pub mailbox_id: String,
    pub keys: MasterKeySet,
}

/// Cache entry. `root` is absent when the secret lives in the OS keyring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedGrant {
    mailbox: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    root: Option<String>,
}

pub struct KeyBootstrap {
    session: Session,
    state: Mutex<BootstrapState>,
}

impl KeyBootstrap {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            state: Mutex::new(BootstrapState::NoCache),
        }
    }

    pub fn state(&self) -> BootstrapState {
        self.state.lock().clone()
    }

    fn transition(&self, next: BootstrapState) {
        let mut state = self.state.lock();
        if *state != next {
            tracing::info!(from = ?*state, to = ?next, "key bootstrap");
            *state = next;
        }
    }

    fn cache_key(&self) -> String {
        store_keys::bootstrap(
            &self.session.user().to_hex(),
            &self.session.scheduler().to_hex(),
        )
    }

    /// Keys from the local cache, without any network traffic. Works for
    /// read-only sessions too.
    pub fn cached(&self) -> Option<MailboxKeys> {
        let grant: CachedGrant = self.session.store().get_as(&self.cache_key())?;
        let root_hex = match grant.root {
            Some(root) => root,
            None => {
                let user = self.session.user().to_hex();
                let scheduler = self.session.scheduler().to_hex();
                match RootSecretVault::get(&user, &scheduler) {
                    Ok(root) => root,
                    Err(e) => {
                        tracing::debug!(error = %e, "root secret missing from keyring");
                        return None;
                    }
                }
            }
        };
        let keys = RootSecret::from_hex(&root_hex)
            .and_then(MasterKeySet::derive)
            .map_err(|e| tracing::debug!(error = %e, "discarding cached root secret"))
            .ok()?;
        self.transition(BootstrapState::Ready);
        Some(MailboxKeys {
            mailbox_id: grant.mailbox,
            keys,
        })
    }

    pub async fn run(&self, signer: &SessionSigner) -> Result<MailboxKeys, BootstrapError> {
        match self.run_inner(signer).await {
            Ok(keys) => {
                self.transition(BootstrapState::Ready);
                Ok(keys)
            }
            Err(e) => {
                self.transition(BootstrapState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn run_inner(&self, signer: &SessionSigner) -> Result<MailboxKeys, BootstrapError> {
        if let Some(keys) = self.cached() {
            return Ok(keys);
        }
        self.transition(BootstrapState::NoCache);

        self.transition(BootstrapState::ScanningExistingWraps);
        let config = &self.session.config().bootstrap;
        let recent = self
            .session
            .pool()
            .fetch_once(
                self.session.relays(),
                self.wrap_filter().limit(config.scan_limit),
            )
            .await;
        if let Some(keys) = self.find_grant(signer, recent, config.max_decrypt_attempts).await? {
            return self.persist(keys);
        }

        let requested_at = Timestamp::now();
        self.send_request(signer).await?;
        self.transition(BootstrapState::RequestSent);

        self.transition(BootstrapState::WaitingForResponse);
        let timeout = config.response_timeout();
        let deadline = tokio::time::Instant::now() + timeout;
        let since = Timestamp::from(requested_at.as_u64().saturating_sub(POLL_SLACK_SECS));
        loop {
            tokio::time::sleep(config.poll_interval()).await;
            let events = self
                .session
                .pool()
                .fetch_once(self.session.relays(), self.wrap_filter().since(since))
                .await;
            if let Some(keys) = self.find_grant(signer, events, usize::MAX).await? {
                return self.persist(keys);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BootstrapError::Timeout(timeout));
            }
        }
    }

    fn wrap_filter(&self) -> Filter {
        Filter::new()
            .kind(Kind::from(kinds::WRAP))
            .pubkey(self.session.user())
    }

    /// Newest first. Wraps already tried this session do not count against
    /// `max_attempts`; only fatal signer errors end the scan early.
    async fn find_grant(
        &self,
        signer: &SessionSigner,
        mut wraps: Vec<Event>,
        max_attempts: usize,
    ) -> Result<Option<MailboxKeys>, BootstrapError> {
        wraps.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let scheduler = self.session.scheduler();
        let cache = self.session.decrypt_cache();

        let mut attempts = 0;
        for wrap in &wraps {
            if !cache.contains(&wrap.id) {
                if attempts >= max_attempts {
                    tracing::debug!(max_attempts, "decrypt budget spent");
                    break;
                }
                attempts += 1;
            }
            let Some(opened) = cache.open(signer, wrap, Some(&scheduler)).await? else {
                continue;
            };
            match grant_from(&opened) {
                Some(Ok(keys)) => return Ok(Some(keys)),
                Some(Err(e)) => tracing::debug!(wrap = %wrap.id, error = %e, "ignoring bad grant"),
                None => {}
            }
        }
        Ok(None)
    }

    async fn send_request(&self, signer: &SessionSigner) -> Result<(), BootstrapError> {
        let body = serde_json::to_string(&SchedulerRequest::KeyRequest)?;
        let request = rumor(signer.public_key(), kinds::SCHEDULER_REQUEST, body, Vec::new());
        let wrap = build_wrap(signer, &self.session.scheduler(), request).await?;
        let id = self
            .session
            .pool()
            .publish(self.session.relays(), &wrap, self.session.publish_options(signer))
            .await?;
        tracing::info!(wrap = %id, "key request sent");
        Ok(())
    }

    fn persist(&self, keys: MailboxKeys) -> Result<MailboxKeys, BootstrapError> {
        let root = keys.keys.root().to_hex();
        let mut entry = CachedGrant {
            mailbox: keys.mailbox_id.clone(),
            root: Some(root.clone()),
        };
        if self.session.config().use_os_keyring {
            let user = self.session.user().to_hex();
            let scheduler = self.session.scheduler().to_hex();
            match RootSecretVault::set(&user, &scheduler, &root) {
                Ok(()) => entry.root = None,
                Err(e) => tracing::warn!(error = %e, "keyring unavailable, caching root secret in store"),
            }
        }
        self.session.store().put_as(&self.cache_key(), &entry)?;
        tracing::info!(mailbox = %keys.mailbox_id, "mailbox keys ready");
        Ok(keys)
    }

    /// Forget cached keys after the scheduler rejected them; the next `run`
    /// starts from scratch.
    pub fn invalidate(&self) -> Result<(), BootstrapError> {
        self.session.store().remove(&self.cache_key())?;
        if self.session.config().use_os_keyring {
            let user = self.session.user().to_hex();
            let scheduler = self.session.scheduler().to_hex();
            if let Err(e) = RootSecretVault::delete(&user, &scheduler) {
                if !matches!(e, SecureStorageError::NotFound(_)) {
                    tracing::warn!(error = %e, "failed to clear keyring entry");
                }
            }
        }
        self.transition(BootstrapState::NoCache);
        Ok(())
    }
}

/// `None` when the envelope is not a key grant at all.
fn grant_from(opened: &OpenedEnvelope) -> Option<Result<MailboxKeys, CipherError>> {
    if opened.rumor.kind.as_u16() != kinds::SCHEDULER_RESPONSE {
        return None;
    }
    match serde_json::from_str(&opened.rumor.content).ok()? {
        SchedulerResponse::KeyGrant { root, mailbox } => Some(
            RootSecret::from_hex(&root)
                .and_then(MasterKeySet::derive)
                .map(|keys| MailboxKeys {
                    mailbox_id: mailbox,
                    keys,
                }),
        ),
        _ => None,
    }
}
