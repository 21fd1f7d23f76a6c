//! Requests to the scheduler.
//!
//! Every request is a kind-7701 rumor inside a wrap addressed to the
//! scheduler. Post payloads are signed by the user up front and sealed under
//! the submit subkey; DM payloads are sealed under the dm subkey with a
//! preview only the user's own devices can read.

use std::time::Duration;

use nostr_sdk::prelude::{Event, EventBuilder, EventId, Filter, Kind, PublicKey, Tag, Timestamp};
use serde_json::Value;

use crate::bootstrap::{MailboxKeys, POLL_SLACK_SECS};
use crate::constants::{kinds, store_keys};
use crate::envelope::{build_wrap, compute_rumor_id, rumor, EnvelopeError};
use crate::keys::{CipherError, PreviewKey, PreviewKeyCapsule};
use crate::protocol::{SchedulerRequest, SchedulerResponse};
use crate::session::Session;
use crate::signer::{SessionSigner, SignerError};
use crate::storage::{LocalStoreExt, StoreError};
use crate::transport::PublishError;

/// Characters of a DM kept in its preview
const PREVIEW_CHARS: usize = 80;
/// NIP-17 chat message
const PRIVATE_MESSAGE_KIND: u16 = 14;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("Payload encryption failed: {0}")]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Event {0} is not signed by this account")]
    ForeignEvent(EventId),
    #[error("Event {0} not found on any relay")]
    NotFound(EventId),
    #[error("Scheduler rejected the request: {0}")]
    Rejected(String),
    #[error("No answer from the scheduler within {0:?}")]
    Timeout(Duration),
}

impl SubmitError {
    pub fn is_fatal(&self) -> bool {
        match self {
            SubmitError::Signer(e) => e.is_fatal(),
            SubmitError::Envelope(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// Proof that a request went out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    /// Rumor id; the scheduler echoes it in its answer
    pub request_id: String,
    pub job_id: Option<String>,
    pub wrap_id: EventId,
    pub sent_at: Timestamp,
}

pub struct SchedulerClient {
    session: Session,
    signer: SessionSigner,
    keys: MailboxKeys,
}

impl SchedulerClient {
    pub fn new(session: Session, signer: SessionSigner, keys: MailboxKeys) -> Self {
        Self {
            session,
            signer,
            keys,
        }
    }

    /// Sign a text note dated `scheduled_at` and submit it.
    pub async fn post_note(
        &self,
        content: &str,
        scheduled_at: u64,
    ) -> Result<SubmitReceipt, SubmitError> {
        let note = self
            .signer
            .sign_builder(
                EventBuilder::text_note(content).custom_created_at(Timestamp::from(scheduled_at)),
            )
            .await?;
        self.submit_note(&note, scheduled_at).await
    }

    /// Submit a note the user already signed.
    pub async fn submit_note(
        &self,
        note: &Event,
        scheduled_at: u64,
    ) -> Result<SubmitReceipt, SubmitError> {
        self.ensure_own(note)?;
        let payload = self.keys.keys.submit().seal_json(note)?;
        self.send(SchedulerRequest::SubmitNote {
            job_id: new_job_id(),
            scheduled_at,
            payload,
        })
        .await
    }

    /// Sign a repost of `target` and submit it.
    pub async fn submit_repost(
        &self,
        target: &Event,
        scheduled_at: u64,
    ) -> Result<SubmitReceipt, SubmitError> {
        let repost = self
            .signer
            .sign_builder(
                EventBuilder::repost(target, None).custom_created_at(Timestamp::from(scheduled_at)),
            )
            .await?;
        let payload = self.keys.keys.submit().seal_json(&repost)?;
        self.send(SchedulerRequest::SubmitRepost {
            job_id: new_job_id(),
            scheduled_at,
            payload,
        })
        .await
    }

    /// Look the target up on the relays, then repost it.
    pub async fn repost_by_id(
        &self,
        target: EventId,
        scheduled_at: u64,
    ) -> Result<SubmitReceipt, SubmitError> {
        let found = self
            .session
            .pool()
            .fetch_once(self.session.relays(), Filter::new().id(target).limit(1))
            .await;
        let event = found
            .into_iter()
            .find(|e| e.id == target)
            .ok_or(SubmitError::NotFound(target))?;
        self.submit_repost(&event, scheduled_at).await
    }

    /// Wrap a private message for `recipient` now; the scheduler publishes the
    /// wrap at `scheduled_at` without ever seeing the text.
    pub async fn submit_dm(
        &self,
        recipient: PublicKey,
        message: &str,
        scheduled_at: u64,
        preview_key: &PreviewKey,
    ) -> Result<SubmitReceipt, SubmitError> {
        let chat = rumor(
            self.signer.public_key(),
            PRIVATE_MESSAGE_KIND,
            message,
            vec![Tag::public_key(recipient)],
        );
        let wrap = build_wrap(&self.signer, &recipient, chat).await?;
        let payload = self.keys.keys.dm().seal_json(&wrap)?;
        let preview = preview_key.seal(&preview_text(message))?;
        self.send(SchedulerRequest::SubmitDm {
            job_id: new_job_id(),
            scheduled_at,
            recipient: recipient.to_hex(),
            payload,
            preview,
        })
        .await
    }

    pub async fn retry(&self, job_id: &str) -> Result<SubmitReceipt, SubmitError> {
        self.send(SchedulerRequest::Retry {
            job_id: job_id.to_string(),
        })
        .await
    }

    pub async fn cancel(&self, job_id: &str) -> Result<SubmitReceipt, SubmitError> {
        self.send(SchedulerRequest::Cancel {
            job_id: job_id.to_string(),
        })
        .await
    }

    pub async fn repair(&self) -> Result<SubmitReceipt, SubmitError> {
        self.send(SchedulerRequest::Repair).await
    }

    pub async fn support(&self, action: &str, details: Value) -> Result<SubmitReceipt, SubmitError> {
        self.send(SchedulerRequest::Support {
            action: action.to_string(),
            details,
        })
        .await
    }

    pub async fn register_preview_capsule(
        &self,
        capsule: PreviewKeyCapsule,
    ) -> Result<SubmitReceipt, SubmitError> {
        self.send(SchedulerRequest::RegisterPreviewCapsule { capsule }).await
    }

    /// The DM preview key: from the local cache, else from a capsule in the
    /// index addressed to this account, else a fresh key whose capsule is
    /// registered with the scheduler.
    pub async fn resolve_preview_key(
        &self,
        capsules: &[PreviewKeyCapsule],
    ) -> Result<PreviewKey, SubmitError> {
        let key_name = store_keys::preview_key(&self.signer.public_key().to_hex());
        if let Some(hex) = self.session.store().get_as::<String>(&key_name) {
            match PreviewKey::from_hex(&hex) {
                Ok(key) => return Ok(key),
                Err(e) => tracing::debug!(error = %e, "discarding cached preview key"),
            }
        }

        if let Some(key) = PreviewKey::from_capsules(&self.signer, capsules).await? {
            tracing::debug!("preview key recovered from capsule");
            self.session.store().put_as(&key_name, &key.to_hex())?;
            return Ok(key);
        }

        let key = PreviewKey::generate();
        let capsule = key.to_capsule(&self.signer).await?;
        self.register_preview_capsule(capsule).await?;
        self.session.store().put_as(&key_name, &key.to_hex())?;
        tracing::info!("registered new preview key");
        Ok(key)
    }

    /// Poll for the scheduler's answer to `receipt`.
    pub async fn wait_for_response(
        &self,
        receipt: &SubmitReceipt,
        timeout: Duration,
    ) -> Result<SchedulerResponse, SubmitError> {
        let poll = self.session.config().bootstrap.poll_interval();
        let deadline = tokio::time::Instant::now() + timeout;
        let since = Timestamp::from(receipt.sent_at.as_u64().saturating_sub(POLL_SLACK_SECS));
        let filter = Filter::new()
            .kind(Kind::from(kinds::WRAP))
            .pubkey(self.signer.public_key())
            .since(since);
        let scheduler = self.session.scheduler();

        loop {
            let wraps = self
                .session
                .pool()
                .fetch_once(self.session.relays(), filter.clone())
                .await;
            for wrap in &wraps {
                let Some(opened) = self
                    .session
                    .decrypt_cache()
                    .open(&self.signer, wrap, Some(&scheduler))
                    .await?
                else {
                    continue;
                };
                if opened.rumor.kind.as_u16() != kinds::SCHEDULER_RESPONSE {
                    continue;
                }
                let Ok(response) = serde_json::from_str::<SchedulerResponse>(&opened.rumor.content)
                else {
                    tracing::debug!(wrap = %wrap.id, "unreadable scheduler response");
                    continue;
                };
                if response.request_id() != Some(receipt.request_id.as_str()) {
                    continue;
                }
                return match response {
                    SchedulerResponse::Error { message, .. } => Err(SubmitError::Rejected(message)),
                    other => Ok(other),
                };
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SubmitError::Timeout(timeout));
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn send(&self, request: SchedulerRequest) -> Result<SubmitReceipt, SubmitError> {
        let body = serde_json::to_string(&request).map_err(CipherError::from)?;
        let request_rumor = rumor(
            self.signer.public_key(),
            kinds::SCHEDULER_REQUEST,
            body,
            Vec::new(),
        );
        let request_id = compute_rumor_id(&request_rumor);
        let sent_at = Timestamp::now();
        let wrap = build_wrap(&self.signer, &self.session.scheduler(), request_rumor).await?;
        let wrap_id = self
            .session
            .pool()
            .publish(
                self.session.relays(),
                &wrap,
                self.session.publish_options(&self.signer),
            )
            .await?;
        tracing::info!(request = request.name(), job = ?request.job_id(), wrap = %wrap_id, "request sent");
        Ok(SubmitReceipt {
            request_id,
            job_id: request.job_id().map(str::to_string),
            wrap_id,
            sent_at,
        })
    }

    fn ensure_own(&self, event: &Event) -> Result<(), SubmitError> {
        if event.pubkey != self.signer.public_key() || event.verify().is_err() {
            return Err(SubmitError::ForeignEvent(event.id));
        }
        Ok(())
    }
}

fn new_job_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn preview_text(message: &str) -> String {
    let mut chars = message.chars();
    let mut preview: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        preview.push('…');
    }
    preview
}
