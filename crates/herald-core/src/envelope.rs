//! Three-layer private envelope: rumor -> seal (kind 13) -> wrap (kind 1059).
//!
//! The rumor is an unsigned event that is never published on its own. The
//! seal carries the rumor NIP-44 encrypted to the recipient and is signed by
//! the real sender. The wrap carries the seal, encrypted by a single-use key
//! and `p`-tagged with the recipient, so relays only ever see the throwaway
//! author.

use std::num::NonZeroUsize;

use lru::LruCache;
use nostr_sdk::nips::nip44;
use nostr_sdk::prelude::{
    Event, EventBuilder, EventId, JsonUtil, Keys, Kind, PublicKey, Tag, Timestamp, UnsignedEvent,
};
use parking_lot::Mutex;

use crate::constants::kinds;
use crate::signer::{SessionSigner, SignerError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("expected kind {expected}, found {found}")]
    WrongKind { expected: u16, found: u16 },
    #[error("seal signature is invalid")]
    BadSealSignature,
    #[error("seal carries tags")]
    SealHasTags,
    #[error("rumor author differs from seal author")]
    AuthorMismatch,
    #[error("sealed by {0}, not the expected sender")]
    UnexpectedSender(String),
    #[error("rumor has no id")]
    MissingId,
    #[error("rumor id does not match its content")]
    IdMismatch,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error("Unparseable envelope layer: {0}")]
    Parse(String),
    #[error("Envelope encryption failed: {0}")]
    Crypto(String),
    #[error("Envelope rejected: {0}")]
    Protocol(#[from] ProtocolViolation),
}

impl EnvelopeError {
    /// Only signer capability failures stop a scan; everything else drops one
    /// message.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EnvelopeError::Signer(e) if e.is_fatal())
    }
}

/// Successfully opened wrap
#[derive(Debug, Clone)]
pub struct OpenedEnvelope {
    pub wrap_id: EventId,
    /// Seal author, equal to the rumor author
    pub sender: PublicKey,
    pub rumor: UnsignedEvent,
}

/// Unsigned rumor authored by `author`, with its id filled in.
pub fn rumor(author: PublicKey, kind: u16, content: impl Into<String>, tags: Vec<Tag>) -> UnsignedEvent {
    let mut rumor = EventBuilder::new(Kind::from(kind), content.into())
        .tags(tags)
        .build(author);
    rumor.ensure_id();
    rumor
}

/// NIP-01 id recomputed from the rumor's fields, ignoring any declared id.
pub fn compute_rumor_id(rumor: &UnsignedEvent) -> String {
    EventId::new(
        &rumor.pubkey,
        &rumor.created_at,
        &rumor.kind,
        &rumor.tags,
        &rumor.content,
    )
    .to_hex()
}

/// Seal `rumor` as the session signer and wrap it for `recipient`.
pub async fn build_wrap(
    signer: &SessionSigner,
    recipient: &PublicKey,
    mut rumor: UnsignedEvent,
) -> Result<Event, EnvelopeError> {
    if rumor.pubkey != signer.public_key() {
        return Err(ProtocolViolation::AuthorMismatch.into());
    }
    rumor.ensure_id();

    let sealed = signer.nip44_encrypt(recipient, &rumor.as_json()).await?;
    let seal = signer
        .sign_builder(EventBuilder::new(Kind::from(kinds::SEAL), sealed))
        .await?;

    let throwaway = Keys::generate();
    let wrapped = nip44::encrypt(
        throwaway.secret_key(),
        recipient,
        seal.as_json(),
        nip44::Version::V2,
    )
    .map_err(|e| EnvelopeError::Crypto(e.to_string()))?;

    EventBuilder::new(Kind::from(kinds::WRAP), wrapped)
        .tag(Tag::public_key(*recipient))
        .custom_created_at(Timestamp::now())
        .sign_with_keys(&throwaway)
        .map_err(|e| EnvelopeError::Crypto(e.to_string()))
}

/// Open a wrap addressed to the session signer. When `expected_sender` is
/// given the seal must be signed by that key.
pub async fn open_wrap(
    signer: &SessionSigner,
    wrap: &Event,
    expected_sender: Option<&PublicKey>,
) -> Result<OpenedEnvelope, EnvelopeError> {
    check_kind(wrap.kind, kinds::WRAP)?;

    let seal_json = signer.nip44_decrypt(&wrap.pubkey, &wrap.content).await?;
    let seal = Event::from_json(seal_json).map_err(|e| EnvelopeError::Parse(e.to_string()))?;
    check_kind(seal.kind, kinds::SEAL)?;
    seal.verify()
        .map_err(|_| ProtocolViolation::BadSealSignature)?;
    if !seal.tags.is_empty() {
        return Err(ProtocolViolation::SealHasTags.into());
    }
    if let Some(expected) = expected_sender {
        if seal.pubkey != *expected {
            return Err(ProtocolViolation::UnexpectedSender(seal.pubkey.to_hex()).into());
        }
    }

    let rumor_json = signer.nip44_decrypt(&seal.pubkey, &seal.content).await?;
    let rumor =
        UnsignedEvent::from_json(rumor_json).map_err(|e| EnvelopeError::Parse(e.to_string()))?;
    if rumor.pubkey != seal.pubkey {
        return Err(ProtocolViolation::AuthorMismatch.into());
    }
    let declared = rumor.id.ok_or(ProtocolViolation::MissingId)?;
    if declared.to_hex() != compute_rumor_id(&rumor) {
        return Err(ProtocolViolation::IdMismatch.into());
    }

    Ok(OpenedEnvelope {
        wrap_id: wrap.id,
        sender: seal.pubkey,
        rumor,
    })
}

fn check_kind(kind: Kind, expected: u16) -> Result<(), ProtocolViolation> {
    if kind.as_u16() == expected {
        Ok(())
    } else {
        Err(ProtocolViolation::WrongKind {
            expected,
            found: kind.as_u16(),
        })
    }
}

/// Wraps remembered per session before the least recently used is evicted
pub const DECRYPT_CACHE_CAPACITY: usize = 4_096;

/// Outcome of the wraps this session has tried to open. A remote signer is
/// asked to decrypt a given wrap at most once while it stays cached.
pub struct DecryptCache {
    entries: Mutex<LruCache<EventId, Option<OpenedEnvelope>>>,
}

impl Default for DecryptCache {
    fn default() -> Self {
        Self::with_capacity(DECRYPT_CACHE_CAPACITY)
    }
}

impl DecryptCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, wrap_id: &EventId) -> bool {
        self.entries.lock().contains(wrap_id)
    }

    /// `Ok(None)` for wraps that could not be opened; only fatal signer
    /// errors are returned (and not remembered).
    pub async fn open(
        &self,
        signer: &SessionSigner,
        wrap: &Event,
        expected_sender: Option<&PublicKey>,
    ) -> Result<Option<OpenedEnvelope>, EnvelopeError> {
        if let Some(hit) = self.entries.lock().get(&wrap.id) {
            return Ok(hit.clone());
        }
        let opened = match open_wrap(signer, wrap, expected_sender).await {
            Ok(opened) => Some(opened),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::debug!(wrap = %wrap.id, error = %e, "dropping envelope");
                None
            }
        };
        self.entries.lock().put(wrap.id, opened.clone());
        Ok(opened)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_sdk::prelude::*;
    use serde_json::json;

    fn signer(keys: &Keys) -> SessionSigner {
        SessionSigner::local(keys.clone())
    }

    /// Wrap an arbitrary seal for `recipient`.
    fn wrap_seal(seal: &Event, recipient: &PublicKey) -> Event {
        let throwaway = Keys::generate();
        let content = nip44::encrypt(
            throwaway.secret_key(),
            recipient,
            seal.as_json(),
            nip44::Version::V2,
        )
        .unwrap();
        EventBuilder::new(Kind::from(kinds::WRAP), content)
            .tag(Tag::public_key(*recipient))
            .sign_with_keys(&throwaway)
            .unwrap()
    }

    /// Seal raw rumor JSON as `sender`, optionally with extra tags.
    fn seal_json(sender: &Keys, recipient: &PublicKey, rumor_json: &str, tags: Vec<Tag>) -> Event {
        let content =
            nip44::encrypt(sender.secret_key(), recipient, rumor_json, nip44::Version::V2).unwrap();
        EventBuilder::new(Kind::from(kinds::SEAL), content)
            .tags(tags)
            .sign_with_keys(sender)
            .unwrap()
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let r = rumor(alice.public_key(), kinds::SCHEDULER_REQUEST, "{\"type\":\"ping\"}", vec![]);

        let wrap = build_wrap(&signer(&alice), &bob.public_key(), r.clone())
            .await
            .unwrap();
        assert_eq!(wrap.kind.as_u16(), kinds::WRAP);
        assert_ne!(wrap.pubkey, alice.public_key());
        assert!(wrap
            .tags
            .iter()
            .any(|t| t.as_slice() == ["p".to_string(), bob.public_key().to_hex()]));

        let opened = open_wrap(&signer(&bob), &wrap, Some(&alice.public_key()))
            .await
            .unwrap();
        assert_eq!(opened.sender, alice.public_key());
        assert_eq!(opened.rumor.content, r.content);
        assert_eq!(opened.rumor.id, r.id);
    }

    #[tokio::test]
    async fn test_seal_with_tags_is_rejected_even_when_decryptable() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let r = rumor(alice.public_key(), kinds::SCHEDULER_RESPONSE, "hi", vec![]);
        let seal = seal_json(
            &alice,
            &bob.public_key(),
            &r.as_json(),
            vec![Tag::public_key(bob.public_key())],
        );
        let wrap = wrap_seal(&seal, &bob.public_key());

        let err = open_wrap(&signer(&bob), &wrap, None).await.unwrap_err();
        assert!(matches!(
            err,
            EnvelopeError::Protocol(ProtocolViolation::SealHasTags)
        ));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_rumor_author_must_match_seal_author() {
        let alice = Keys::generate();
        let mallory = Keys::generate();
        let bob = Keys::generate();
        // Mallory seals a rumor that claims to come from Alice.
        let r = rumor(alice.public_key(), kinds::SCHEDULER_RESPONSE, "grant", vec![]);
        let seal = seal_json(&mallory, &bob.public_key(), &r.as_json(), vec![]);
        let wrap = wrap_seal(&seal, &bob.public_key());

        let err = open_wrap(&signer(&bob), &wrap, None).await.unwrap_err();
        assert!(matches!(
            err,
            EnvelopeError::Protocol(ProtocolViolation::AuthorMismatch)
        ));
    }

    #[tokio::test]
    async fn test_unexpected_sender_is_rejected() {
        let mallory = Keys::generate();
        let scheduler = Keys::generate();
        let bob = Keys::generate();
        let r = rumor(mallory.public_key(), kinds::SCHEDULER_RESPONSE, "grant", vec![]);
        let wrap = build_wrap(&signer(&mallory), &bob.public_key(), r)
            .await
            .unwrap();

        let err = open_wrap(&signer(&bob), &wrap, Some(&scheduler.public_key()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EnvelopeError::Protocol(ProtocolViolation::UnexpectedSender(_))
        ));
    }

    #[tokio::test]
    async fn test_tampered_rumor_id_is_rejected() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let r = rumor(alice.public_key(), kinds::SCHEDULER_RESPONSE, "original", vec![]);
        let mut value: serde_json::Value = serde_json::from_str(&r.as_json()).unwrap();
        value["content"] = json!("tampered");
        let seal = seal_json(&alice, &bob.public_key(), &value.to_string(), vec![]);
        let wrap = wrap_seal(&seal, &bob.public_key());

        let err = open_wrap(&signer(&bob), &wrap, None).await.unwrap_err();
        assert!(matches!(
            err,
            EnvelopeError::Protocol(ProtocolViolation::IdMismatch)
        ));
    }

    #[test]
    fn test_compute_rumor_id_matches_library() {
        let keys = Keys::generate();
        let r = rumor(
            keys.public_key(),
            kinds::SCHEDULER_REQUEST,
            "line\nbreak \"quoted\"",
            vec![Tag::identifier("x")],
        );
        assert_eq!(Some(compute_rumor_id(&r)), r.id.map(|id| id.to_hex()));
    }

    #[tokio::test]
    async fn test_decrypt_cache_remembers_failures() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let carol = Keys::generate();
        let r = rumor(alice.public_key(), kinds::SCHEDULER_RESPONSE, "x", vec![]);
        let for_carol = build_wrap(&signer(&alice), &carol.public_key(), r.clone())
            .await
            .unwrap();
        let for_bob = build_wrap(&signer(&alice), &bob.public_key(), r)
            .await
            .unwrap();

        let cache = DecryptCache::new();
        let bob_signer = signer(&bob);
        assert!(cache.open(&bob_signer, &for_carol, None).await.unwrap().is_none());
        assert!(cache.open(&bob_signer, &for_bob, None).await.unwrap().is_some());
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&for_carol.id));
        assert!(cache.open(&bob_signer, &for_bob, None).await.unwrap().is_some());
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_decrypt_cache_evicts_least_recent() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let bob_signer = signer(&bob);
        let mut wraps = Vec::new();
        for i in 0..3 {
            let r = rumor(alice.public_key(), kinds::SCHEDULER_RESPONSE, format!("m{}", i), vec![]);
            wraps.push(build_wrap(&signer(&alice), &bob.public_key(), r).await.unwrap());
        }

        let cache = DecryptCache::with_capacity(2);
        for wrap in &wraps {
            assert!(cache.open(&bob_signer, wrap, None).await.unwrap().is_some());
        }
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&wraps[0].id));
        assert!(cache.contains(&wraps[2].id));
    }
}
