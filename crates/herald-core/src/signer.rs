//! Signer capability used by the envelope codec, key bootstrap and relay AUTH.
//!
//! Every backend is a named variant of [`SignerKind`] and all calls go through
//! [`SessionSigner::backend`]. A read-only session is an [`Identity::ReadOnly`]
//! and has no `SessionSigner` at all, so it cannot reach code that signs or
//! decrypts.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use nostr_connect::client::NostrConnect;
use nostr_sdk::nips::nip49::EncryptedSecretKey;
use nostr_sdk::prelude::{
    Event, EventBuilder, FromBech32, Keys, NostrConnectURI, NostrSigner, PublicKey, RelayUrl,
    SecretKey, UnsignedEvent,
};

use crate::config::SignerTimeouts;
use crate::transport::ChallengeResponder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerOp {
    PublicKey,
    Sign,
    Encrypt,
    Decrypt,
}

impl fmt::Display for SignerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignerOp::PublicKey => "get_public_key",
            SignerOp::Sign => "sign_event",
            SignerOp::Encrypt => "nip44_encrypt",
            SignerOp::Decrypt => "nip44_decrypt",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SignerError {
    #[error("Signer refused {op}: {message}")]
    PermissionDenied { op: SignerOp, message: String },
    #[error("Signer timed out on {op} after {after:?}")]
    Timeout { op: SignerOp, after: Duration },
    #[error("Signer failed {op}: {message}")]
    Failed { op: SignerOp, message: String },
    #[error("Invalid signer credentials: {0}")]
    InvalidCredentials(String),
}

impl SignerError {
    /// Retrying without a change in signer state cannot succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SignerError::PermissionDenied { .. }
                | SignerError::Timeout { .. }
                | SignerError::InvalidCredentials(_)
        )
    }

    /// Map a backend error message onto the capability taxonomy.
    pub fn classify(op: SignerOp, message: impl Into<String>, timeout: Duration) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if ["permission", "denied", "not allowed", "unauthorized", "rejected"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            SignerError::PermissionDenied { op, message }
        } else if lower.contains("timeout") || lower.contains("timed out") {
            SignerError::Timeout { op, after: timeout }
        } else {
            SignerError::Failed { op, message }
        }
    }
}

/// Backends a session can sign with
#[derive(Clone)]
pub enum SignerKind {
    /// Secret key held in process
    LocalKey(Keys),
    /// Any other in-process or bridged signer (e.g. a browser extension bridge)
    External(Arc<dyn NostrSigner>),
    /// NIP-46 remote signer reached through a `bunker://` URI
    Bunker(Arc<NostrConnect>),
    /// NIP-46 remote signer paired through a `nostrconnect://` URI
    NostrConnect(Arc<NostrConnect>),
}

impl SignerKind {
    pub fn name(&self) -> &'static str {
        match self {
            SignerKind::LocalKey(_) => "local-key",
            SignerKind::External(_) => "external",
            SignerKind::Bunker(_) => "bunker",
            SignerKind::NostrConnect(_) => "nostr-connect",
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, SignerKind::Bunker(_) | SignerKind::NostrConnect(_))
    }
}

impl fmt::Debug for SignerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Who the session acts as.
#[derive(Debug, Clone)]
pub enum Identity {
    ReadOnly(PublicKey),
    Signing(SessionSigner),
}

impl Identity {
    pub fn public_key(&self) -> PublicKey {
        match self {
            Identity::ReadOnly(pk) => *pk,
            Identity::Signing(signer) => signer.public_key(),
        }
    }

    pub fn signer(&self) -> Option<&SessionSigner> {
        match self {
            Identity::ReadOnly(_) => None,
            Identity::Signing(signer) => Some(signer),
        }
    }
}

/// A signer with its public key resolved and per-operation timeouts attached
#[derive(Debug, Clone)]
pub struct SessionSigner {
    kind: SignerKind,
    public_key: PublicKey,
    timeouts: SignerTimeouts,
}

impl SessionSigner {
    /// Resolve the public key once; every later call reuses it.
    pub async fn connect(kind: SignerKind, timeouts: SignerTimeouts) -> Result<Self, SignerError> {
        let public_key = match &kind {
            SignerKind::LocalKey(keys) => keys.public_key(),
            _ => {
                let backend = Self::backend_of(&kind);
                Self::with_timeout(SignerOp::PublicKey, timeouts.public_key(), async {
                    backend.get_public_key().await.map_err(|e| e.to_string())
                })
                .await?
            }
        };
        tracing::debug!(signer = kind.name(), pubkey = %public_key, "signer ready");
        Ok(Self {
            kind,
            public_key,
            timeouts,
        })
    }

    /// In-process key; never touches the network.
    pub fn local(keys: Keys) -> Self {
        Self {
            public_key: keys.public_key(),
            kind: SignerKind::LocalKey(keys),
            timeouts: SignerTimeouts::local(),
        }
    }

    /// Parse an `nsec`/hex secret or a NIP-49 `ncryptsec` (requires `password`).
    pub fn from_secret(secret: &str, password: Option<&str>) -> Result<Self, SignerError> {
        let invalid = |e: String| SignerError::InvalidCredentials(e);
        let secret_key = if secret.starts_with("ncryptsec") {
            let password = password
                .filter(|p| !p.is_empty())
                .ok_or_else(|| invalid("Credentials are encrypted, password required".into()))?;
            let encrypted =
                EncryptedSecretKey::from_bech32(secret).map_err(|e| invalid(e.to_string()))?;
            encrypted
                .decrypt(password)
                .map_err(|e| invalid(e.to_string()))?
        } else {
            SecretKey::parse(secret).map_err(|e| invalid(e.to_string()))?
        };
        Ok(Self::local(Keys::new(secret_key)))
    }

    /// Connect a NIP-46 remote signer from a `bunker://` or `nostrconnect://` URI.
    pub async fn from_remote_uri(
        uri: &str,
        app_keys: Keys,
        timeouts: SignerTimeouts,
    ) -> Result<Self, SignerError> {
        let parsed = NostrConnectURI::parse(uri)
            .map_err(|e| SignerError::InvalidCredentials(e.to_string()))?;
        let is_bunker = uri.starts_with("bunker://");
        let client = NostrConnect::new(parsed, app_keys, timeouts.sign(), None)
            .map_err(|e| SignerError::InvalidCredentials(e.to_string()))?;
        let client = Arc::new(client);
        let kind = if is_bunker {
            SignerKind::Bunker(client)
        } else {
            SignerKind::NostrConnect(client)
        };
        Self::connect(kind, timeouts).await
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn kind(&self) -> &SignerKind {
        &self.kind
    }

    pub fn timeouts(&self) -> &SignerTimeouts {
        &self.timeouts
    }

    fn backend_of(kind: &SignerKind) -> &dyn NostrSigner {
        match kind {
            SignerKind::LocalKey(keys) => keys,
            SignerKind::External(signer) => signer.as_ref(),
            SignerKind::Bunker(client) | SignerKind::NostrConnect(client) => client.as_ref(),
        }
    }

    /// The single dispatch point for every backend call.
    fn backend(&self) -> &dyn NostrSigner {
        Self::backend_of(&self.kind)
    }

    async fn with_timeout<T, F>(op: SignerOp, after: Duration, fut: F) -> Result<T, SignerError>
    where
        F: Future<Output = Result<T, String>>,
    {
        match tokio::time::timeout(after, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(SignerError::classify(op, message, after)),
            Err(_) => Err(SignerError::Timeout { op, after }),
        }
    }

    pub async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event, SignerError> {
        Self::with_timeout(SignerOp::Sign, self.timeouts.sign(), async {
            self.backend()
                .sign_event(unsigned)
                .await
                .map_err(|e| e.to_string())
        })
        .await
    }

    pub async fn sign_builder(&self, builder: EventBuilder) -> Result<Event, SignerError> {
        self.sign_event(builder.build(self.public_key)).await
    }

    pub async fn nip44_encrypt(
        &self,
        peer: &PublicKey,
        plaintext: &str,
    ) -> Result<String, SignerError> {
        Self::with_timeout(SignerOp::Encrypt, self.timeouts.encrypt(), async {
            self.backend()
                .nip44_encrypt(peer, plaintext)
                .await
                .map_err(|e| e.to_string())
        })
        .await
    }

    pub async fn nip44_decrypt(
        &self,
        peer: &PublicKey,
        ciphertext: &str,
    ) -> Result<String, SignerError> {
        Self::with_timeout(SignerOp::Decrypt, self.timeouts.decrypt(), async {
            self.backend()
                .nip44_decrypt(peer, ciphertext)
                .await
                .map_err(|e| e.to_string())
        })
        .await
    }
}

impl ChallengeResponder for SessionSigner {
    fn respond<'a>(
        &'a self,
        relay_url: &'a str,
        challenge: &'a str,
    ) -> BoxFuture<'a, Result<Event, String>> {
        Box::pin(async move {
            let url = RelayUrl::parse(relay_url).map_err(|e| e.to_string())?;
            self.sign_builder(EventBuilder::auth(challenge, url))
                .await
                .map_err(|e| e.to_string())
        })
    }
}

/// Parse an `npub` or hex key for a read-only session
pub fn parse_public_key(value: &str) -> Result<PublicKey, SignerError> {
    PublicKey::parse(value).map_err(|e| SignerError::InvalidCredentials(e.to_string()))
}
