//! Working keys.
//!
//! A single root secret obtained during key bootstrap expands into one
//! symmetric subkey per payload category (HKDF-SHA256, fixed labels). Subkeys
//! and the DM preview key encrypt with ChaCha20-Poly1305 and serialize as
//! `base64(nonce || ciphertext)`.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use nostr_sdk::prelude::PublicKey;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::constants::labels;
use crate::signer::{SessionSigner, SignerError};

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("Invalid key material: {0}")]
    InvalidKey(String),
    #[error("Invalid payload encoding: {0}")]
    Encoding(String),
    #[error("Payload shorter than a nonce")]
    Truncated,
    #[error("Encryption failed")]
    Encrypt,
    #[error("Decryption failed")]
    Decrypt,
    #[error("Invalid payload JSON: {0}")]
    Json(#[from] serde_json::Error),
}

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32], CipherError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// RFC 5869 HKDF with SHA-256, filling `out` (at most 255 blocks).
pub fn hkdf_sha256(salt: &[u8], ikm: &[u8], info: &[u8], out: &mut [u8]) -> Result<(), CipherError> {
    if out.len() > 255 * 32 {
        return Err(CipherError::InvalidKey("requested output too long".into()));
    }
    let prk = hmac_sha256(salt, &[ikm])?;
    let mut previous: Vec<u8> = Vec::new();
    for (i, chunk) in out.chunks_mut(32).enumerate() {
        let counter = [(i + 1) as u8];
        let block = hmac_sha256(&prk, &[previous.as_slice(), info, &counter[..]])?;
        chunk.copy_from_slice(&block[..chunk.len()]);
        previous = block.to_vec();
    }
    Ok(())
}

fn seal_with(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<String, CipherError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CipherError::Encrypt)?;
    let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(payload))
}

fn open_with(key: &[u8; KEY_LEN], payload: &str) -> Result<Vec<u8>, CipherError> {
    let raw = BASE64
        .decode(payload.trim())
        .map_err(|e| CipherError::Encoding(e.to_string()))?;
    if raw.len() <= NONCE_LEN {
        return Err(CipherError::Truncated);
    }
    let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
    ChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CipherError::Decrypt)
}

fn key_from_hex(value: &str) -> Result<[u8; KEY_LEN], CipherError> {
    let bytes = hex::decode(value.trim()).map_err(|e| CipherError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| CipherError::InvalidKey(format!("expected {} bytes", KEY_LEN)))
}

fn random_key() -> [u8; KEY_LEN] {
    ChaCha20Poly1305::generate_key(&mut OsRng).into()
}

/// Secret shared with the scheduler; never leaves the device except inside a
/// key grant.
#[derive(Clone, PartialEq, Eq)]
pub struct RootSecret([u8; KEY_LEN]);

impl RootSecret {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(value: &str) -> Result<Self, CipherError> {
        key_from_hex(value).map(Self)
    }

    pub fn generate() -> Self {
        Self(random_key())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for RootSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RootSecret(..)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyPurpose {
    /// Ledger records published by the scheduler
    Mailbox,
    /// Job payloads submitted by the client
    Submit,
    /// Direct message bodies
    Dm,
    /// Media metadata
    Blob,
}

impl KeyPurpose {
    pub const ALL: [KeyPurpose; 4] = [
        KeyPurpose::Mailbox,
        KeyPurpose::Submit,
        KeyPurpose::Dm,
        KeyPurpose::Blob,
    ];

    pub fn label(self) -> &'static [u8] {
        match self {
            KeyPurpose::Mailbox => labels::MAILBOX,
            KeyPurpose::Submit => labels::SUBMIT,
            KeyPurpose::Dm => labels::DM,
            KeyPurpose::Blob => labels::BLOB,
        }
    }
}

#[derive(Clone)]
pub struct SubKey {
    purpose: KeyPurpose,
    key: [u8; KEY_LEN],
}

impl SubKey {
    pub fn purpose(&self) -> KeyPurpose {
        self.purpose
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<String, CipherError> {
        seal_with(&self.key, plaintext)
    }

    pub fn open(&self, payload: &str) -> Result<Vec<u8>, CipherError> {
        open_with(&self.key, payload)
    }

    pub fn seal_json<T: Serialize>(&self, value: &T) -> Result<String, CipherError> {
        self.seal(&serde_json::to_vec(value)?)
    }

    pub fn open_json<T: DeserializeOwned>(&self, payload: &str) -> Result<T, CipherError> {
        Ok(serde_json::from_slice(&self.open(payload)?)?)
    }
}

impl fmt::Debug for SubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubKey")
            .field("purpose", &self.purpose)
            .finish_non_exhaustive()
    }
}

/// Root secret plus the four subkeys derived from it
#[derive(Debug, Clone)]
pub struct MasterKeySet {
    root: RootSecret,
    mailbox: SubKey,
    submit: SubKey,
    dm: SubKey,
    blob: SubKey,
}

impl MasterKeySet {
    pub fn derive(root: RootSecret) -> Result<Self, CipherError> {
        let derive = |purpose: KeyPurpose| -> Result<SubKey, CipherError> {
            let mut key = [0u8; KEY_LEN];
            hkdf_sha256(labels::SALT, root.as_bytes(), purpose.label(), &mut key)?;
            Ok(SubKey { purpose, key })
        };
        Ok(Self {
            mailbox: derive(KeyPurpose::Mailbox)?,
            submit: derive(KeyPurpose::Submit)?,
            dm: derive(KeyPurpose::Dm)?,
            blob: derive(KeyPurpose::Blob)?,
            root,
        })
    }

    pub fn root(&self) -> &RootSecret {
        &self.root
    }

    pub fn get(&self, purpose: KeyPurpose) -> &SubKey {
        match purpose {
            KeyPurpose::Mailbox => &self.mailbox,
            KeyPurpose::Submit => &self.submit,
            KeyPurpose::Dm => &self.dm,
            KeyPurpose::Blob => &self.blob,
        }
    }

    pub fn mailbox(&self) -> &SubKey {
        &self.mailbox
    }

    pub fn submit(&self) -> &SubKey {
        &self.submit
    }

    pub fn dm(&self) -> &SubKey {
        &self.dm
    }

    pub fn blob(&self) -> &SubKey {
        &self.blob
    }

    pub fn seal_blob_metadata(&self, metadata: &BlobMetadata) -> Result<String, CipherError> {
        self.blob.seal_json(metadata)
    }

    pub fn open_blob_metadata(&self, payload: &str) -> Result<BlobMetadata, CipherError> {
        self.blob.open_json(payload)
    }
}

/// Description of an uploaded media object attached to a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobMetadata {
    pub url: String,
    pub mime_type: String,
    pub size: u64,
    /// Hex SHA-256 of the plaintext blob
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
}

/// The DM preview key, encrypted to its owner's own public key. The scheduler
/// relays capsules but cannot open them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewKeyCapsule {
    pub pubkey: String,
    pub ciphertext: String,
}

/// Key for DM previews; held only by the user's own devices.
#[derive(Clone, PartialEq, Eq)]
pub struct PreviewKey([u8; KEY_LEN]);

impl PreviewKey {
    pub fn generate() -> Self {
        Self(random_key())
    }

    pub fn from_hex(value: &str) -> Result<Self, CipherError> {
        key_from_hex(value).map(Self)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn seal(&self, preview: &str) -> Result<String, CipherError> {
        seal_with(&self.0, preview.as_bytes())
    }

    pub fn open(&self, payload: &str) -> Result<String, CipherError> {
        let bytes = open_with(&self.0, payload)?;
        String::from_utf8(bytes).map_err(|e| CipherError::Encoding(e.to_string()))
    }

    pub async fn to_capsule(&self, signer: &SessionSigner) -> Result<PreviewKeyCapsule, SignerError> {
        let own = signer.public_key();
        let ciphertext = signer.nip44_encrypt(&own, &self.to_hex()).await?;
        Ok(PreviewKeyCapsule {
            pubkey: own.to_hex(),
            ciphertext,
        })
    }

    /// Open the first capsule addressed to `signer`. Capsules that fail to
    /// decrypt are skipped unless the signer failure is fatal.
    pub async fn from_capsules(
        signer: &SessionSigner,
        capsules: &[PreviewKeyCapsule],
    ) -> Result<Option<Self>, SignerError> {
        let own = signer.public_key();
        for capsule in capsules {
            if PublicKey::from_hex(&capsule.pubkey).ok() != Some(own) {
                continue;
            }
            match signer.nip44_decrypt(&own, &capsule.ciphertext).await {
                Ok(plaintext) => match Self::from_hex(&plaintext) {
                    Ok(key) => return Ok(Some(key)),
                    Err(e) => tracing::debug!(error = %e, "capsule held invalid key"),
                },
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::debug!(error = %e, "skipping unreadable capsule"),
            }
        }
        Ok(None)
    }
}

impl fmt::Debug for PreviewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PreviewKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_sdk::prelude::Keys;

    #[test]
    fn test_hkdf_rfc5869_case_one() {
        let ikm = [0x0bu8; 22];
        let salt = hex::decode("000102030405060708090a0b0c").unwrap();
        let info = hex::decode("f0f1f2f3f4f5f6f7f8f9").unwrap();
        let mut okm = [0u8; 42];
        hkdf_sha256(&salt, &ikm, &info, &mut okm).unwrap();
        assert_eq!(
            hex::encode(okm),
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865"
        );
    }

    #[test]
    fn test_subkeys_are_distinct_and_deterministic() {
        let root = RootSecret::from_bytes([7u8; KEY_LEN]);
        let a = MasterKeySet::derive(root.clone()).unwrap();
        let b = MasterKeySet::derive(root).unwrap();

        for purpose in KeyPurpose::ALL {
            assert_eq!(a.get(purpose).key, b.get(purpose).key);
        }
        let mut seen: Vec<[u8; KEY_LEN]> = KeyPurpose::ALL.iter().map(|p| a.get(*p).key).collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn test_subkey_rejects_other_category() {
        let keys = MasterKeySet::derive(RootSecret::generate()).unwrap();
        let sealed = keys.mailbox().seal(b"{\"rev\":1}").unwrap();
        assert_eq!(keys.mailbox().open(&sealed).unwrap(), b"{\"rev\":1}");
        assert!(matches!(keys.submit().open(&sealed), Err(CipherError::Decrypt)));
    }

    #[test]
    fn test_open_rejects_malformed_payloads() {
        let keys = MasterKeySet::derive(RootSecret::generate()).unwrap();
        assert!(matches!(keys.dm().open("%%%"), Err(CipherError::Encoding(_))));
        assert!(matches!(
            keys.dm().open(&BASE64.encode([0u8; 8])),
            Err(CipherError::Truncated)
        ));
    }

    #[test]
    fn test_blob_metadata_uses_blob_key() {
        let keys = MasterKeySet::derive(RootSecret::generate()).unwrap();
        let meta = BlobMetadata {
            url: "https://cdn.example/a.png".into(),
            mime_type: "image/png".into(),
            size: 1024,
            sha256: "ab".repeat(32),
            alt: None,
        };
        let sealed = keys.seal_blob_metadata(&meta).unwrap();
        assert_eq!(keys.open_blob_metadata(&sealed).unwrap(), meta);
        assert!(keys.mailbox().open(&sealed).is_err());
    }

    #[test]
    fn test_root_secret_hex() {
        let root = RootSecret::generate();
        assert_eq!(RootSecret::from_hex(&root.to_hex()).unwrap(), root);
        assert!(RootSecret::from_hex("abcd").is_err());
        assert_eq!(format!("{:?}", root), "RootSecret(..)");
    }

    #[tokio::test]
    async fn test_preview_capsule_opens_only_for_owner() {
        let owner = SessionSigner::local(Keys::generate());
        let stranger = SessionSigner::local(Keys::generate());
        let key = PreviewKey::generate();
        let capsule = key.to_capsule(&owner).await.unwrap();

        let opened = PreviewKey::from_capsules(&owner, &[capsule.clone()])
            .await
            .unwrap();
        assert_eq!(opened, Some(key.clone()));
        assert_eq!(
            PreviewKey::from_capsules(&stranger, &[capsule]).await.unwrap(),
            None
        );

        let sealed = key.seal("see you at 5").unwrap();
        assert_eq!(key.open(&sealed).unwrap(), "see you at 5");
    }
}
