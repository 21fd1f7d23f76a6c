use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use herald_core::config::SignerTimeouts;
use herald_core::signer::{parse_public_key, Identity, SessionSigner};
use nostr_sdk::prelude::Keys;
use serde::{Deserialize, Serialize};

/// CLI configuration loaded from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CliConfig {
    /// Data directory holding `config.json` and the cache
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

/// How the CLI signs. Exactly one of `key`, `remote` or `npub` is expected.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// nsec (unencrypted) or ncryptsec (encrypted) key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Password for ncryptsec decryption
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// `bunker://` or `nostrconnect://` URI of a remote signer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,

    /// Public key only; the session is read-only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub npub: Option<String>,
}

impl CliConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: CliConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// `<data_dir>/cli.json` when present
    pub fn load_optional(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

impl Credentials {
    pub async fn identity(&self, timeouts: SignerTimeouts) -> Result<Identity> {
        if let Some(key) = &self.key {
            let signer = SessionSigner::from_secret(key, self.password.as_deref())
                .context("Failed to load key")?;
            return Ok(Identity::Signing(signer));
        }
        if let Some(uri) = &self.remote {
            let signer = SessionSigner::from_remote_uri(uri, Keys::generate(), timeouts)
                .await
                .context("Failed to connect remote signer")?;
            return Ok(Identity::Signing(signer));
        }
        if let Some(npub) = &self.npub {
            let pubkey = parse_public_key(npub).context("Invalid npub")?;
            return Ok(Identity::ReadOnly(pubkey));
        }
        bail!("No credentials configured: set credentials.key, credentials.remote or credentials.npub")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_config_with_key() {
        let json = r#"{
            "dataDir": "/tmp/herald",
            "credentials": {"key": "nsec1abc123", "password": "secret"}
        }"#;
        let config: CliConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/herald")));
        let creds = config.credentials.unwrap();
        assert_eq!(creds.key.as_deref(), Some("nsec1abc123"));
        assert_eq!(creds.password.as_deref(), Some("secret"));
        assert!(creds.remote.is_none());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempdir().unwrap();
        let config = CliConfig::load_optional(&dir.path().join("cli.json")).unwrap();
        assert!(config.data_dir.is_none());
        assert!(config.credentials.is_none());
    }

    #[tokio::test]
    async fn test_npub_gives_read_only_identity() {
        let keys = Keys::generate();
        let creds = Credentials {
            npub: Some(keys.public_key().to_hex()),
            ..Credentials::default()
        };
        let identity = creds.identity(SignerTimeouts::local()).await.unwrap();
        assert!(identity.signer().is_none());
        assert_eq!(identity.public_key(), keys.public_key());
    }

    #[tokio::test]
    async fn test_key_gives_signing_identity() {
        let keys = Keys::generate();
        let creds = Credentials {
            key: Some(keys.secret_key().to_secret_hex()),
            ..Credentials::default()
        };
        let identity = creds.identity(SignerTimeouts::local()).await.unwrap();
        assert_eq!(
            identity.signer().map(|s| s.public_key()),
            Some(keys.public_key())
        );
    }

    #[tokio::test]
    async fn test_no_credentials_is_an_error() {
        let result = Credentials::default().identity(SignerTimeouts::local()).await;
        assert!(result.is_err());
    }
}
