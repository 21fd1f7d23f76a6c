/// OS-backed storage for the bootstrap root secret
///
/// Uses the platform keyring:
/// - macOS/iOS: Keychain
/// - Linux: Secret Service API (gnome-keyring, KWallet, etc.)
/// - Windows: Credential Manager
use keyring::Entry;

const SERVICE_NAME: &str = "com.herald.scheduler-client";

#[derive(Debug, thiserror::Error)]
pub enum SecureStorageError {
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Root secret not found for {0}")]
    NotFound(String),
}

/// Root secrets keyed by (user, scheduler) pair
pub struct RootSecretVault;

impl RootSecretVault {
    fn account(user: &str, scheduler: &str) -> String {
        format!("root:{}:{}", user, scheduler)
    }

    pub fn set(user: &str, scheduler: &str, root_hex: &str) -> Result<(), SecureStorageError> {
        let entry = Entry::new(SERVICE_NAME, &Self::account(user, scheduler))?;
        entry.set_password(root_hex)?;
        Ok(())
    }

    pub fn get(user: &str, scheduler: &str) -> Result<String, SecureStorageError> {
        let account = Self::account(user, scheduler);
        let entry = Entry::new(SERVICE_NAME, &account)?;
        match entry.get_password() {
            Ok(value) => Ok(value),
            Err(keyring::Error::NoEntry) => Err(SecureStorageError::NotFound(account)),
            Err(e) => Err(SecureStorageError::Keyring(e)),
        }
    }

    pub fn delete(user: &str, scheduler: &str) -> Result<(), SecureStorageError> {
        let entry = Entry::new(SERVICE_NAME, &Self::account(user, scheduler))?;
        match entry.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()), // Already deleted is success
            Err(e) => Err(SecureStorageError::Keyring(e)),
        }
    }
}
