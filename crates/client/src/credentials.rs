//! Credential persistence.
//!
//! The session keeps the device identity (`imei`) and account key in a named
//! secret store. Store failures are logged and otherwise treated as "no
//! credentials"; they never propagate into the session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, warn};

/// Secret name of the device identity.
pub const IMEI_KEY: &str = "imei";
/// Secret name of the account key.
pub const ACCOUNT_KEY_KEY: &str = "accountKey";

#[derive(Debug, thiserror::Error)]
pub enum CredentialStoreError {
    #[error("keychain error: {0}")]
    Keychain(String),
    #[error("credential store is unavailable: {0}")]
    Unavailable(String),
}

#[cfg(feature = "os-keychain")]
impl From<keyring::Error> for CredentialStoreError {
    fn from(err: keyring::Error) -> Self {
        CredentialStoreError::Keychain(err.to_string())
    }
}

/// A named secret store.
pub trait SecretBackend: Send + Sync {
    fn set(&self, name: &str, value: &str) -> Result<(), CredentialStoreError>;
    /// Returns `Ok(None)` when no secret exists under `name`.
    fn get(&self, name: &str) -> Result<Option<String>, CredentialStoreError>;
    /// Removing a missing secret is not an error.
    fn remove(&self, name: &str) -> Result<(), CredentialStoreError>;
}

/// The identity pair used to authenticate with the server.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub imei: String,
    pub account_key: String,
}

impl Credentials {
    pub fn new(imei: impl Into<String>, account_key: impl Into<String>) -> Self {
        Self {
            imei: imei.into(),
            account_key: account_key.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("imei", &self.imei)
            .field("account_key", &"<redacted>")
            .finish()
    }
}

/// Fire-and-forget access to a [`SecretBackend`].
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn SecretBackend>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn SecretBackend>) -> Self {
        Self { backend }
    }

    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::default()))
    }

    /// A store backed by the operating system keychain.
    #[cfg(feature = "os-keychain")]
    pub fn keychain(service: impl Into<String>) -> Self {
        Self::new(Arc::new(KeychainBackend::new(service)))
    }

    pub fn save(&self, name: &str, value: &str) {
        if let Err(e) = self.backend.set(name, value) {
            error!(name, error = %e, "Error saving credential");
        }
    }

    pub fn read(&self, name: &str) -> Option<String> {
        match self.backend.get(name) {
            Ok(value) => value,
            Err(e) => {
                error!(name, error = %e, "Error reading credential");
                None
            }
        }
    }

    pub fn delete(&self, name: &str) {
        if let Err(e) = self.backend.remove(name) {
            error!(name, error = %e, "Error deleting credential");
        }
    }

    pub fn save_credentials(&self, credentials: &Credentials) {
        self.save(IMEI_KEY, &credentials.imei);
        self.save(ACCOUNT_KEY_KEY, &credentials.account_key);
    }

    /// Both stored secrets, when both can be read.
    pub fn load_credentials(&self) -> Option<Credentials> {
        let imei = self.read(IMEI_KEY);
        let account_key = self.read(ACCOUNT_KEY_KEY);
        match (imei, account_key) {
            (Some(imei), Some(account_key)) => Some(Credentials { imei, account_key }),
            _ => {
                warn!("Unable to read imei or accountKey");
                None
            }
        }
    }

    /// Both stored secrets, when both are present and non-empty.
    pub fn usable_credentials(&self) -> Option<Credentials> {
        self.load_credentials()
            .filter(|c| !c.imei.is_empty() && !c.account_key.is_empty())
    }

    pub fn has_credentials(&self) -> bool {
        self.usable_credentials().is_some()
    }

    pub fn clear_credentials(&self) {
        self.delete(IMEI_KEY);
        self.delete(ACCOUNT_KEY_KEY);
    }
}

/// Process-local secret storage.
#[derive(Default)]
pub struct MemoryBackend {
    secrets: Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    fn secrets(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, CredentialStoreError> {
        self.secrets
            .lock()
            .map_err(|e| CredentialStoreError::Unavailable(e.to_string()))
    }
}

impl SecretBackend for MemoryBackend {
    fn set(&self, name: &str, value: &str) -> Result<(), CredentialStoreError> {
        self.secrets()?.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<String>, CredentialStoreError> {
        Ok(self.secrets()?.get(name).cloned())
    }

    fn remove(&self, name: &str) -> Result<(), CredentialStoreError> {
        self.secrets()?.remove(name);
        Ok(())
    }
}

/// Secrets kept in the OS keychain, one entry per name under a shared service.
#[cfg(feature = "os-keychain")]
pub struct KeychainBackend {
    service: String,
}

#[cfg(feature = "os-keychain")]
impl KeychainBackend {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, name: &str) -> Result<keyring::Entry, CredentialStoreError> {
        Ok(keyring::Entry::new(&self.service, name)?)
    }
}

#[cfg(feature = "os-keychain")]
impl SecretBackend for KeychainBackend {
    fn set(&self, name: &str, value: &str) -> Result<(), CredentialStoreError> {
        Ok(self.entry(name)?.set_password(value)?)
    }

    fn get(&self, name: &str) -> Result<Option<String>, CredentialStoreError> {
        match self.entry(name)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, name: &str) -> Result<(), CredentialStoreError> {
        match self.entry(name)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A backend whose every call fails.
    pub(crate) struct BrokenBackend;

    impl SecretBackend for BrokenBackend {
        fn set(&self, _name: &str, _value: &str) -> Result<(), CredentialStoreError> {
            Err(CredentialStoreError::Unavailable("locked".to_string()))
        }

        fn get(&self, _name: &str) -> Result<Option<String>, CredentialStoreError> {
            Err(CredentialStoreError::Unavailable("locked".to_string()))
        }

        fn remove(&self, _name: &str) -> Result<(), CredentialStoreError> {
            Err(CredentialStoreError::Unavailable("locked".to_string()))
        }
    }

    #[test]
    fn test_save_read_delete() {
        let store = CredentialStore::in_memory();
        assert_eq!(store.read(IMEI_KEY), None);

        store.save(IMEI_KEY, "356938035643809");
        assert_eq!(store.read(IMEI_KEY).as_deref(), Some("356938035643809"));

        store.delete(IMEI_KEY);
        assert_eq!(store.read(IMEI_KEY), None);
        // Deleting twice is harmless.
        store.delete(IMEI_KEY);
    }

    #[test]
    fn test_credentials_require_both_non_empty_values() {
        let store = CredentialStore::in_memory();
        assert!(!store.has_credentials());

        store.save(IMEI_KEY, "123");
        assert!(!store.has_credentials());
        assert!(store.load_credentials().is_none());

        store.save(ACCOUNT_KEY_KEY, "");
        assert!(store.load_credentials().is_some());
        assert!(!store.has_credentials());

        store.save_credentials(&Credentials::new("123", "key"));
        assert!(store.has_credentials());
        assert_eq!(
            store.load_credentials(),
            Some(Credentials::new("123", "key"))
        );

        store.clear_credentials();
        assert!(!store.has_credentials());
    }

    #[test]
    fn test_backend_failures_read_as_no_credentials() {
        let store = CredentialStore::new(Arc::new(BrokenBackend));
        store.save_credentials(&Credentials::new("123", "key"));
        assert_eq!(store.read(IMEI_KEY), None);
        assert!(!store.has_credentials());
        store.clear_credentials();
    }

    #[test]
    fn test_debug_redacts_account_key() {
        let rendered = format!("{:?}", Credentials::new("123", "hunter2"));
        assert!(rendered.contains("123"));
        assert!(!rendered.contains("hunter2"));
    }
}
