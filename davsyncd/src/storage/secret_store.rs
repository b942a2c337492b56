use std::collections::HashMap;
use std::sync::Mutex;

use keyring::Entry;
use thiserror::Error;

const SERVICE_NAME: &str = "davsync";

#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),
    #[error("secret store is unavailable")]
    Unavailable,
}

/// Secrets (server passwords) keyed by synchronizer uid.
pub trait SecretStore: Send + Sync {
    fn get_secret(&self, key: &str) -> Result<Option<String>, SecretStoreError>;

    fn set_secret(&self, key: &str, secret: &str) -> Result<(), SecretStoreError>;

    fn delete_secret(&self, key: &str) -> Result<(), SecretStoreError>;
}

/// Backed by the platform keyring (Secret Service on Linux).
pub struct KeyringSecretStore {
    service: String,
}

impl Default for KeyringSecretStore {
    fn default() -> Self {
        Self::new(SERVICE_NAME)
    }
}

impl KeyringSecretStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, SecretStoreError> {
        Ok(Entry::new(&self.service, key)?)
    }
}

impl SecretStore for KeyringSecretStore {
    fn get_secret(&self, key: &str) -> Result<Option<String>, SecretStoreError> {
        match self.entry(key)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set_secret(&self, key: &str, secret: &str) -> Result<(), SecretStoreError> {
        self.entry(key)?.set_password(secret)?;
        Ok(())
    }

    fn delete_secret(&self, key: &str) -> Result<(), SecretStoreError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, String>>,
}

impl SecretStore for MemorySecretStore {
    fn get_secret(&self, key: &str) -> Result<Option<String>, SecretStoreError> {
        let secrets = self
            .secrets
            .lock()
            .map_err(|_| SecretStoreError::Unavailable)?;
        Ok(secrets.get(key).cloned())
    }

    fn set_secret(&self, key: &str, secret: &str) -> Result<(), SecretStoreError> {
        self.secrets
            .lock()
            .map_err(|_| SecretStoreError::Unavailable)?
            .insert(key.to_string(), secret.to_string());
        Ok(())
    }

    fn delete_secret(&self, key: &str) -> Result<(), SecretStoreError> {
        self.secrets
            .lock()
            .map_err(|_| SecretStoreError::Unavailable)?
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trips_and_deletes() {
        let store = MemorySecretStore::default();
        assert_eq!(store.get_secret("uid-1").unwrap(), None);

        store.set_secret("uid-1", "hunter2").unwrap();
        assert_eq!(store.get_secret("uid-1").unwrap().as_deref(), Some("hunter2"));
        assert_eq!(store.get_secret("uid-2").unwrap(), None);

        store.delete_secret("uid-1").unwrap();
        store.delete_secret("uid-1").unwrap();
        assert_eq!(store.get_secret("uid-1").unwrap(), None);
    }
}
