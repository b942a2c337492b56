pub mod secret_store;

pub use secret_store::{KeyringSecretStore, MemorySecretStore, SecretStore, SecretStoreError};
