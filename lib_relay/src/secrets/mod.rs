//! # Secrets Module
//!
//! Everything needed to turn a vault name and a secret name into the secret's
//! current value.
//!
//! ## Contained Modules:
//! - **`credential`**: identity credentials (`TokenCredential` and its sources).
//! - **`key_vault`**: the `SecretResolver` seam and its key vault implementation.
//! - **`secret_value`**: the redacted `SecretValue` newtype.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Bearer-token sources for the secret store.
pub mod credential;
/// Key vault secret retrieval.
pub mod key_vault;
/// Redacted secret wrapper.
pub mod secret_value;

// --- Public API Re-exports ---
pub use credential::{
    AccessToken, ClientSecretCredential, CredentialError, DefaultCredential,
    ManagedIdentityCredential, ManagedIdentitySource, StaticTokenCredential, TokenCredential,
    KEY_VAULT_SCOPE,
};
pub use key_vault::{KeyVaultResolver, SecretResolver, SecretRetrievalError};
pub use secret_value::SecretValue;
