//! Encryption at rest for plugin instance configuration

pub mod vault;

pub use vault::{ConfigVault, MasterKey, VaultError};
