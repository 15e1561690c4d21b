pub mod config;
pub mod crypto;
pub mod error;
pub mod keystore;
pub mod selector;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Result, VaultError};
