#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

use async_trait::async_trait;
use lega_conf::{Settings, SettingsError};
use lega_core::{SystemError, WorkFailure};
use thiserror::Error;
use tokio::io::AsyncRead;

/// Implements the filesystem vault driver.
mod file;
pub use self::file::FileVault;

/// The storage capability the worker depends on.
///
/// A driver hands out an opaque destination for a file id and streams
/// payload bytes into it. Everything else about the vault's internal
/// structure belongs to the driver.
#[async_trait]
pub trait Vault: Send + Sync {
    /// Returns the destination for the payload of the given file id.
    ///
    /// The returned string is opaque to the caller: it is recorded in the
    /// database and passed back to [`copy`](Vault::copy), nothing more.
    fn location(&self, file_id: i64) -> String;

    /// Streams the given reader to the given destination until EOF and
    /// returns the number of bytes written.
    async fn copy(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        target: &str,
    ) -> Result<u64, VaultError>;
}

/// Represents a failure in the vault storage layer.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The `vault` configuration section is unusable.
    #[error(transparent)]
    Config(#[from] SettingsError),

    /// The configured driver name is not known.
    #[error("unknown vault driver '{name}'")]
    UnknownDriver {
        /// The configured driver name.
        name: String,
    },

    /// An I/O failure while writing to the vault.
    #[error("vault write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A vault write failure is never the submitting user's fault.
impl From<VaultError> for WorkFailure {
    fn from(error: VaultError) -> Self {
        WorkFailure::System(SystemError::wrap("VaultError", &error))
    }
}

/// Builds the vault driver selected by the `vault.driver` configuration
/// key (default `FileStorage`).
///
/// An unrecognized driver name is a startup configuration error; there is
/// no fallback driver.
pub fn from_settings(settings: &Settings) -> Result<Box<dyn Vault>, VaultError> {
    let driver = settings.get_or("vault", "driver", "FileStorage")?;

    match driver.as_str() {
        "FileStorage" => {
            let root = settings.get("vault", "location")?;

            Ok(Box::new(FileVault::new(root)))
        }
        _ => Err(VaultError::UnknownDriver { name: driver }),
    }
}
