#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// Implements the sensitive-value resolver.
mod sensitive;
pub use self::sensitive::{Sensitive, SensitiveError, resolve_sensitive};

/// Implements the layered, read-only settings store.
mod settings;
pub use self::settings::{Settings, SettingsError};
