#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// Implements a bounded-attempt retry wrapper with a fixed interval.
mod retry;
pub use self::retry::{Retry, Retryable};

/// Implements credential redaction for logged connection URIs.
mod redact;
pub use self::redact::redact_uri;
