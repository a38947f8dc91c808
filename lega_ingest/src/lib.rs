#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// Implements the Crypt4GH container header split.
pub mod header;

/// Implements message-shaping helpers (user id sanitizing, scrubbing,
/// error envelopes).
pub mod message;

/// Exposes the routing configuration read from the `DEFAULT` section.
mod routing;
pub use self::routing::{PROGRESS_EXCHANGE, PROGRESS_ROUTING_KEY, Routing};

/// Implements the per-delivery dispatcher.
mod dispatch;
pub use self::dispatch::Dispatcher;

/// Implements the ingestion pipeline.
mod worker;
pub use self::worker::IngestWorker;
