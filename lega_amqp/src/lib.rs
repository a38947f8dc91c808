#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// Exposes the broker connection settings, including TLS.
mod settings;
pub use self::settings::{BrokerSettings, TlsSettings};

/// Implements TLS material loading for `amqps://` connections.
mod tls;

/// Exposes the incoming-delivery representation.
mod delivery;
pub use self::delivery::Delivery;

/// Implements the broker connection manager.
mod broker;
pub use self::broker::{Broker, BrokerError};
