#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// Implements the file lifecycle status model.
mod status;
pub use self::status::Status;

/// Implements the database gateway.
mod gateway;
pub use self::gateway::{Db, DbError, error_row_message};
