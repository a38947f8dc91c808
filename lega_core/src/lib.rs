#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// Application context.
mod context;
pub use self::context::AppContext;

/// Error taxonomy for message processing.
mod failure;
pub use self::failure::{SystemError, UserError, WorkFailure};

/// Reports the hostname of the machine this worker runs on, as recorded in
/// error rows and broker client properties.
pub fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}
