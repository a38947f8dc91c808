use std::error::Error as StdError;
use thiserror::Error;

/// Classifies the outcome of processing one inbound delivery.
///
/// The three variants drive three different broker-side reactions:
///
/// - [`Reject`](WorkFailure::Reject): a cooperative signal meaning “not for
///   me”; the delivery goes back to the queue unchanged and nothing is
///   recorded.
/// - [`User`](WorkFailure::User): the submitter did something wrong; they
///   are informed on the user-error routing key and the delivery is acked,
///   because redelivery cannot fix bad input.
/// - [`System`](WorkFailure::System): everything else; operators are
///   informed on the system-error routing key and the delivery is rejected
///   without requeue.
#[derive(Debug, Error)]
pub enum WorkFailure {
    /// Cooperative signal to put the delivery back on the queue.
    #[error("message handed back to the queue")]
    Reject,

    /// An error attributable to the submitting user.
    #[error(transparent)]
    User(#[from] UserError),

    /// An error attributable to the system.
    #[error(transparent)]
    System(#[from] SystemError),
}

impl WorkFailure {
    /// Reports whether this failure is attributable to the submitting user.
    pub fn is_from_user(&self) -> bool {
        matches!(self, Self::User(_))
    }

    /// Reports the error class name, as recorded in error rows and in the
    /// formal rendering.
    pub fn class(&self) -> &str {
        match self {
            Self::Reject => "RejectMessage",
            Self::User(error) => error.class(),
            Self::System(error) => error.class(),
        }
    }

    /// Renders the human-oriented description of this failure.
    pub fn informal(&self) -> String {
        self.to_string()
    }

    /// Renders the technical description of this failure, prefixed with the
    /// error class name.
    pub fn formal(&self) -> String {
        match self {
            Self::Reject => "RejectMessage".to_string(),
            Self::User(error) => format!("{}: {}", error.class(), error),
            Self::System(error) => error.formal().to_string(),
        }
    }
}

/// An error caused by the submitting user: a missing inbox file, a payload
/// that is not a valid encrypted container, and the like.
///
/// Carries a user-facing reason (the [`Display`](std::fmt::Display)
/// rendering) separately from the technical cause (the
/// [`source`](StdError::source) chain), so that the user sees a readable
/// sentence while operators get the full trail.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct UserError {
    class: &'static str,
    reason: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl UserError {
    /// Creates a new user error with the given class name and reason.
    pub fn new(class: &'static str, reason: impl Into<String>) -> Self {
        Self {
            class,
            reason: reason.into(),
            source: None,
        }
    }

    /// Creates a new user error that preserves the original cause.
    pub fn with_source(
        class: &'static str,
        reason: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            class,
            reason: reason.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Shorthand for the error raised when the announced file is absent from
    /// the user inbox.
    pub fn not_found_in_inbox(filepath: impl AsRef<str>) -> Self {
        Self::new(
            "NotFoundInInbox",
            format!("File not found in inbox: {}", filepath.as_ref()),
        )
    }

    /// Reports the error class name.
    pub fn class(&self) -> &'static str {
        self.class
    }

    /// Reports the user-facing reason.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// An error attributable to the system rather than the submitting user.
///
/// Captures both renderings of the original cause at construction time: the
/// informal one (its [`Display`](std::fmt::Display)) and the formal one (its
/// [`Debug`](std::fmt::Debug)), so the cause itself does not need to stay
/// alive, or `Send`, for the lifetime of this value.
#[derive(Debug, Error)]
#[error("{informal}")]
pub struct SystemError {
    class: &'static str,
    informal: String,
    formal: String,
}

impl SystemError {
    /// Wraps the given error, recording the given class name along with both
    /// renderings of the cause.
    pub fn wrap<E>(class: &'static str, error: &E) -> Self
    where
        E: StdError,
    {
        Self {
            class,
            informal: error.to_string(),
            formal: format!("{}: {:?}", class, error),
        }
    }

    /// Creates a system error from a bare message, for failures that have no
    /// underlying error value.
    pub fn message(class: &'static str, informal: impl Into<String>) -> Self {
        let informal = informal.into();
        let formal = format!("{}: {}", class, informal);

        Self {
            class,
            informal,
            formal,
        }
    }

    /// Reports the error class name.
    pub fn class(&self) -> &'static str {
        self.class
    }

    /// Reports the technical rendering of the original cause.
    pub fn formal(&self) -> &str {
        &self.formal
    }
}
