use std::fmt::{self, Display, Formatter};

/// The lifecycle states of a file record, as stored in the `status`
/// column of the `files` table.
///
/// This worker only ever writes [`Received`](Status::Received) (implicitly,
/// via the `insert_file` procedure) and [`InProgress`](Status::InProgress);
/// the remaining states belong to downstream services but share the same
/// column and are rendered identically everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The upload was announced and a record created.
    Received,
    /// This worker is splitting the header and archiving the payload.
    InProgress,
    /// The payload has been re-encrypted downstream.
    Completed,
    /// The file reached its final, stable location.
    Archived,
    /// Processing failed; see the `errors` table.
    Error,
}

impl Status {
    /// Renders the exact database value of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "Received",
            Self::InProgress => "In progress",
            Self::Completed => "Completed",
            Self::Archived => "Archived",
            Self::Error => "Error",
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn renders_database_values() {
        // `In progress` is spelled with a space in the schema
        assert_eq!(Status::InProgress.as_str(), "In progress");
        assert_eq!(Status::Received.to_string(), "Received");
        assert_eq!(Status::Archived.as_str(), "Archived");
    }
}
