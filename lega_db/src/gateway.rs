use crate::Status;
use lega_conf::{Settings, SettingsError};
use lega_core::{SystemError, WorkFailure, hostname};
use lega_util::{Retry, Retryable, redact_uri};
use secure_string::SecureString;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// The gateway to the ingestion database.
///
/// Owns a small `sqlx` Postgres pool and exposes only the fixed set of
/// parameterized operations this worker is contractually allowed to
/// perform. Row creation and error recording go through the database's
/// own stored procedures (`insert_file`, `insert_error`); everything else
/// is a fixed `UPDATE`.
#[derive(Debug, Clone)]
pub struct Db {
    pool: PgPool,
    identifier: String,
}

/// Represents a failure inside the database gateway.
#[derive(Debug, Error)]
pub enum DbError {
    /// The `db` configuration section is unusable.
    #[error(transparent)]
    Config(#[from] SettingsError),

    /// A query or connection attempt failed.
    #[error(transparent)]
    Query(#[from] sqlx::Error),
}

impl Retryable for DbError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Query(error) => matches!(
                error,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_)
            ),
        }
    }
}

/// Every gateway failure is a system error from the pipeline's point of
/// view; user attribution never originates in the database layer.
impl From<DbError> for WorkFailure {
    fn from(error: DbError) -> Self {
        WorkFailure::System(SystemError::wrap("DatabaseError", &error))
    }
}

impl Db {
    /// Establishes the database pool from the `db` section of the given
    /// settings, retrying transient failures `db.try` times at
    /// `db.try_interval`-second intervals.
    pub async fn connect(settings: &Settings) -> Result<Self, DbError> {
        let dsn = settings
            .get_sensitive("db", "connection")?
            .ok_or_else(|| SettingsError::MissingKey {
                section: "db".to_string(),
                key: "connection".to_string(),
            })?
            .into_text()
            .map_err(SettingsError::from)?;
        let dsn = SecureString::from(dsn);

        let attempts = settings.get_int_or("db", "try", Retry::DEFAULT_ATTEMPTS as i64)? as u32;
        let interval = settings.get_int_or("db", "try_interval", 1)? as u64;
        let retry = Retry::new("db:connect", attempts, Duration::from_secs(interval));

        let identifier = redact_uri(dsn.unsecure());
        info!(identifier = identifier.as_str(), "Initializing a database connection pool");

        let pool = retry
            .run(
                || async {
                    PgPoolOptions::new()
                        // One delivery is in flight at a time
                        .max_connections(1)
                        .connect(dsn.unsecure())
                        .await
                        .map_err(DbError::from)
                },
                || {},
            )
            .await?;

        Ok(Self { pool, identifier })
    }

    /// Wraps an already established pool. Intended for tests and tooling.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            identifier: "<pool>".to_string(),
        }
    }

    /// Reports the redacted identifier of the database this gateway points
    /// at.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Closes the pooled connections.
    pub async fn close(&self) {
        info!(
            identifier = self.identifier.as_str(),
            "Closing the database connection pool",
        );

        self.pool.close().await;
    }
}

impl Db {
    /// Creates a file record in state [`Received`](Status::Received) and
    /// returns its database-assigned id.
    pub async fn insert_file(&self, filepath: &str, user_id: &str) -> Result<i64, DbError> {
        debug!(filepath, user_id, "Inserting a file record");

        let file_id: i64 = sqlx::query_scalar("SELECT insert_file($1, $2, $3)")
            .bind(filepath)
            .bind(user_id)
            .bind(Status::Received.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(file_id)
    }

    /// Moves the file record to [`In progress`](Status::InProgress).
    pub async fn mark_in_progress(&self, file_id: i64) -> Result<(), DbError> {
        debug!(file_id, "Updating status to {}", Status::InProgress);

        sqlx::query("UPDATE files SET status = $1 WHERE id = $2")
            .bind(Status::InProgress.as_str())
            .bind(file_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Persists the vault location, the archived payload size, and the hex
    /// rendering of the full header prefix. Does not touch the status.
    pub async fn set_info(
        &self,
        file_id: i64,
        vault_path: &str,
        vault_size: i64,
        header_hex: &str,
    ) -> Result<(), DbError> {
        debug!(file_id, vault_path, vault_size, "Recording vault information");

        sqlx::query("UPDATE files SET vault_path = $1, vault_size = $2, header = $3 WHERE id = $4")
            .bind(vault_path)
            .bind(vault_size)
            .bind(header_hex)
            .bind(file_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Appends an error record for the given file, tagged with this
    /// worker's hostname, the error class name, and whether the submitting
    /// user caused it.
    pub async fn set_error(&self, file_id: i64, failure: &WorkFailure) -> Result<(), DbError> {
        debug!(file_id, error_message = %failure, "Recording a processing error");

        sqlx::query("SELECT insert_error($1, $2, $3)")
            .bind(file_id)
            .bind(error_row_message(failure))
            .bind(failure.is_from_user())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// Composes the message column of an error record:
/// `[hostname][ClassName] human-readable reason`.
pub fn error_row_message(failure: &WorkFailure) -> String {
    format!("[{}][{}] {}", hostname(), failure.class(), failure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lega_core::UserError;

    #[test]
    fn error_row_message_carries_host_class_and_reason() {
        // Given
        let failure = WorkFailure::from(UserError::not_found_in_inbox("/a/b.c4gh"));

        // When
        let message = error_row_message(&failure);

        // Then
        assert!(message.contains("[NotFoundInInbox]"));
        assert!(message.ends_with("File not found in inbox: /a/b.c4gh"));
        assert!(message.starts_with('['));
    }

    #[test]
    fn transient_query_errors_are_retryable() {
        let io = DbError::Query(sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        )));
        let config = DbError::Config(SettingsError::MissingKey {
            section: "db".to_string(),
            key: "connection".to_string(),
        });

        assert!(io.is_retryable());
        assert!(!config.is_retryable());
    }
}
