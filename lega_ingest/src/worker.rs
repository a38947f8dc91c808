use crate::header::{self, HeaderError};
use crate::message::sanitize_user_id;
use crate::routing::{PROGRESS_EXCHANGE, PROGRESS_ROUTING_KEY};
use lega_amqp::Broker;
use lega_core::{SystemError, UserError, WorkFailure};
use lega_db::Db;
use lega_vault::Vault;
use serde_json::{Map, Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};

/// The per-delivery ingestion pipeline.
///
/// For each announced upload: create the file record, locate the upload
/// in the user inbox, mark the record in progress, announce progress
/// upstream, split the Crypt4GH header off the container, stream the
/// payload to the vault, persist the vault location and the header, and
/// return the enriched reply for the dispatcher to publish.
///
/// The record insert comes before any other side effect, so every later
/// failure can be attributed to the record; that attribution (an
/// `errors` row) happens here before the failure propagates to the
/// dispatcher.
pub struct IngestWorker {
    db: Db,
    vault: Box<dyn Vault>,
    broker: Arc<Broker>,
    inbox_template: String,
}

impl IngestWorker {
    /// Creates a new worker over the given collaborators. The
    /// `inbox_template` is the `inbox.location` value: a path template
    /// with a `%s` placeholder for the user id.
    pub fn new(db: Db, vault: Box<dyn Vault>, broker: Arc<Broker>, inbox_template: String) -> Self {
        Self {
            db,
            vault,
            broker,
            inbox_template,
        }
    }

    /// Processes one parsed ingestion request.
    ///
    /// On failure, the error is recorded against the file record (when
    /// one was already created) and then re-raised for the dispatcher to
    /// route. A cooperative [`Reject`](WorkFailure::Reject) is never
    /// recorded.
    pub async fn process(&self, content: Value, correlation_id: String) -> Result<Value, WorkFailure> {
        let mut file_id_slot = None;
        let result = self
            .ingest(content, &correlation_id, &mut file_id_slot)
            .await;

        // Attribute the failure before re-raising it
        if let Err(failure) = &result {
            let attributable = !matches!(failure, WorkFailure::Reject);
            if let Some(file_id) = file_id_slot.filter(|_| attributable) {
                if let Err(db_error) = self.db.set_error(file_id, failure).await {
                    error!(
                        file_id,
                        error_message = %db_error,
                        "Failed to record the processing error",
                    );
                }
            }
        }

        result
    }

    /// The pipeline proper. Stashes the file id into the given slot as
    /// soon as it exists, so the caller can attribute failures.
    async fn ingest(
        &self,
        content: Value,
        correlation_id: &str,
        file_id_slot: &mut Option<i64>,
    ) -> Result<Value, WorkFailure> {
        let mut data = match content {
            Value::Object(map) => map,
            _ => {
                return Err(SystemError::message(
                    "BadMessage",
                    "message content is not a JSON object",
                )
                .into());
            }
        };

        let filepath = require_str(&data, "filepath")?;
        info!(filepath = filepath.as_str(), "Processing file");

        // The bare user id, not the federated identity
        let user = require_str(&data, "user")?;
        let user_id = sanitize_user_id(&user).to_string();

        // Insert in database
        let file_id = self.db.insert_file(&filepath, &user_id).await?;
        *file_id_slot = Some(file_id);

        // The echo-back template, captured before any enrichment
        let org_msg = Value::Object(data.clone());
        data.insert("file_id".to_string(), json!(file_id));

        // Check if the file is in the inbox
        let inbox_filepath = inbox_path(&self.inbox_template, &user_id, &filepath);
        info!(inbox_filepath = %inbox_filepath.display(), "Inbox file path");
        if !tokio::fs::try_exists(&inbox_filepath).await.unwrap_or(false) {
            return Err(UserError::not_found_in_inbox(&filepath).into());
        }

        // Record in database
        self.db.mark_in_progress(file_id).await?;

        // Sending a progress message to Central EGA
        let progress = progress_message(&org_msg);
        self.broker
            .publish(&progress, PROGRESS_EXCHANGE, PROGRESS_ROUTING_KEY, correlation_id)
            .await
            .map_err(|error| SystemError::wrap("PublishError", &error))?;

        // Strip the header out and stream the rest of the file to the vault
        debug!(file_id, inbox_filepath = %inbox_filepath.display(), "Reading the container header");
        let mut infile = tokio::fs::File::open(&inbox_filepath)
            .await
            .map_err(|error| SystemError::wrap("InboxReadError", &error))?;
        let split_header = header::split(&mut infile).await.map_err(map_header_error)?;

        let target = self.vault.location(file_id);
        info!(
            filepath = filepath.as_str(),
            target = target.as_str(),
            "Moving the rest of the file to the vault",
        );
        let target_size = self.vault.copy(&mut infile, &target).await?;

        info!(file_id, "Vault copying completed; updating database");
        let header_hex = split_header.to_hex();
        self.db
            .set_info(file_id, &target, target_size as i64, &header_hex)
            .await?;

        // The outbound echo
        data.insert("header".to_string(), json!(header_hex));
        data.insert("vault_path".to_string(), json!(target));
        data.insert("org_msg".to_string(), org_msg);

        Ok(Value::Object(data))
    }
}

/// Extracts a required string field from the request.
fn require_str(data: &Map<String, Value>, field: &str) -> Result<String, WorkFailure> {
    data.get(field)
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| {
            SystemError::message(
                "BadMessage",
                format!("required field '{}' is missing or not a string", field),
            )
            .into()
        })
}

/// Expands the inbox location template with the user id and appends the
/// announced filepath, stripped of its leading slash.
fn inbox_path(template: &str, user_id: &str, filepath: &str) -> PathBuf {
    let inbox_root = template.replacen("%s", user_id, 1);

    PathBuf::from(inbox_root).join(filepath.trim_start_matches('/'))
}

/// Copies the echo-back template and flags it as in progress. Outbound
/// only; the template itself stays untouched.
fn progress_message(org_msg: &Value) -> Value {
    let mut progress = org_msg.clone();
    if let Value::Object(map) = &mut progress {
        map.insert("status".to_string(), json!("PROCESSING"));
    }

    progress
}

/// Remaps rejected containers to the submitting user, preserving the
/// cause; an unreadable stream stays a system error.
fn map_header_error(error: HeaderError) -> WorkFailure {
    match error {
        HeaderError::Io(source) => SystemError::wrap("HeaderReadError", &source).into(),
        rejected => {
            let reason = rejected.to_string();

            UserError::with_source("Crypt4ghHeaderError", reason, rejected).into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn inbox_path_expands_template_and_strips_leading_slash() {
        let path = inbox_path("/ega/inbox/%s", "alice", "/a/b.c4gh");

        assert_eq!(path, PathBuf::from("/ega/inbox/alice/a/b.c4gh"));
    }

    #[test]
    fn inbox_path_tolerates_relative_filepaths() {
        let path = inbox_path("/ega/inbox/%s", "bob", "dir/file.c4gh");

        assert_eq!(path, PathBuf::from("/ega/inbox/bob/dir/file.c4gh"));
    }

    #[test]
    fn progress_message_flags_a_copy_only() {
        // Given
        let org_msg = json!({"filepath": "/a/b.c4gh", "user": "alice"});

        // When
        let progress = progress_message(&org_msg);

        // Then
        assert_eq!(progress["status"], json!("PROCESSING"));
        assert_eq!(org_msg.get("status"), None);
    }

    #[test]
    fn require_str_surfaces_missing_fields_as_system_errors() {
        let data = json!({"filepath": "/a/b.c4gh"});
        let Value::Object(map) = data else {
            unreachable!()
        };

        let failure = require_str(&map, "user").unwrap_err();

        assert!(!failure.is_from_user());
        assert!(failure.informal().contains("user"));
    }

    #[test]
    fn rejected_containers_belong_to_the_user() {
        let failure = map_header_error(HeaderError::BadMagic);

        assert!(failure.is_from_user());
        assert!(failure.formal().contains("Crypt4ghHeaderError"));
    }

    #[test]
    fn unreadable_streams_stay_system_errors() {
        let failure = map_header_error(HeaderError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        )));

        assert!(!failure.is_from_user());
    }
}
