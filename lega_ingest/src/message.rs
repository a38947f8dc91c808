//! Message-shaping helpers for the dispatcher and the pipeline.

use lega_core::WorkFailure;
use serde_json::{Value, json};

/// The internal-only fields that must never leave the local broker.
const INTERNAL_FIELDS: [&str; 4] = ["file_id", "org_msg", "header", "vault_path"];

/// Reduces a submitted user identity to the bare user id: strips a
/// leading `scheme:` prefix and truncates at the first `@`.
///
/// `elixir:alice@example.org` becomes `alice`; input with neither marker
/// passes through unchanged.
pub fn sanitize_user_id(user: &str) -> &str {
    let after_scheme = match user.split_once(':') {
        Some((_, rest)) => rest,
        None => user,
    };

    match after_scheme.split_once('@') {
        Some((bare, _)) => bare,
        None => after_scheme,
    }
}

/// Removes the internal-only fields from a message before it is
/// published to an external exchange.
pub fn clean_message(content: &mut Value) {
    if let Value::Object(map) = content {
        for field in INTERNAL_FIELDS {
            map.remove(field);
        }
    }
}

/// Reports whether parsed content is empty in the "nothing to do" sense:
/// absent, null, an empty string/array/object, `false`, or zero.
pub fn is_empty_content(content: &Value) -> bool {
    match content {
        Value::Null => true,
        Value::Bool(flag) => !flag,
        Value::Number(number) => number.as_f64() == Some(0.0),
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

/// Composes the envelope published on the system-error key when an
/// inbound body fails to parse as JSON.
pub fn malformed_envelope(formal: &str, body: &[u8]) -> Value {
    json!({
        "informal": "Malformed JSON-message",
        "formal": formal,
        "message": String::from_utf8_lossy(body),
    })
}

/// Composes the message published on the user-error key: the original
/// content, scrubbed of internal fields, with the user-facing `reason`
/// attached.
pub fn user_error_message(original: &Value, failure: &WorkFailure) -> Value {
    let reason = failure.informal();

    match original {
        Value::Object(map) => {
            let mut content = Value::Object(map.clone());
            clean_message(&mut content);
            if let Value::Object(map) = &mut content {
                map.insert("reason".to_string(), Value::String(reason));
            }

            content
        }
        other => json!({ "reason": reason, "message": other }),
    }
}

/// Attaches the `error` descriptor (informal and formal renderings) to
/// the given content, for publishing on the system-error key. Non-object
/// content is wrapped rather than mutated.
pub fn attach_error(content: Value, failure: &WorkFailure) -> Value {
    let descriptor = json!({
        "informal": failure.informal(),
        "formal": failure.formal(),
    });

    match content {
        Value::Object(mut map) => {
            map.insert("error".to_string(), descriptor);

            Value::Object(map)
        }
        other => json!({ "error": descriptor, "message": other }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lega_core::UserError;
    use pretty_assertions::assert_eq;

    #[test]
    fn sanitizes_user_identities() {
        assert_eq!(sanitize_user_id("elixir:alice@example.org"), "alice");
        assert_eq!(sanitize_user_id("elixir:alice"), "alice");
        assert_eq!(sanitize_user_id("alice@example.org"), "alice");
        assert_eq!(sanitize_user_id("bob"), "bob");
    }

    #[test]
    fn scrubs_internal_fields() {
        // Given
        let mut content = json!({
            "filepath": "/a/b.c4gh",
            "user": "alice",
            "file_id": 7,
            "org_msg": {"filepath": "/a/b.c4gh"},
            "header": "6372",
            "vault_path": "/vault/000/000/000/007",
        });

        // When
        clean_message(&mut content);

        // Then
        assert_eq!(content, json!({"filepath": "/a/b.c4gh", "user": "alice"}));
    }

    #[test]
    fn recognizes_empty_content() {
        assert!(is_empty_content(&Value::Null));
        assert!(is_empty_content(&json!("")));
        assert!(is_empty_content(&json!({})));
        assert!(is_empty_content(&json!([])));
        assert!(!is_empty_content(&json!({"filepath": "/a"})));
        assert!(!is_empty_content(&json!("text")));
    }

    #[test]
    fn user_error_message_scrubs_and_attaches_reason() {
        // Given
        let original = json!({
            "filepath": "/a/b.c4gh",
            "user": "alice",
            "file_id": 7,
        });
        let failure = WorkFailure::from(UserError::not_found_in_inbox("/a/b.c4gh"));

        // When
        let message = user_error_message(&original, &failure);

        // Then
        assert_eq!(
            message,
            json!({
                "filepath": "/a/b.c4gh",
                "user": "alice",
                "reason": "File not found in inbox: /a/b.c4gh",
            })
        );
    }

    #[test]
    fn attach_error_carries_both_renderings() {
        // Given
        let failure = WorkFailure::from(UserError::not_found_in_inbox("/a/b.c4gh"));

        // When
        let message = attach_error(json!({"filepath": "/a/b.c4gh"}), &failure);

        // Then
        assert_eq!(
            message["error"]["informal"],
            json!("File not found in inbox: /a/b.c4gh")
        );
        assert!(
            message["error"]["formal"]
                .as_str()
                .unwrap()
                .contains("NotFoundInInbox")
        );
    }

    #[test]
    fn attach_error_wraps_non_objects() {
        let failure = WorkFailure::Reject;

        let message = attach_error(json!("raw body"), &failure);

        assert_eq!(message["message"], json!("raw body"));
        assert!(message["error"].is_object());
    }

    #[test]
    fn malformed_envelope_shape() {
        let envelope = malformed_envelope("syntax error at byte 1", b"{not json");

        assert_eq!(envelope["informal"], json!("Malformed JSON-message"));
        assert_eq!(envelope["message"], json!("{not json"));
        assert_eq!(envelope["formal"], json!("syntax error at byte 1"));
    }
}
