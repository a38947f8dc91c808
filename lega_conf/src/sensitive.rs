use std::fmt::{self, Debug, Formatter};
use std::fs;
use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;
use tracing::{debug, warn};

/// A resolved sensitive value.
///
/// Most sources yield text; the `secret://` source reads its file in
/// binary mode, so the raw bytes are preserved until the caller decides
/// how to interpret them.
pub enum Sensitive {
    /// A textual value.
    Text(String),
    /// A binary value, as read from a one-shot secret file.
    Bytes(Vec<u8>),
}

impl Sensitive {
    /// Converts this value into text, decoding binary content as UTF-8.
    pub fn into_text(self) -> Result<String, SensitiveError> {
        match self {
            Self::Text(text) => Ok(text),
            Self::Bytes(bytes) => {
                let text = String::from_utf8(bytes)?;

                // Secret files commonly carry a trailing newline
                Ok(text.trim_end_matches(['\r', '\n']).to_string())
            }
        }
    }

    /// Exposes the raw bytes of this value.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Bytes(bytes) => bytes,
        }
    }
}

/// Keeps sensitive content out of debug output.
impl Debug for Sensitive {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(_) => f.write_str("Sensitive::Text(***)"),
            Self::Bytes(_) => f.write_str("Sensitive::Bytes(***)"),
        }
    }
}

/// Represents a failure to resolve a sensitive value.
#[derive(Debug, Error)]
pub enum SensitiveError {
    /// The named environment variable is not set.
    #[error("environment variable {name} not found")]
    MissingEnv {
        /// The name of the missing variable.
        name: String,
    },

    /// The referenced file could not be read.
    #[error("error loading {path}")]
    Load {
        /// The path of the unreadable file.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A binary value could not be decoded as UTF-8 text.
    #[error("sensitive value is not valid UTF-8")]
    NotText(#[from] FromUtf8Error),
}

/// The recognized sensitive-value source schemes, in dispatch priority
/// order. Input matching no scheme is taken verbatim.
enum Scheme {
    /// `value://X`: the literal `X`, even if `X` itself starts with another
    /// scheme prefix.
    Value,
    /// `env://NAME`: the content of environment variable `NAME`.
    Env,
    /// `file://PATH`: the text content of the file at `PATH`.
    File,
    /// `secret://PATH`: the binary content of the file at `PATH`; the file
    /// is removed after reading.
    Secret,
}

impl Scheme {
    /// Splits the given input into a recognized scheme and its remainder.
    fn split(input: &str) -> Option<(Scheme, &str)> {
        if let Some(rest) = input.strip_prefix("value://") {
            Some((Scheme::Value, rest))
        } else if let Some(rest) = input.strip_prefix("env://") {
            Some((Scheme::Env, rest))
        } else if let Some(rest) = input.strip_prefix("file://") {
            Some((Scheme::File, rest))
        } else if let Some(rest) = input.strip_prefix("secret://") {
            Some((Scheme::Secret, rest))
        } else {
            None
        }
    }
}

/// Resolves a raw configuration value into its sensitive content.
///
/// The value may name its source with one of the `value://`, `env://`,
/// `file://`, or `secret://` schemes; anything else (including strings
/// that merely look like URIs, such as `amqps://…`) is returned verbatim.
/// Absent input resolves to absent output.
///
/// The `secret://` source is destructive: the referenced file is removed
/// after it has been read. A failed removal is logged and tolerated; a
/// failed read is not.
pub fn resolve_sensitive(value: Option<&str>) -> Result<Option<Sensitive>, SensitiveError> {
    let value = match value {
        Some(value) => value,
        None => return Ok(None),
    };

    let resolved = match Scheme::split(value) {
        // Enforced literal
        Some((Scheme::Value, literal)) => Sensitive::Text(literal.to_string()),

        Some((Scheme::Env, name)) => {
            debug!(name, "Loading sensitive value from environment variable");
            warn!(
                name,
                "Loading sensitive data from an environment variable is deprecated; \
                 use secret:// instead",
            );

            match std::env::var(name) {
                Ok(content) => Sensitive::Text(content),
                Err(_) => {
                    return Err(SensitiveError::MissingEnv {
                        name: name.to_string(),
                    });
                }
            }
        }

        Some((Scheme::File, path)) => {
            debug!(path, "Loading sensitive value from file");
            warn_if_widely_readable(path);

            let content = fs::read_to_string(path).map_err(|source| SensitiveError::Load {
                path: path.to_string(),
                source,
            })?;

            Sensitive::Text(content)
        }

        Some((Scheme::Secret, path)) => {
            debug!(path, "Loading one-shot secret from file");

            // Read first, then remove the file whether or not reading worked
            let content = fs::read(path);
            if let Err(error) = fs::remove_file(path) {
                warn!(path, error_message = %error, "Could not remove secret file");
            }

            let bytes = content.map_err(|source| SensitiveError::Load {
                path: path.to_string(),
                source,
            })?;

            Sensitive::Bytes(bytes)
        }

        // No scheme: the value itself
        None => Sensitive::Text(value.to_string()),
    };

    Ok(Some(resolved))
}

/// Emits a deprecation warning if the file at the given path is readable
/// by group or world.
#[cfg(unix)]
fn warn_if_widely_readable(path: &str) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(metadata) = fs::metadata(path) {
        let mode = metadata.permissions().mode();
        if mode & 0o044 != 0 {
            warn!(
                path,
                "Loading sensitive data from a group- or world-readable file is deprecated; \
                 use secret:// instead",
            );
        }
    }
}

#[cfg(not(unix))]
fn warn_if_widely_readable(_path: &str) {}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn text(value: &str) -> String {
        resolve_sensitive(Some(value))
            .unwrap()
            .unwrap()
            .into_text()
            .unwrap()
    }

    #[test]
    fn absent_input_is_absent_output() {
        assert!(resolve_sensitive(None).unwrap().is_none());
    }

    #[test]
    fn plain_value_passes_through() {
        assert_eq!(text("s3cr3t"), "s3cr3t");
    }

    #[test]
    fn uri_like_value_passes_through() {
        assert_eq!(
            text("amqps://user:pass@mq/vhost"),
            "amqps://user:pass@mq/vhost"
        );
        assert_eq!(text("postgres://db/lega"), "postgres://db/lega");
    }

    #[test]
    fn value_scheme_is_an_escape_hatch() {
        assert_eq!(text("value://env://not-a-var"), "env://not-a-var");
        assert_eq!(text("value://"), "");
    }

    #[test]
    fn env_scheme_reads_environment() {
        // Given
        unsafe { std::env::set_var("LEGA_CONF_TEST_SENSITIVE", "from-env") };

        // Then
        assert_eq!(text("env://LEGA_CONF_TEST_SENSITIVE"), "from-env");
    }

    #[test]
    fn env_scheme_fails_on_unset_variable() {
        let result = resolve_sensitive(Some("env://LEGA_CONF_TEST_UNSET"));

        assert!(matches!(result, Err(SensitiveError::MissingEnv { .. })));
    }

    #[test]
    fn file_scheme_reads_text() {
        // Given
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "file-content").unwrap();
        let value = format!("file://{}", file.path().display());

        // Then
        assert_eq!(text(&value), "file-content");
    }

    #[test]
    fn file_scheme_fails_on_missing_file() {
        let result = resolve_sensitive(Some("file:///no/such/file"));

        assert!(matches!(result, Err(SensitiveError::Load { .. })));
    }

    #[test]
    fn secret_scheme_reads_bytes_and_removes_file() {
        // Given
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mq.connection");
        fs::write(&path, b"amqps://u:p@h/v\n").unwrap();
        let value = format!("secret://{}", path.display());

        // When
        let resolved = resolve_sensitive(Some(&value)).unwrap().unwrap();

        // Then
        assert_eq!(resolved.into_text().unwrap(), "amqps://u:p@h/v");
        assert!(!path.exists());
    }

    #[test]
    fn secret_scheme_fails_on_missing_file() {
        let result = resolve_sensitive(Some("secret:///no/such/file"));

        assert!(matches!(result, Err(SensitiveError::Load { .. })));
    }
}
