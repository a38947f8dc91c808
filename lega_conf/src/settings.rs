use crate::sensitive::{Sensitive, SensitiveError, resolve_sensitive};
use config::{Config, ConfigError, File, FileFormat};
use std::path::Path;
use tracing::info;

/// The environment variable naming the main configuration file.
pub const CONF_ENV: &str = "LEGA_CONF";

/// The fallback location of the main configuration file.
pub const DEFAULT_CONF_PATH: &str = "/etc/ega/conf.ini";

/// A read-only, section-addressed view over the worker configuration.
///
/// Values are looked up as `section.key`; a key absent from its section
/// falls back to the `DEFAULT` section before the caller-supplied default
/// (if any) applies. Typed getters surface unparsable values as
/// [configuration errors](SettingsError), which are fatal at startup.
///
/// Interpolation is not supported: raw values (such as the inbox location
/// template with its `%s` placeholder) are returned untouched.
#[derive(Debug, Clone)]
pub struct Settings {
    config: Config,
    origin: String,
}

/// Represents a configuration failure. All of these are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// The configuration file could not be loaded or parsed.
    #[error("cannot load configuration from {origin}")]
    Load {
        /// The configuration file path.
        origin: String,
        /// The underlying parse error.
        #[source]
        source: ConfigError,
    },

    /// A required key is missing from both its section and `DEFAULT`.
    #[error("missing configuration key [{section}] {key}")]
    MissingKey {
        /// The requested section.
        section: String,
        /// The requested key.
        key: String,
    },

    /// A present key holds a value of the wrong type.
    #[error("invalid configuration value for [{section}] {key}")]
    InvalidValue {
        /// The requested section.
        section: String,
        /// The requested key.
        key: String,
        /// The underlying conversion error.
        #[source]
        source: ConfigError,
    },

    /// A sensitive value failed to resolve.
    #[error(transparent)]
    Sensitive(#[from] SensitiveError),
}

impl Settings {
    /// Loads the settings from the file named by `LEGA_CONF`, falling back
    /// to `/etc/ega/conf.ini`.
    pub fn load() -> Result<Self, SettingsError> {
        let path = std::env::var(CONF_ENV).unwrap_or_else(|_| DEFAULT_CONF_PATH.to_string());

        info!(path, "Loading configuration");

        Self::from_file(path)
    }

    /// Loads the settings from the INI file at the given path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let origin = path.as_ref().display().to_string();
        let config = Config::builder()
            .add_source(File::new(&origin, FileFormat::Ini))
            .build()
            .map_err(|source| SettingsError::Load {
                origin: origin.clone(),
                source,
            })?;

        Ok(Self { config, origin })
    }

    /// Builds the settings from an in-memory INI document. Intended for
    /// tests and tooling.
    pub fn from_ini_str(content: &str) -> Result<Self, SettingsError> {
        let config = Config::builder()
            .add_source(File::from_str(content, FileFormat::Ini))
            .build()
            .map_err(|source| SettingsError::Load {
                origin: "<inline>".to_string(),
                source,
            })?;

        Ok(Self {
            config,
            origin: "<inline>".to_string(),
        })
    }

    /// Reports where these settings were loaded from.
    pub fn origin(&self) -> &str {
        &self.origin
    }
}

impl Settings {
    /// Retrieves a required string value.
    pub fn get(&self, section: &str, key: &str) -> Result<String, SettingsError> {
        self.lookup(section, key, |config, path| config.get_string(path))?
            .ok_or_else(|| SettingsError::MissingKey {
                section: section.to_string(),
                key: key.to_string(),
            })
    }

    /// Retrieves an optional string value.
    pub fn get_opt(&self, section: &str, key: &str) -> Result<Option<String>, SettingsError> {
        self.lookup(section, key, |config, path| config.get_string(path))
    }

    /// Retrieves a string value, or the given default if the key is absent.
    pub fn get_or(&self, section: &str, key: &str, default: &str) -> Result<String, SettingsError> {
        Ok(self
            .get_opt(section, key)?
            .unwrap_or_else(|| default.to_string()))
    }

    /// Retrieves an integer value, or the given default if the key is absent.
    pub fn get_int_or(
        &self,
        section: &str,
        key: &str,
        default: i64,
    ) -> Result<i64, SettingsError> {
        Ok(self
            .lookup(section, key, |config, path| config.get_int(path))?
            .unwrap_or(default))
    }

    /// Retrieves a boolean value, or the given default if the key is absent.
    pub fn get_bool_or(
        &self,
        section: &str,
        key: &str,
        default: bool,
    ) -> Result<bool, SettingsError> {
        Ok(self
            .lookup(section, key, |config, path| config.get_bool(path))?
            .unwrap_or(default))
    }

    /// Retrieves a value and runs the
    /// [sensitive-value resolver](resolve_sensitive) on it.
    ///
    /// Note that resolving a `secret://` value removes the backing secret
    /// file: call this at most once per key.
    pub fn get_sensitive(
        &self,
        section: &str,
        key: &str,
    ) -> Result<Option<Sensitive>, SettingsError> {
        let raw = self.get_opt(section, key)?;

        Ok(resolve_sensitive(raw.as_deref())?)
    }

    /// Looks up `section.key`, falling back to `DEFAULT.key`. Reports
    /// `None` only when the key is missing from both places; any other
    /// retrieval failure is an [`InvalidValue`](SettingsError::InvalidValue).
    fn lookup<T>(
        &self,
        section: &str,
        key: &str,
        getter: impl Fn(&Config, &str) -> Result<T, ConfigError>,
    ) -> Result<Option<T>, SettingsError> {
        for candidate_section in [section, "DEFAULT"] {
            let path = format!("{}.{}", candidate_section.to_lowercase(), key);

            match getter(&self.config, &path) {
                Ok(value) => return Ok(Some(value)),
                Err(ConfigError::NotFound(_)) => continue,
                Err(source) => {
                    return Err(SettingsError::InvalidValue {
                        section: section.to_string(),
                        key: key.to_string(),
                        source,
                    });
                }
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
[DEFAULT]
queue = files
exchange = ingestion.v1
routing_key = archived

[broker]
connection = amqp://guest:guest@mq:5672/%2F
try = 5
try_interval = 2
verify_peer = true

[inbox]
location = /ega/inbox/%s
"#;

    fn settings() -> Settings {
        Settings::from_ini_str(SAMPLE).unwrap()
    }

    #[test]
    fn reads_section_values() {
        let settings = settings();

        assert_eq!(
            settings.get("broker", "connection").unwrap(),
            "amqp://guest:guest@mq:5672/%2F"
        );
        assert_eq!(
            settings.get("inbox", "location").unwrap(),
            "/ega/inbox/%s"
        );
    }

    #[test]
    fn falls_back_to_default_section() {
        let settings = settings();

        // `queue` is not under [broker]; the DEFAULT section supplies it
        assert_eq!(settings.get("broker", "queue").unwrap(), "files");
        assert_eq!(settings.get("DEFAULT", "exchange").unwrap(), "ingestion.v1");
    }

    #[test]
    fn missing_key_is_an_error() {
        let settings = settings();

        let result = settings.get("broker", "no_such_key");

        assert!(matches!(result, Err(SettingsError::MissingKey { .. })));
    }

    #[test]
    fn typed_getters_with_defaults() {
        let settings = settings();

        assert_eq!(settings.get_int_or("broker", "try", 30).unwrap(), 5);
        assert_eq!(settings.get_int_or("broker", "absent", 30).unwrap(), 30);
        assert!(settings.get_bool_or("broker", "verify_peer", false).unwrap());
        assert!(
            !settings
                .get_bool_or("broker", "verify_hostname", false)
                .unwrap()
        );
    }

    #[test]
    fn sensitive_getter_runs_the_resolver() {
        let settings = Settings::from_ini_str(
            "[broker]\nconnection = value://amqps://u:p@mq/vhost\n",
        )
        .unwrap();

        let resolved = settings.get_sensitive("broker", "connection").unwrap();

        assert_eq!(
            resolved.unwrap().into_text().unwrap(),
            "amqps://u:p@mq/vhost"
        );
    }

    #[test]
    fn sensitive_getter_tolerates_absent_keys() {
        let settings = settings();

        assert!(settings.get_sensitive("db", "connection").unwrap().is_none());
    }
}
