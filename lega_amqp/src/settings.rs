use crate::broker::BrokerError;
use lega_conf::{Settings, SettingsError};
use lega_util::redact_uri;
use secure_string::SecureString;
use std::fmt::{self, Debug, Formatter};
use std::time::Duration;

/// Connection settings for the message broker, read from the `broker`
/// section of the configuration.
///
/// The connection URI is obtained through the sensitive-value resolver,
/// so it may come from a one-shot secret file. An `amqps://` scheme pulls
/// in the [TLS settings](TlsSettings) from the same section.
#[derive(Clone)]
pub struct BrokerSettings {
    dsn: SecureString,
    identifier: String,
    attempts: u32,
    interval: Duration,
    tls: Option<TlsSettings>,
}

/// TLS knobs for an `amqps://` connection.
///
/// `verify_peer` requires a peer certificate and, when `cacertfile` is
/// set, pins the trust anchors to it. `verify_hostname` additionally
/// requires `server_hostname` to be set; omitting it is a configuration
/// error. `certfile`/`keyfile` supply the client identity for mutual TLS:
/// the PKCS#12 bundle and the file holding its passphrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    /// Whether to require and verify the peer certificate.
    pub verify_peer: bool,
    /// Whether to verify the peer hostname against `server_hostname`.
    pub verify_hostname: bool,
    /// The PEM bundle of trust anchors, if pinned.
    pub cacertfile: Option<String>,
    /// The PKCS#12 client identity bundle, if client auth is required.
    pub certfile: Option<String>,
    /// The file holding the passphrase of `certfile`.
    pub keyfile: Option<String>,
    /// The hostname the peer certificate must present.
    pub server_hostname: Option<String>,
}

impl BrokerSettings {
    /// Reads the broker settings from the given configuration section
    /// (normally `broker`).
    ///
    /// Note that this resolves the sensitive `connection` value, which may
    /// consume a one-shot secret file: read the settings once and keep
    /// them.
    pub fn from_settings(settings: &Settings, section: &str) -> Result<Self, BrokerError> {
        let dsn = settings
            .get_sensitive(section, "connection")?
            .ok_or_else(|| SettingsError::MissingKey {
                section: section.to_string(),
                key: "connection".to_string(),
            })?
            .into_text()
            .map_err(SettingsError::from)?;

        let attempts = settings.get_int_or(section, "try", 30)? as u32;
        let interval = settings.get_int_or(section, "try_interval", 1)? as u64;

        // The URI scheme decides whether a TLS context is enforced
        let tls = if dsn.starts_with("amqps") {
            Some(TlsSettings::from_settings(settings, section)?)
        } else {
            None
        };

        let identifier = redact_uri(&dsn);

        Ok(Self {
            dsn: SecureString::from(dsn),
            identifier,
            attempts,
            interval: Duration::from_secs(interval),
            tls,
        })
    }

    /// Exposes the sensitive connection URI.
    pub fn dsn(&self) -> &SecureString {
        &self.dsn
    }

    /// Reports the connection URI with credentials obscured, safe for
    /// logging.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Reports the number of connection attempts before giving up.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Reports the interval between connection attempts.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Exposes the TLS settings, present only for `amqps://` URIs.
    pub fn tls(&self) -> Option<&TlsSettings> {
        self.tls.as_ref()
    }
}

impl TlsSettings {
    /// Reads the TLS knobs from the given configuration section.
    fn from_settings(settings: &Settings, section: &str) -> Result<Self, BrokerError> {
        let verify_peer = settings.get_bool_or(section, "verify_peer", false)?;
        let verify_hostname = settings.get_bool_or(section, "verify_hostname", false)?;
        let cacertfile = settings.get_opt(section, "cacertfile")?;
        let certfile = settings.get_opt(section, "certfile")?;
        let keyfile = settings.get_opt(section, "keyfile")?;
        let server_hostname = settings.get_opt(section, "server_hostname")?;

        // Hostname verification is meaningless without a reference hostname
        if verify_hostname && server_hostname.is_none() {
            return Err(BrokerError::MissingServerHostname);
        }

        Ok(Self {
            verify_peer,
            verify_hostname,
            cacertfile,
            certfile,
            keyfile,
            server_hostname,
        })
    }
}

/// Omits the DSN from the debug representation; the identifier carries
/// the same information with credentials obscured.
impl Debug for BrokerSettings {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSettings")
            .field("identifier", &self.identifier)
            .field("attempts", &self.attempts)
            .field("interval", &self.interval)
            .field("tls", &self.tls)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lega_conf::Settings;
    use pretty_assertions::assert_eq;

    #[test]
    fn plain_uri_skips_tls() {
        let settings = Settings::from_ini_str(
            "[broker]\nconnection = amqp://guest:guest@mq:5672/%2F\ntry = 3\n",
        )
        .unwrap();

        let broker = BrokerSettings::from_settings(&settings, "broker").unwrap();

        assert!(broker.tls().is_none());
        assert_eq!(broker.attempts(), 3);
        assert_eq!(broker.interval(), Duration::from_secs(1));
        assert_eq!(broker.identifier(), "amqp://guest:***@mq:5672/%2F");
    }

    #[test]
    fn amqps_uri_enforces_tls_settings() {
        let settings = Settings::from_ini_str(
            "[broker]\n\
             connection = amqps://u:p@mq:5671/vhost\n\
             verify_peer = true\n\
             cacertfile = /etc/ega/CA.cert\n",
        )
        .unwrap();

        let broker = BrokerSettings::from_settings(&settings, "broker").unwrap();
        let tls = broker.tls().unwrap();

        assert!(tls.verify_peer);
        assert!(!tls.verify_hostname);
        assert_eq!(tls.cacertfile.as_deref(), Some("/etc/ega/CA.cert"));
    }

    #[test]
    fn verify_hostname_requires_server_hostname() {
        let settings = Settings::from_ini_str(
            "[broker]\n\
             connection = amqps://u:p@mq:5671/vhost\n\
             verify_hostname = true\n",
        )
        .unwrap();

        let result = BrokerSettings::from_settings(&settings, "broker");

        assert!(matches!(result, Err(BrokerError::MissingServerHostname)));
    }

    #[test]
    fn sensitive_uri_resolves_through_value_scheme() {
        let settings = Settings::from_ini_str(
            "[broker]\nconnection = value://amqp://u:p@mq/vhost\n",
        )
        .unwrap();

        let broker = BrokerSettings::from_settings(&settings, "broker").unwrap();

        assert_eq!(broker.dsn().unsecure(), "amqp://u:p@mq/vhost");
    }
}
