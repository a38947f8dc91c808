use crate::broker::BrokerError;
use crate::settings::TlsSettings;
use lapin::tcp::{OwnedIdentity, OwnedTLSConfig};
use std::fs;
use tracing::debug;

/// Assembles the TLS configuration handed to the connection attempt from
/// the given [`TlsSettings`], loading the referenced material from disk.
///
/// With `verify_peer` and a pinned `cacertfile`, the PEM bundle becomes
/// the trust-anchor override; otherwise the TLS backend's default trust
/// evaluation applies. A configured `certfile` loads the PKCS#12 client
/// identity, with its passphrase taken from `keyfile` (empty when no
/// `keyfile` is set).
pub(crate) fn assemble(tls: &TlsSettings) -> Result<OwnedTLSConfig, BrokerError> {
    let mut config = OwnedTLSConfig::default();

    if tls.verify_peer {
        debug!("Requiring broker certificate verification");

        if let Some(cacertfile) = &tls.cacertfile {
            let cert_chain = read_text(cacertfile)?;
            config.cert_chain = Some(cert_chain);
        }
    }

    if tls.verify_hostname {
        // Validated at settings construction; restated for the logs
        debug!(
            server_hostname = tls.server_hostname.as_deref(),
            "Requiring broker hostname verification",
        );
    }

    if let Some(certfile) = &tls.certfile {
        debug!(certfile, "Preparing for client certificate verification");

        let der = read_bytes(certfile)?;
        let password = match &tls.keyfile {
            Some(keyfile) => read_text(keyfile)?.trim_end().to_string(),
            None => String::new(),
        };

        config.identity = Some(OwnedIdentity { der, password });
    }

    Ok(config)
}

fn read_text(path: &str) -> Result<String, BrokerError> {
    fs::read_to_string(path).map_err(|source| BrokerError::TlsMaterial {
        path: path.to_string(),
        source,
    })
}

fn read_bytes(path: &str) -> Result<Vec<u8>, BrokerError> {
    fs::read(path).map_err(|source| BrokerError::TlsMaterial {
        path: path.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base_tls() -> TlsSettings {
        TlsSettings {
            verify_peer: false,
            verify_hostname: false,
            cacertfile: None,
            certfile: None,
            keyfile: None,
            server_hostname: None,
        }
    }

    #[test]
    fn default_settings_produce_an_empty_config() {
        let config = assemble(&base_tls()).unwrap();

        assert!(config.cert_chain.is_none());
        assert!(config.identity.is_none());
    }

    #[test]
    fn pinned_trust_anchors_are_loaded_when_verifying() {
        // Given
        let mut ca = tempfile::NamedTempFile::new().unwrap();
        write!(ca, "-----BEGIN CERTIFICATE-----").unwrap();
        let tls = TlsSettings {
            verify_peer: true,
            cacertfile: Some(ca.path().display().to_string()),
            ..base_tls()
        };

        // When
        let config = assemble(&tls).unwrap();

        // Then
        assert_eq!(
            config.cert_chain.as_deref(),
            Some("-----BEGIN CERTIFICATE-----")
        );
    }

    #[test]
    fn trust_anchors_are_ignored_without_verify_peer() {
        let tls = TlsSettings {
            cacertfile: Some("/etc/ega/CA.cert".to_string()),
            ..base_tls()
        };

        let config = assemble(&tls).unwrap();

        assert!(config.cert_chain.is_none());
    }

    #[test]
    fn missing_material_is_an_error() {
        let tls = TlsSettings {
            verify_peer: true,
            cacertfile: Some("/no/such/ca.pem".to_string()),
            ..base_tls()
        };

        let result = assemble(&tls);

        assert!(matches!(result, Err(BrokerError::TlsMaterial { .. })));
    }
}
