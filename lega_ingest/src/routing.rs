use lega_conf::{Settings, SettingsError};

/// The exchange carrying progress announcements to Central EGA.
pub const PROGRESS_EXCHANGE: &str = "cega";

/// The routing key of progress announcements.
pub const PROGRESS_ROUTING_KEY: &str = "files.processing";

/// The message routes this worker consumes from and publishes to, read
/// from the `DEFAULT` section of the configuration.
///
/// The success and error routes share one exchange. The user-error key
/// comes from the `error` key, with `user_error` honored as its legacy
/// alias; the system-error key has its own `system_error` knob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing {
    /// The queue this worker consumes.
    pub queue: String,
    /// The exchange for success and error publishes.
    pub exchange: String,
    /// The routing key of successful outcomes.
    pub routing_key: String,
    /// The routing key informing users of their errors.
    pub user_error_key: String,
    /// The routing key informing operators of system errors.
    pub system_error_key: String,
}

impl Routing {
    /// Reads the routing configuration. `queue` and `routing_key` are
    /// required; the remaining routes have conventional defaults.
    pub fn from_settings(settings: &Settings) -> Result<Self, SettingsError> {
        let queue = settings.get("DEFAULT", "queue")?;
        let exchange = settings.get_or("DEFAULT", "exchange", "ingestion.v1")?;
        let routing_key = settings.get("DEFAULT", "routing_key")?;

        let user_error_key = match settings.get_opt("DEFAULT", "error")? {
            Some(key) => key,
            // Legacy alias
            None => settings.get_or("DEFAULT", "user_error", "error")?,
        };
        let system_error_key = settings.get_or("DEFAULT", "system_error", "error.system")?;

        Ok(Self {
            queue,
            exchange,
            routing_key,
            user_error_key,
            system_error_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reads_routes_with_defaults() {
        let settings = lega_conf::Settings::from_ini_str(
            "[DEFAULT]\nqueue = files\nrouting_key = archived\n",
        )
        .unwrap();

        let routing = Routing::from_settings(&settings).unwrap();

        assert_eq!(
            routing,
            Routing {
                queue: "files".to_string(),
                exchange: "ingestion.v1".to_string(),
                routing_key: "archived".to_string(),
                user_error_key: "error".to_string(),
                system_error_key: "error.system".to_string(),
            }
        );
    }

    #[test]
    fn honors_the_legacy_user_error_alias() {
        let settings = lega_conf::Settings::from_ini_str(
            "[DEFAULT]\nqueue = files\nrouting_key = archived\nuser_error = user.errors\n",
        )
        .unwrap();

        let routing = Routing::from_settings(&settings).unwrap();

        assert_eq!(routing.user_error_key, "user.errors");
    }

    #[test]
    fn the_error_key_wins_over_the_alias() {
        let settings = lega_conf::Settings::from_ini_str(
            "[DEFAULT]\nqueue = files\nrouting_key = archived\nerror = error\nuser_error = ignored\n",
        )
        .unwrap();

        let routing = Routing::from_settings(&settings).unwrap();

        assert_eq!(routing.user_error_key, "error");
    }

    #[test]
    fn missing_queue_is_fatal() {
        let settings =
            lega_conf::Settings::from_ini_str("[DEFAULT]\nrouting_key = archived\n").unwrap();

        assert!(Routing::from_settings(&settings).is_err());
    }
}
