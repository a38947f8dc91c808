use crate::settings::BrokerSettings;
use crate::{Delivery, tls};
use futures::StreamExt;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, BasicQosOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use lega_conf::SettingsError;
use lega_core::{AppContext, hostname};
use lega_util::{Retry, Retryable};
use serde_json::Value;
use std::future::Future;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

/// Manages the single connection to the message broker.
///
/// The connection is established lazily, under a bounded fixed-interval
/// retry; exhausting the attempts terminates the process with exit
/// code 1. Two channels are opened on demand and cached: one reused for
/// every [`publish`](Broker::publish), one dedicated to the
/// [`consume`](Broker::consume) loop. Whenever a transport failure is
/// detected, the whole connection is discarded and re-established.
pub struct Broker {
    settings: BrokerSettings,
    state: AsyncMutex<Option<Live>>,
}

/// The currently established connection with its cached channels.
struct Live {
    connection: Connection,
    publish_channel: Option<Channel>,
    consume_channel: Option<Channel>,
}

/// Represents a failure in the broker layer.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The `broker` configuration section is unusable.
    #[error(transparent)]
    Config(#[from] SettingsError),

    /// `verify_hostname` is enabled but no reference hostname is given.
    #[error("server_hostname must be set when verify_hostname is")]
    MissingServerHostname,

    /// A TLS file referenced by the configuration could not be read.
    #[error("cannot load TLS material from {path}")]
    TlsMaterial {
        /// The path of the unreadable file.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A transport-level failure reported by the AMQP library.
    #[error(transparent)]
    Amqp(#[from] lapin::Error),

    /// An outbound message could not be serialized as JSON.
    #[error("cannot serialize outbound message content")]
    Serialize(#[from] serde_json::Error),
}

impl Retryable for BrokerError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Amqp(
                lapin::Error::IOError(_)
                    | lapin::Error::InvalidConnectionState(_)
                    | lapin::Error::InvalidChannelState(_)
                    | lapin::Error::ProtocolError(_)
            )
        )
    }
}

impl Broker {
    /// Creates a new broker manager for the given settings. No connection
    /// is made until the first operation needs one.
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            settings,
            state: AsyncMutex::new(None),
        }
    }

    /// Reports the redacted identifier of the broker this manager points
    /// at.
    pub fn identifier(&self) -> &str {
        self.settings.identifier()
    }

    /// Closes the current connection, if any, cascading to its channels.
    /// Safe to call repeatedly and on a never-connected broker.
    pub async fn close(&self) {
        let mut guard = self.state.lock().await;

        if let Some(live) = guard.take() {
            info!(
                identifier = self.settings.identifier(),
                "Closing the broker connection",
            );

            match live.connection.close(0, "worker shutdown").await {
                Ok(()) => {}
                Err(lapin::Error::InvalidConnectionState(_)) => {
                    debug!("The broker connection was already gone");
                }
                Err(error) => {
                    warn!(
                        ?error,
                        error_message = %error,
                        "Failed to cleanly close the broker connection",
                    );
                }
            }
        }
    }
}

impl Broker {
    /// Publishes JSON `content` to the given exchange with the given
    /// routing key, tagged with the mandatory correlation id.
    ///
    /// The message is sent with `content_type=application/json` and a
    /// persistent delivery mode. Connects first if necessary.
    pub async fn publish(
        &self,
        content: &Value,
        exchange: &str,
        routing_key: &str,
        correlation_id: &str,
    ) -> Result<(), BrokerError> {
        let payload = serde_json::to_vec(content)?;
        let channel = self.publish_channel().await?;

        debug!(exchange, routing_key, correlation_id, "Publishing a message");

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2) // persistent
            .with_correlation_id(correlation_id.into());

        let _confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await?;

        Ok(())
    }

    /// Consumes the given queue, passing each delivery to the handler,
    /// until the application context is terminated.
    ///
    /// The loop sets a prefetch of one on the consume channel, so at most
    /// one delivery is un-acked at any time. Transport failures (from the
    /// consumer stream or from inside the handler) discard the connection
    /// and re-enter the loop; the broker then redelivers whatever was left
    /// un-acked. Any other handler failure is returned to the caller as
    /// fatal.
    pub async fn consume<F, Fut>(&self, queue: &str, mut handler: F) -> Result<(), BrokerError>
    where
        F: FnMut(Delivery) -> Fut,
        Fut: Future<Output = Result<(), BrokerError>>,
    {
        while AppContext::is_alive() {
            // Ensure a connection and a dedicated consume channel
            let channel = match self.consume_channel().await {
                Ok(channel) => channel,
                Err(error) if error.is_retryable() => {
                    warn!(error_message = %error, "Retrying after a channel failure");
                    self.close().await;
                    continue;
                }
                Err(error) => return Err(error),
            };

            // One job per worker
            if let Err(error) = channel.basic_qos(1, BasicQosOptions { global: false }).await {
                warn!(error_message = %error, "Retrying after a QoS failure");
                self.close().await;
                continue;
            }

            // Start consumption
            let mut consumer = match channel
                .basic_consume(
                    queue,
                    "lega-ingest",
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
            {
                Ok(consumer) => consumer,
                Err(error) => {
                    warn!(queue, error_message = %error, "Retrying after a consume failure");
                    self.close().await;
                    continue;
                }
            };

            info!(queue, "Consuming messages");

            // Poll deliveries until shutdown or a transport failure
            let reconnect = loop {
                tokio::select! {
                    biased;
                    _ = AppContext::terminated() => {
                        info!("Stop consuming (shutdown requested)");
                        break false;
                    }
                    next = consumer.next() => match next {
                        Some(Ok(delivery)) => {
                            if let Err(error) = handler(Delivery::from(delivery)).await {
                                if error.is_retryable() {
                                    warn!(
                                        error_message = %error,
                                        "Retrying after a transport failure while handling a delivery",
                                    );
                                    break true;
                                }

                                // Non-transport failures are fatal for the loop
                                error!(
                                    alert = true,
                                    ?error,
                                    error_message = %error,
                                    "Unrecoverable failure while handling a delivery",
                                );
                                self.close().await;
                                return Err(error);
                            }
                        }
                        Some(Err(error)) => {
                            warn!(error_message = %error, "Retry after a consumer error");
                            break true;
                        }
                        None => {
                            warn!(queue, "The consumer stream dried out; reconnecting");
                            break true;
                        }
                    }
                }
            };

            // Both paths discard the connection; un-acked deliveries return
            // to the queue
            self.close().await;

            if !reconnect {
                break;
            }
        }

        Ok(())
    }
}

impl Broker {
    /// Returns the cached publish channel, creating the connection and/or
    /// the channel as needed.
    async fn publish_channel(&self) -> Result<Channel, BrokerError> {
        let mut guard = self.state.lock().await;
        let live = self.ensure_live(&mut guard).await?;

        match &live.publish_channel {
            Some(channel) if channel.status().connected() => Ok(channel.clone()),
            _ => {
                let channel = live.connection.create_channel().await?;
                live.publish_channel = Some(channel.clone());

                Ok(channel)
            }
        }
    }

    /// Returns the cached consume channel, creating the connection and/or
    /// the channel as needed.
    async fn consume_channel(&self) -> Result<Channel, BrokerError> {
        let mut guard = self.state.lock().await;
        let live = self.ensure_live(&mut guard).await?;

        match &live.consume_channel {
            Some(channel) if channel.status().connected() => Ok(channel.clone()),
            _ => {
                let channel = live.connection.create_channel().await?;
                live.consume_channel = Some(channel.clone());

                Ok(channel)
            }
        }
    }

    /// Makes sure the given state slot holds a connected [`Live`] state,
    /// re-establishing the connection if necessary.
    async fn ensure_live<'a>(
        &self,
        state: &'a mut Option<Live>,
    ) -> Result<&'a mut Live, BrokerError> {
        let connected = state
            .as_ref()
            .is_some_and(|live| live.connection.status().connected());

        if !connected {
            let connection = self.reconnect().await?;

            *state = Some(Live {
                connection,
                publish_channel: None,
                consume_channel: None,
            });
        }

        Ok(state.as_mut().expect("connection was just established"))
    }

    /// Establishes a fresh connection under the configured bounded retry.
    /// Exhausting the attempts terminates the process with exit code 1.
    async fn reconnect(&self) -> Result<Connection, BrokerError> {
        let retry = Retry::new(
            "mq:connect",
            self.settings.attempts(),
            self.settings.interval(),
        );

        retry
            .run(
                || self.establish(),
                || {
                    error!(
                        alert = true,
                        identifier = self.settings.identifier(),
                        "Broker connection attempts exhausted; terminating",
                    );

                    std::process::exit(1);
                },
            )
            .await
    }

    /// Makes a single connection attempt, with a TLS configuration when
    /// the URI scheme demands one.
    async fn establish(&self) -> Result<Connection, BrokerError> {
        info!(
            identifier = self.settings.identifier(),
            "Initializing a connection to the broker",
        );

        // Run the AMQP library on the current Tokio runtime; this also
        // keeps the heartbeat task alive in the background
        let mut properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);
        properties.client_properties = client_properties();

        let connection = match self.settings.tls() {
            Some(tls_settings) => {
                debug!("Enforcing a TLS context");
                let tls_config = tls::assemble(tls_settings)?;

                Connection::connect_with_config(
                    self.settings.dsn().unsecure(),
                    properties,
                    tls_config,
                )
                .await?
            }
            None => Connection::connect(self.settings.dsn().unsecure(), properties).await?,
        };

        Ok(connection)
    }
}

/// Identifies this worker to the broker operators.
fn client_properties() -> FieldTable {
    let mut service = FieldTable::default();
    service.insert(
        "container id".into(),
        AMQPValue::LongString(hostname().into()),
    );
    service.insert("process id".into(), AMQPValue::LongUInt(std::process::id()));

    let mut properties = FieldTable::default();
    properties.insert("EGA microservice".into(), AMQPValue::FieldTable(service));

    properties
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_retryable() {
        let io = BrokerError::Amqp(lapin::Error::IOError(std::sync::Arc::new(
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
        )));

        assert!(io.is_retryable());
    }

    #[test]
    fn configuration_errors_are_not_retryable() {
        let config = BrokerError::MissingServerHostname;

        assert!(!config.is_retryable());
    }

    #[test]
    fn client_properties_identify_the_service() {
        let properties = client_properties();

        let has_service_table = properties
            .inner()
            .iter()
            .any(|(key, _)| key.as_str() == "EGA microservice");
        assert!(has_service_table);
    }
}
