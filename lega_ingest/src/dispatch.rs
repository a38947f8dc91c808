use crate::message::{attach_error, is_empty_content, malformed_envelope, user_error_message};
use crate::routing::Routing;
use lega_amqp::{Broker, BrokerError, Delivery};
use lega_core::WorkFailure;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{Instrument, error, info, info_span, warn};

/// Routes each delivery through the supplied work function and turns the
/// outcome into exactly one broker-side reaction.
///
/// Per delivery: malformed JSON goes straight to the system-error key
/// and is rejected; empty content is acked and dropped; a successful
/// outcome is published on the configured success route *before* the
/// ack; a user-attributable failure is published to the user (scrubbed,
/// with a `reason`), acked, and then echoed to the system-error key for
/// operators; anything else lands on the system-error key and is
/// rejected without requeue.
///
/// The delivery's correlation id is carried on a per-delivery `tracing`
/// span and passed explicitly to every publish.
pub struct Dispatcher {
    broker: Arc<Broker>,
    routing: Routing,
}

impl Dispatcher {
    /// Creates a new dispatcher over the given broker and routes.
    pub fn new(broker: Arc<Broker>, routing: Routing) -> Self {
        Self { broker, routing }
    }

    /// Exposes the routing configuration of this dispatcher.
    pub fn routing(&self) -> &Routing {
        &self.routing
    }

    /// Handles one delivery to completion.
    ///
    /// The returned error is a broker-level failure (a publish or an
    /// ack/reject that could not be carried out); processing failures are
    /// consumed here and routed per the classification above.
    pub async fn handle<W, Fut>(&self, delivery: Delivery, work: W) -> Result<(), BrokerError>
    where
        W: FnOnce(Value, String) -> Fut,
        Fut: Future<Output = Result<Value, WorkFailure>>,
    {
        let correlation_id = delivery.correlation_id().unwrap_or_default().to_string();
        let span = info_span!(
            "delivery",
            correlation_id = correlation_id.as_str(),
            delivery_tag = delivery.delivery_tag(),
        );

        self.dispatch(delivery, correlation_id, work)
            .instrument(span)
            .await
    }

    async fn dispatch<W, Fut>(
        &self,
        delivery: Delivery,
        correlation_id: String,
        work: W,
    ) -> Result<(), BrokerError>
    where
        W: FnOnce(Value, String) -> Fut,
        Fut: Future<Output = Result<Value, WorkFailure>>,
    {
        info!("Processing message");

        // Interpret the body
        let content = if delivery.content_type() == Some("application/json") {
            match serde_json::from_slice::<Value>(delivery.body()) {
                Ok(content) => content,
                Err(parse_error) => {
                    error!(error_message = %parse_error, "Malformed JSON-message");

                    let envelope =
                        malformed_envelope(&format!("{parse_error:?}"), delivery.body());
                    self.publish_system_error(&envelope, &correlation_id).await?;
                    delivery.reject(false).await?;

                    return Ok(());
                }
            }
        } else {
            // Non-JSON deliveries carry their body as a plain string
            Value::String(String::from_utf8_lossy(delivery.body()).into_owned())
        };

        // Nothing to do?
        if is_empty_content(&content) {
            delivery.ack().await?;

            return Ok(());
        }

        // Keep the original for the error paths; `work` owns its copy
        let original = content.clone();

        match work(content, correlation_id.clone()).await {
            // All good: the reply goes out before the ack
            Ok(reply) => {
                self.broker
                    .publish(
                        &reply,
                        &self.routing.exchange,
                        &self.routing.routing_key,
                        &correlation_id,
                    )
                    .await?;
                delivery.ack().await?;
            }

            // Not for this worker: back on the queue, no side effects
            Err(WorkFailure::Reject) => {
                warn!(
                    delivery_tag = delivery.delivery_tag(),
                    "Message rejected; handing it back to the queue",
                );
                delivery.reject(true).await?;
            }

            // The user's fault: inform the user, ack, then echo to the
            // operators on the system-error stream
            Err(failure @ WorkFailure::User(_)) => {
                error!(formal = failure.formal().as_str(), "User-attributable failure");

                let user_message = user_error_message(&original, &failure);
                self.broker
                    .publish(
                        &user_message,
                        &self.routing.exchange,
                        &self.routing.user_error_key,
                        &correlation_id,
                    )
                    .await?;
                delivery.ack().await?;

                let system_message = attach_error(user_message, &failure);
                self.publish_system_error(&system_message, &correlation_id)
                    .await?;
            }

            // Everything else: operators only, no redelivery
            Err(failure) => {
                error!(formal = failure.formal().as_str(), "System failure");

                let message = attach_error(original, &failure);
                self.publish_system_error(&message, &correlation_id).await?;
                delivery.reject(false).await?;
            }
        }

        Ok(())
    }

    async fn publish_system_error(
        &self,
        content: &Value,
        correlation_id: &str,
    ) -> Result<(), BrokerError> {
        self.broker
            .publish(
                content,
                &self.routing.exchange,
                &self.routing.system_error_key,
                correlation_id,
            )
            .await
    }
}
