use crate::broker::BrokerError;
use lapin::acker::Acker;
use lapin::message::Delivery as LapinDelivery;
use lapin::options::{BasicAckOptions, BasicRejectOptions};
use tracing::debug;

/// Represents one incoming delivery for the duration of its processing.
///
/// Owns the payload bytes and the broker-side acknowledgement handle; the
/// consume loop hands a delivery to the message handler, which must
/// finalize it exactly once with [`ack`](Delivery::ack) or
/// [`reject`](Delivery::reject).
pub struct Delivery {
    delivery_tag: u64,
    correlation_id: Option<String>,
    content_type: Option<String>,
    body: Vec<u8>,
    acker: Acker,
}

impl Delivery {
    /// Reports the broker-assigned delivery tag.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Reports the producer-assigned correlation id, if present.
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Reports the declared content type, if present.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Exposes the payload bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Acknowledges this delivery with the broker.
    pub async fn ack(&self) -> Result<(), BrokerError> {
        debug!(delivery_tag = self.delivery_tag, "Acking delivery");

        self.acker.ack(BasicAckOptions::default()).await?;

        Ok(())
    }

    /// Rejects this delivery, optionally asking the broker to requeue it.
    pub async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        debug!(delivery_tag = self.delivery_tag, requeue, "Rejecting delivery");

        self.acker.reject(BasicRejectOptions { requeue }).await?;

        Ok(())
    }
}

impl From<LapinDelivery> for Delivery {
    fn from(delivery: LapinDelivery) -> Self {
        let correlation_id = delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(ToString::to_string);
        let content_type = delivery
            .properties
            .content_type()
            .as_ref()
            .map(ToString::to_string);

        Self {
            delivery_tag: delivery.delivery_tag,
            correlation_id,
            content_type,
            body: delivery.data,
            acker: delivery.acker,
        }
    }
}
