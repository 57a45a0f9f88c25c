//! Processor shape: derive, republish, acknowledge.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::bus::{Delivery, DeliveryHandler, InboundMessage, OutboundMessage, Producer};
use crate::runtime::counters::Counters;
use crate::runtime::shutdown::{Shutdown, StopReason};

/// Build the outbound message for one inbound message.
///
/// The body is the inbound topic upper-cased with the Unicode default case
/// mapping (no locale). The correlation id is carried over when present.
pub fn derive_outbound(inbound: &InboundMessage, output_topic: &str) -> OutboundMessage {
    OutboundMessage {
        topic: output_topic.to_string(),
        text: inbound.topic.to_uppercase(),
        correlation_id: inbound.correlation_id.clone(),
    }
}

/// Republishes a derived message for every delivery.
///
/// Every delivery is acknowledged after the send attempt, whether the send
/// succeeded or not. Output is at-most-once: a failed send is not retried and
/// the input is not redelivered.
pub struct ProcessorPipeline {
    producer: Arc<dyn Producer>,
    output_topic: String,
    counters: Arc<Counters>,
    shutdown: Shutdown,
}

impl ProcessorPipeline {
    pub fn new(
        producer: Arc<dyn Producer>,
        output_topic: impl Into<String>,
        counters: Arc<Counters>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            producer,
            output_topic: output_topic.into(),
            counters,
            shutdown,
        }
    }

    async fn forward(&self, inbound: &InboundMessage) {
        let outbound = derive_outbound(inbound, &self.output_topic);

        match self.producer.send(&outbound).await {
            Ok(()) => {
                self.counters.record_sent();
                debug!(topic = %outbound.topic, text = %outbound.text, "Republished");
            }
            Err(e) => {
                error!(error = %e, "Caught while trying to producer.send()");
                if let Some((subcode, phrase)) = e.response() {
                    warn!(subcode = %subcode, phrase = %phrase, "Send rejected by broker");
                }
                if e.is_transport() {
                    self.shutdown.trigger(StopReason::TransportLost);
                }
            }
        }
    }
}

#[async_trait]
impl DeliveryHandler for ProcessorPipeline {
    async fn on_delivery(&self, delivery: Delivery) {
        self.counters.record_received();
        if delivery.message().discard_indication {
            self.counters.record_discard();
        }

        self.forward(delivery.message()).await;

        if let Err(e) = delivery.ack().await {
            error!(error = %e, "Failed to ack message");
        }
    }
}

#[cfg(test)]
mod tests;
