//! Consumer-only shape: count and acknowledge.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, trace};

use crate::bus::{Delivery, DeliveryHandler};
use crate::runtime::counters::Counters;

/// Drains a queue. No republishing, no transformation.
pub struct DrainPipeline {
    counters: Arc<Counters>,
}

impl DrainPipeline {
    pub fn new(counters: Arc<Counters>) -> Self {
        Self { counters }
    }
}

#[async_trait]
impl DeliveryHandler for DrainPipeline {
    async fn on_delivery(&self, delivery: Delivery) {
        self.counters.record_received();
        if delivery.message().discard_indication {
            self.counters.record_discard();
        }

        // Nothing on the console per message; it cannot keep up.
        trace!(message = %delivery.message(), "Drained");

        if let Err(e) = delivery.ack().await {
            error!(error = %e, "Failed to ack message");
        }
    }
}
