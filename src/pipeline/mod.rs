//! Delivery sinks for the two program shapes.
//!
//! Both shapes run on the same session/flow harness; they differ only in the
//! `DeliveryHandler` installed on the flow.

use std::sync::Arc;

use crate::bus::{DeliveryHandler, Result, Session};
use crate::runtime::counters::Counters;
use crate::runtime::shutdown::Shutdown;

pub mod drain;
pub mod events;
pub mod processor;

pub use drain::DrainPipeline;
pub use events::{ProducerErrors, SessionEvents};
pub use processor::{derive_outbound, ProcessorPipeline};

/// Which delivery sink a program installs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineKind {
    /// Republish the upper-cased source topic on `output_topic`, then acknowledge.
    Processor { output_topic: String },
    /// Count and acknowledge.
    Drain,
}

impl PipelineKind {
    /// Build the delivery sink, creating a producer on `session` if the shape
    /// publishes.
    pub async fn install(
        &self,
        session: &dyn Session,
        counters: Arc<Counters>,
        shutdown: Shutdown,
    ) -> Result<Arc<dyn DeliveryHandler>> {
        match self {
            PipelineKind::Processor { output_topic } => {
                let producer = session
                    .create_producer(Arc::new(ProducerErrors::new(shutdown.clone())))
                    .await?;
                Ok(Arc::new(ProcessorPipeline::new(
                    producer,
                    output_topic.clone(),
                    counters,
                    shutdown,
                )))
            }
            PipelineKind::Drain => Ok(Arc::new(DrainPipeline::new(counters))),
        }
    }
}
