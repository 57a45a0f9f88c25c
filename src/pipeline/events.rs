//! Producer error sink and session lifecycle sink.

use tracing::{error, info, warn};

use crate::bus::{BusError, ProducerEventHandler, SessionEvent, SessionEventHandler};
use crate::runtime::shutdown::{Shutdown, StopReason};

/// Turns producer transport loss into a terminal shutdown; logs everything else.
#[derive(Debug, Clone)]
pub struct ProducerErrors {
    shutdown: Shutdown,
}

impl ProducerErrors {
    pub fn new(shutdown: Shutdown) -> Self {
        Self { shutdown }
    }
}

impl ProducerEventHandler for ProducerErrors {
    fn on_error(&self, error: &BusError) {
        error!(error = %error, "Producer error callback");
        if error.is_transport() {
            self.shutdown.trigger(StopReason::TransportLost);
        } else if let Some((subcode, phrase)) = error.response() {
            warn!(subcode = %subcode, phrase = %phrase, "{}: {}", subcode, phrase);
        }
    }
}

/// Logs every session event; a terminal event sets the shutdown flag.
#[derive(Debug, Clone)]
pub struct SessionEvents {
    shutdown: Shutdown,
}

impl SessionEvents {
    pub fn new(shutdown: Shutdown) -> Self {
        Self { shutdown }
    }
}

impl SessionEventHandler for SessionEvents {
    fn on_event(&self, event: &SessionEvent) {
        info!(event = %event, "Received a Session event");
        if event.is_terminal() {
            self.shutdown.trigger(StopReason::TransportLost);
        }
    }
}
