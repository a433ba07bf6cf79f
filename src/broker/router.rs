//! Message router
//!
//! Every inbound publish gets a sequence number and a telemetry event before any
//! routing decision is made, so observability does not depend on the outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::registry::{Dispatch, TopicRegistry};
use crate::protocol::ApplicationMessage;
use crate::telemetry::{TelemetryEvent, TelemetrySink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Routed { sequence: u64, dispatch: Dispatch },
    Malformed { sequence: u64 },
}

impl RouteOutcome {
    pub fn sequence(&self) -> u64 {
        match self {
            RouteOutcome::Routed { sequence, .. } | RouteOutcome::Malformed { sequence } => {
                *sequence
            }
        }
    }

    pub fn delivered(&self) -> usize {
        match self {
            RouteOutcome::Routed { dispatch, .. } => dispatch.delivered,
            RouteOutcome::Malformed { .. } => 0,
        }
    }
}

pub struct MessageRouter {
    registry: Arc<TopicRegistry>,
    telemetry: Arc<dyn TelemetrySink>,
    counter: AtomicU64,
}

impl MessageRouter {
    pub fn new(registry: Arc<TopicRegistry>, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            registry,
            telemetry,
            counter: AtomicU64::new(0),
        }
    }

    /// Number of messages routed so far
    pub fn routed(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    pub async fn route(&self, source: &str, message: ApplicationMessage) -> RouteOutcome {
        let sequence = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.telemetry
            .emit(TelemetryEvent::message_routed(sequence, source, &message));

        if let Err(e) = message.validate() {
            warn!("Message {} from {} not routed: {}", sequence, source, e);
            return RouteOutcome::Malformed { sequence };
        }

        let dispatch = self.registry.dispatch(&message).await;
        debug!(
            "Message {} on {} routed to {}/{} subscribers",
            sequence,
            message.topic(),
            dispatch.delivered,
            dispatch.matched
        );
        RouteOutcome::Routed { sequence, dispatch }
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("routed", &self.routed())
            .finish()
    }
}
