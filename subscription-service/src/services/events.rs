//! Domain event publication.

use crate::models::EventEnvelope;
use async_trait::async_trait;

/// Receives lifecycle events after the change that caused them has committed.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, envelope: EventEnvelope);
}

/// Writes each event as a structured audit log line.
#[derive(Debug, Default, Clone)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn publish(&self, envelope: EventEnvelope) {
        let payload = envelope.event.payload();
        tracing::info!(
            target: "audit",
            event = envelope.event.name(),
            subscription_id = %payload.id,
            user_id = %payload.user_id,
            status = ?payload.status,
            occurred_at = %envelope.occurred_at,
            "Subscription event"
        );
    }
}
