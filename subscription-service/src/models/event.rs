//! Domain events emitted on subscription lifecycle changes.

use super::{Subscription, SubscriptionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Common payload carried by every subscription event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionEventPayload {
    pub id: Uuid,
    pub status: SubscriptionStatus,
    pub user_id: Uuid,
}

impl From<&Subscription> for SubscriptionEventPayload {
    fn from(subscription: &Subscription) -> Self {
        Self {
            id: subscription.subscription_id,
            status: subscription.status,
            user_id: subscription.user_id,
        }
    }
}

/// Lifecycle event, discriminated by its `type` field on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SubscriptionEvent {
    #[serde(rename = "subscription.created")]
    Created(SubscriptionEventPayload),
    #[serde(rename = "subscription.activated")]
    Activated(SubscriptionEventPayload),
    #[serde(rename = "subscription.cancelled")]
    Cancelled(SubscriptionEventPayload),
    #[serde(rename = "subscription.uncancelled")]
    Uncancelled(SubscriptionEventPayload),
    #[serde(rename = "subscription.deactivated")]
    Deactivated(SubscriptionEventPayload),
    #[serde(rename = "subscription.suspended")]
    Suspended(SubscriptionEventPayload),
    #[serde(rename = "subscription.reactivated")]
    Reactivated(SubscriptionEventPayload),
}

impl SubscriptionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SubscriptionEvent::Created(_) => "subscription.created",
            SubscriptionEvent::Activated(_) => "subscription.activated",
            SubscriptionEvent::Cancelled(_) => "subscription.cancelled",
            SubscriptionEvent::Uncancelled(_) => "subscription.uncancelled",
            SubscriptionEvent::Deactivated(_) => "subscription.deactivated",
            SubscriptionEvent::Suspended(_) => "subscription.suspended",
            SubscriptionEvent::Reactivated(_) => "subscription.reactivated",
        }
    }

    pub fn payload(&self) -> &SubscriptionEventPayload {
        match self {
            SubscriptionEvent::Created(p)
            | SubscriptionEvent::Activated(p)
            | SubscriptionEvent::Cancelled(p)
            | SubscriptionEvent::Uncancelled(p)
            | SubscriptionEvent::Deactivated(p)
            | SubscriptionEvent::Suspended(p)
            | SubscriptionEvent::Reactivated(p) => p,
        }
    }
}

/// Event with its emission time, as handed to sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub occurred_at: DateTime<Utc>,
    pub event: SubscriptionEvent,
}

impl EventEnvelope {
    pub fn new(event: SubscriptionEvent, occurred_at: DateTime<Utc>) -> Self {
        Self { occurred_at, event }
    }
}
