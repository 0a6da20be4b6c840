//! Domain models for subscription-service.

mod event;
mod history;
mod order;
mod period;
mod plan;
mod subscription;

pub use event::{EventEnvelope, SubscriptionEvent, SubscriptionEventPayload};
pub use history::{
    usage_with_increments, HistoryUsage, SubscriptionHistory, TelcoConfig, TelcoUsage, UsageKey,
    VolumeType,
};
pub use order::{OrderKind, OrderLink, OrderRef, OrderStatus};
pub use period::{NewPeriod, PeriodStatus, SubscriptionPeriod};
pub use plan::{Offer, Plan};
pub use subscription::{
    CreateSubscription, PeriodCascade, Stamp, StatusChange, Subscription, SubscriptionStatus,
};

/// A stored enum value that this build does not know about.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

impl UnknownVariant {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
