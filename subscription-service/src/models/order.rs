//! Order references exchanged with the order workflow.

use super::UnknownVariant;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Order status as reported by the order workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
    Aborted,
}

impl OrderStatus {
    /// Terminal outcome; the workflow will not move the order any further.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            OrderStatus::Succeeded | OrderStatus::Failed | OrderStatus::Aborted
        )
    }
}

/// What an order does for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderKind {
    Renewal,
    Deactivation,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Renewal => "renewal",
            OrderKind::Deactivation => "deactivation",
        }
    }
}

impl FromStr for OrderKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "renewal" => Ok(OrderKind::Renewal),
            "deactivation" => Ok(OrderKind::Deactivation),
            other => Err(UnknownVariant::new("order kind", other)),
        }
    }
}

/// Opaque order handle returned by the workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRef {
    pub order_id: Uuid,
    pub status: OrderStatus,
}

/// Local record tying an order to the subscription (and period) it was created for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLink {
    pub order_id: Uuid,
    pub subscription_id: Uuid,
    pub period_id: Option<Uuid>,
    pub kind: OrderKind,
    pub created_utc: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_statuses() {
        assert!(OrderStatus::Succeeded.is_final());
        assert!(OrderStatus::Failed.is_final());
        assert!(OrderStatus::Aborted.is_final());
        assert!(!OrderStatus::Pending.is_final());
        assert!(!OrderStatus::Processing.is_final());
    }
}
