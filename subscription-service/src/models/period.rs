//! Subscription period model.

use super::{Plan, UnknownVariant};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::str::FromStr;
use uuid::Uuid;

/// Period status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeriodStatus {
    Pending,
    Processing,
    Done,
    Failed,
    Cancelled,
}

impl PeriodStatus {
    /// Statuses a period may have and still become the subscription's current one.
    pub const ELIGIBLE_FOR_CURRENT: [PeriodStatus; 3] = [
        PeriodStatus::Pending,
        PeriodStatus::Processing,
        PeriodStatus::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodStatus::Pending => "pending",
            PeriodStatus::Processing => "processing",
            PeriodStatus::Done => "done",
            PeriodStatus::Failed => "failed",
            PeriodStatus::Cancelled => "cancelled",
        }
    }

    pub fn can_become_current(&self) -> bool {
        Self::ELIGIBLE_FOR_CURRENT.contains(self)
    }
}

impl FromStr for PeriodStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PeriodStatus::Pending),
            "processing" => Ok(PeriodStatus::Processing),
            "done" => Ok(PeriodStatus::Done),
            "failed" => Ok(PeriodStatus::Failed),
            "cancelled" => Ok(PeriodStatus::Cancelled),
            other => Err(UnknownVariant::new("period status", other)),
        }
    }
}

/// A half-open `[starts_at, ends_at)` service period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPeriod {
    pub period_id: Uuid,
    pub subscription_id: Uuid,
    pub offer_id: Uuid,
    pub status: PeriodStatus,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl SubscriptionPeriod {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.starts_at <= at && at < self.ends_at
    }

    pub fn has_ended(&self, at: DateTime<Utc>) -> bool {
        self.ends_at <= at
    }

    pub fn is_future(&self, at: DateTime<Utc>) -> bool {
        self.starts_at > at
    }
}

/// Input for inserting a period.
#[derive(Debug, Clone)]
pub struct NewPeriod {
    pub subscription_id: Uuid,
    pub offer_id: Uuid,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

impl NewPeriod {
    /// The period of `plan` that directly follows `anchor`.
    pub fn following(
        anchor: &SubscriptionPeriod,
        offer_id: Uuid,
        plan: &Plan,
    ) -> Result<Self, AppError> {
        Ok(Self {
            subscription_id: anchor.subscription_id,
            offer_id,
            starts_at: anchor.ends_at,
            ends_at: plan.period_end(anchor.ends_at)?,
        })
    }
}
