//! Subscription model.

use super::{NewPeriod, UnknownVariant};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Cancelled,
    Suspended,
    Deactivated,
}

impl SubscriptionStatus {
    pub const ALL: [SubscriptionStatus; 5] = [
        SubscriptionStatus::Pending,
        SubscriptionStatus::Active,
        SubscriptionStatus::Cancelled,
        SubscriptionStatus::Suspended,
        SubscriptionStatus::Deactivated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Deactivated => "deactivated",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SubscriptionStatus::Pending),
            "active" => Ok(SubscriptionStatus::Active),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            "suspended" => Ok(SubscriptionStatus::Suspended),
            "deactivated" => Ok(SubscriptionStatus::Deactivated),
            other => Err(UnknownVariant::new("subscription status", other)),
        }
    }
}

/// Subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub offer_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub status: SubscriptionStatus,
    pub current_period_id: Option<Uuid>,
    pub sim_iccid: Option<String>,
    pub phone_number_msisdn: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Subscription {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// `current_period_id` is set exactly when the subscription is not deactivated.
    pub fn period_invariant_holds(&self) -> bool {
        self.current_period_id.is_some() != (self.status == SubscriptionStatus::Deactivated)
    }
}

/// Input for creating a subscription together with its first period.
#[derive(Debug, Clone)]
pub struct CreateSubscription {
    pub user_id: Uuid,
    pub offer_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub sim_iccid: Option<String>,
    pub phone_number_msisdn: Option<String>,
    pub starts_at: DateTime<Utc>,
}

/// A timestamp column touched by a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stamp {
    Keep,
    Set(DateTime<Utc>),
    Clear,
}

impl Stamp {
    pub fn apply(self, current: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        match self {
            Stamp::Keep => current,
            Stamp::Set(at) => Some(at),
            Stamp::Clear => None,
        }
    }

    /// `(touch, value)` pair for `CASE WHEN $touch THEN $value ELSE column END`.
    pub fn as_sql_params(self) -> (bool, Option<DateTime<Utc>>) {
        match self {
            Stamp::Keep => (false, None),
            Stamp::Set(at) => (true, Some(at)),
            Stamp::Clear => (true, None),
        }
    }
}

/// What happens to a subscription's periods as part of a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodCascade {
    None,
    /// PENDING periods starting after `after` (or all of them) become CANCELLED.
    CancelPending { after: Option<DateTime<Utc>> },
    /// CANCELLED periods starting after `after` return to PENDING.
    Reinstate { after: DateTime<Utc> },
}

/// Conditional status update. Matches only while the subscription is in one of
/// `expected`; a miss leaves every row untouched.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub subscription_id: Uuid,
    pub expected: Vec<SubscriptionStatus>,
    pub status: SubscriptionStatus,
    pub activated_at: Stamp,
    pub canceled_at: Stamp,
    pub suspended_at: Stamp,
    pub deactivated_at: Stamp,
    pub clear_current_period: bool,
    /// Insert this period and make it current in the same write.
    pub start_period: Option<NewPeriod>,
    pub periods: PeriodCascade,
}

impl StatusChange {
    pub fn new(
        subscription_id: Uuid,
        expected: Vec<SubscriptionStatus>,
        status: SubscriptionStatus,
    ) -> Self {
        Self {
            subscription_id,
            expected,
            status,
            activated_at: Stamp::Keep,
            canceled_at: Stamp::Keep,
            suspended_at: Stamp::Keep,
            deactivated_at: Stamp::Keep,
            clear_current_period: false,
            start_period: None,
            periods: PeriodCascade::None,
        }
    }
}
