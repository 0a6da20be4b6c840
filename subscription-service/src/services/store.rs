//! Persistence seam shared by the scheduler jobs and the operator API.
//!
//! Every mutating method is a compare-and-write: it states the prior state it
//! expects and reports a miss (`None` / `false`) instead of failing when a
//! concurrent writer got there first.

use crate::models::{
    CreateSubscription, HistoryUsage, NewPeriod, OrderLink, PeriodStatus, Plan, StatusChange,
    Subscription, SubscriptionHistory, SubscriptionPeriod,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use service_core::error::AppError;
use uuid::Uuid;

/// Result of a status change that matched.
#[derive(Debug, Clone)]
pub struct StatusChangeResult {
    pub subscription: Subscription,
    /// Periods whose status the cascade changed.
    pub periods: Vec<SubscriptionPeriod>,
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    // -- catalog ------------------------------------------------------------

    async fn get_plan_for_offer(&self, offer_id: Uuid) -> Result<Option<Plan>, AppError>;

    // -- subscriptions ------------------------------------------------------

    /// Insert a PENDING subscription whose first period is already current.
    async fn create_subscription(
        &self,
        input: &CreateSubscription,
        ends_at: DateTime<Utc>,
    ) -> Result<(Subscription, SubscriptionPeriod), AppError>;

    async fn get_subscription(&self, subscription_id: Uuid)
        -> Result<Option<Subscription>, AppError>;

    async fn list_child_subscriptions(&self, parent_id: Uuid)
        -> Result<Vec<Subscription>, AppError>;

    /// ACTIVE, auto-renewing subscriptions with a current period and no
    /// uncancelled period starting after `now`, earliest current-period end first.
    async fn find_subscriptions_needing_period(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Subscription>, AppError>;

    /// Subscriptions whose current period ended at or before `now`.
    async fn find_subscriptions_with_ended_period(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Subscription>, AppError>;

    /// Apply `change` and its period cascade atomically. `None` when the
    /// subscription was not in an expected status.
    async fn apply_status_change(
        &self,
        change: &StatusChange,
    ) -> Result<Option<StatusChangeResult>, AppError>;

    /// Point the subscription at `next` (and its offer) if its current period is
    /// still `expected_period_id`.
    async fn advance_current_period(
        &self,
        subscription_id: Uuid,
        expected_period_id: Uuid,
        next: &SubscriptionPeriod,
    ) -> Result<bool, AppError>;

    // -- periods ------------------------------------------------------------

    async fn get_period(&self, period_id: Uuid) -> Result<Option<SubscriptionPeriod>, AppError>;

    /// All periods of a subscription ordered by `starts_at`.
    async fn list_periods(&self, subscription_id: Uuid)
        -> Result<Vec<SubscriptionPeriod>, AppError>;

    /// The uncancelled period with the latest `ends_at`.
    async fn latest_period(&self, subscription_id: Uuid)
        -> Result<Option<SubscriptionPeriod>, AppError>;

    /// The period eligible to be current at `at`.
    async fn find_period_at(
        &self,
        subscription_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<SubscriptionPeriod>, AppError>;

    /// Insert a PENDING period unless one already starts at the same instant.
    /// Fails with `InvariantViolation` if, afterwards, more than one
    /// uncancelled period starts at or after the new one.
    async fn insert_next_period(
        &self,
        period: &NewPeriod,
    ) -> Result<Option<SubscriptionPeriod>, AppError>;

    async fn update_period_status(
        &self,
        period_id: Uuid,
        expected: &[PeriodStatus],
        status: PeriodStatus,
    ) -> Result<Option<SubscriptionPeriod>, AppError>;

    // -- orders -------------------------------------------------------------

    async fn record_order(&self, link: &OrderLink) -> Result<(), AppError>;

    async fn get_order_link(&self, order_id: Uuid) -> Result<Option<OrderLink>, AppError>;

    /// Orders of a period, newest first.
    async fn list_orders_for_period(&self, period_id: Uuid) -> Result<Vec<OrderLink>, AppError>;

    // -- history ------------------------------------------------------------

    /// ACTIVE root subscriptions with no history row newer than `cutoff`.
    async fn find_subscriptions_due_for_history(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Subscription>, AppError>;

    /// Insert one row for `root` and one per child at `recorded_at`, then verify
    /// the root has exactly one row newer than `cutoff`. On violation nothing is
    /// kept and `InvariantViolation` is returned.
    async fn insert_history_snapshot(
        &self,
        root: &Subscription,
        children: &[Subscription],
        recorded_at: DateTime<Utc>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SubscriptionHistory>, AppError>;

    async fn attach_history_config(&self, history_id: Uuid, config: &Value)
        -> Result<(), AppError>;

    async fn insert_history_usage(&self, usage: &[HistoryUsage]) -> Result<(), AppError>;

    /// Usage rows of the subscription's latest snapshot taken before `before`.
    async fn previous_usage(
        &self,
        subscription_id: Uuid,
        before: DateTime<Utc>,
    ) -> Result<Vec<HistoryUsage>, AppError>;

    /// History rows newest first.
    async fn list_history(
        &self,
        subscription_id: Uuid,
        limit: i64,
    ) -> Result<Vec<SubscriptionHistory>, AppError>;

    async fn list_history_usage(&self, history_id: Uuid) -> Result<Vec<HistoryUsage>, AppError>;
}
