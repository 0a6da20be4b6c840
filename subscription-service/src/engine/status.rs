//! Subscription status state machine.
//!
//! Every transition is a compare-and-write keyed on the status read just
//! before it. A miss means another writer moved the subscription first and is
//! reported as `TransitionOutcome::Skipped`, with no event and no orders.

use crate::engine::EngineDeps;
use crate::models::{
    CreateSubscription, EventEnvelope, NewPeriod, PeriodCascade, PeriodStatus, Stamp,
    StatusChange, Subscription, SubscriptionEvent, SubscriptionEventPayload, SubscriptionPeriod,
    SubscriptionStatus,
};
use crate::services::metrics::record_status_transition;
use crate::services::store::StatusChangeResult;
use crate::services::OrderCommand;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::SubscriptionStatus::{Active, Cancelled, Deactivated, Pending, Suspended};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Activate,
    Cancel,
    Uncancel,
    Suspend,
    Reactivate,
    Deactivate,
}

impl Transition {
    pub const ALL: [Transition; 6] = [
        Transition::Activate,
        Transition::Cancel,
        Transition::Uncancel,
        Transition::Suspend,
        Transition::Reactivate,
        Transition::Deactivate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Activate => "activate",
            Transition::Cancel => "cancel",
            Transition::Uncancel => "uncancel",
            Transition::Suspend => "suspend",
            Transition::Reactivate => "reactivate",
            Transition::Deactivate => "deactivate",
        }
    }

    /// Statuses this transition may start from.
    pub fn allowed_from(&self) -> &'static [SubscriptionStatus] {
        match self {
            Transition::Activate => &[Pending, Cancelled, Suspended],
            Transition::Cancel => &[Active],
            Transition::Uncancel => &[Cancelled],
            Transition::Suspend => &[Pending, Active, Cancelled],
            Transition::Reactivate => &[Pending, Cancelled, Suspended, Deactivated],
            Transition::Deactivate => &[Pending, Active, Cancelled, Suspended],
        }
    }

    pub fn target(&self) -> SubscriptionStatus {
        match self {
            Transition::Activate | Transition::Uncancel | Transition::Reactivate => Active,
            Transition::Cancel => Cancelled,
            Transition::Suspend => Suspended,
            Transition::Deactivate => Deactivated,
        }
    }

    pub fn is_allowed_from(&self, status: SubscriptionStatus) -> bool {
        self.allowed_from().contains(&status)
    }

    fn event(&self, payload: SubscriptionEventPayload) -> SubscriptionEvent {
        match self {
            Transition::Activate => SubscriptionEvent::Activated(payload),
            Transition::Cancel => SubscriptionEvent::Cancelled(payload),
            Transition::Uncancel => SubscriptionEvent::Uncancelled(payload),
            Transition::Suspend => SubscriptionEvent::Suspended(payload),
            Transition::Reactivate => SubscriptionEvent::Reactivated(payload),
            Transition::Deactivate => SubscriptionEvent::Deactivated(payload),
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transition {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Transition::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Unknown transition: {}", s)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(Subscription),
    Skipped,
}

/// Status transitions, subscription creation and their side effects.
#[derive(Clone)]
pub struct StatusEngine {
    deps: EngineDeps,
}

impl StatusEngine {
    pub fn new(deps: EngineDeps) -> Self {
        Self { deps }
    }

    /// Create a PENDING subscription with its first period and order it.
    #[tracing::instrument(skip(self, input), fields(user_id = %input.user_id, offer_id = %input.offer_id))]
    pub async fn create(
        &self,
        input: &CreateSubscription,
        now: DateTime<Utc>,
    ) -> Result<(Subscription, SubscriptionPeriod), AppError> {
        let plan = self
            .deps
            .store
            .get_plan_for_offer(input.offer_id)
            .await?
            .ok_or_else(|| {
                AppError::BadRequest(anyhow::anyhow!("Unknown offer {}", input.offer_id))
            })?;

        if let Some(parent_id) = input.parent_id {
            let parent = self
                .deps
                .store
                .get_subscription(parent_id)
                .await?
                .ok_or_else(|| {
                    AppError::BadRequest(anyhow::anyhow!("Parent subscription {} not found", parent_id))
                })?;
            if !parent.is_root() {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Parent subscription {} is itself a child line",
                    parent_id
                )));
            }
        }

        let ends_at = plan.period_end(input.starts_at)?;
        let (subscription, period) = self.deps.store.create_subscription(input, ends_at).await?;

        tracing::info!(
            subscription_id = %subscription.subscription_id,
            period_id = %period.period_id,
            "Subscription created"
        );

        self.publish(
            SubscriptionEvent::Created(SubscriptionEventPayload::from(&subscription)),
            now,
        )
        .await;
        self.deps
            .orders
            .dispatch(OrderCommand::RenewPlan {
                user_id: subscription.user_id,
                offer_id: period.offer_id,
                subscription_id: subscription.subscription_id,
                period_id: period.period_id,
            })
            .await;

        Ok((subscription, period))
    }

    /// Operator entry point: absent subscriptions are `NotFound`, a status
    /// that does not allow the transition is a `Conflict`.
    pub async fn request(
        &self,
        subscription_id: Uuid,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Subscription, AppError> {
        let subscription = self.load(subscription_id).await?;
        if !transition.is_allowed_from(subscription.status) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Cannot {} a subscription that is {}",
                transition,
                subscription.status.as_str()
            )));
        }

        match self.apply_to(&subscription, transition, now).await? {
            TransitionOutcome::Applied(updated) => Ok(updated),
            TransitionOutcome::Skipped => Err(AppError::Conflict(anyhow::anyhow!(
                "Subscription {} changed concurrently",
                subscription_id
            ))),
        }
    }

    /// Load the subscription and apply `transition` if its status allows it.
    pub async fn apply(
        &self,
        subscription_id: Uuid,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, AppError> {
        let subscription = self.load(subscription_id).await?;
        self.apply_to(&subscription, transition, now).await
    }

    /// Apply `transition` to `subscription` as it was read; the write matches
    /// only while the stored status is still `subscription.status`.
    #[tracing::instrument(skip(self, subscription), fields(subscription_id = %subscription.subscription_id, transition = %transition))]
    pub async fn apply_to(
        &self,
        subscription: &Subscription,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, AppError> {
        if !transition.is_allowed_from(subscription.status) {
            record_status_transition(transition.as_str(), "skipped");
            return Ok(TransitionOutcome::Skipped);
        }

        let change = self.change_for(subscription, transition, now).await?;
        let Some(result) = self.deps.store.apply_status_change(&change).await? else {
            tracing::info!(
                expected = subscription.status.as_str(),
                "Status changed concurrently, transition skipped"
            );
            record_status_transition(transition.as_str(), "skipped");
            return Ok(TransitionOutcome::Skipped);
        };

        record_status_transition(transition.as_str(), "applied");
        tracing::info!(
            from = subscription.status.as_str(),
            to = result.subscription.status.as_str(),
            periods_changed = result.periods.len(),
            "Subscription status changed"
        );

        self.publish(
            transition.event(SubscriptionEventPayload::from(&result.subscription)),
            now,
        )
        .await;
        self.dispatch_cascade(transition, &result).await;

        Ok(TransitionOutcome::Applied(result.subscription))
    }

    async fn change_for(
        &self,
        subscription: &Subscription,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<StatusChange, AppError> {
        let mut change = StatusChange::new(
            subscription.subscription_id,
            vec![subscription.status],
            transition.target(),
        );

        match transition {
            Transition::Activate => {
                change.activated_at = Stamp::Set(now);
            }
            Transition::Cancel => {
                change.canceled_at = Stamp::Set(now);
                change.periods = PeriodCascade::CancelPending { after: Some(now) };
            }
            Transition::Uncancel => {
                change.canceled_at = Stamp::Clear;
                change.periods = PeriodCascade::Reinstate { after: now };
            }
            Transition::Suspend => {
                change.suspended_at = Stamp::Set(now);
                change.periods = PeriodCascade::CancelPending { after: Some(now) };
            }
            Transition::Reactivate => {
                change.canceled_at = Stamp::Clear;
                change.suspended_at = Stamp::Clear;
                change.deactivated_at = Stamp::Clear;
                // A fresh period replaces whatever was cancelled; reinstating
                // those as well would overlap it.
                if subscription.current_period_id.is_none() {
                    change.start_period = Some(self.fresh_period(subscription, now).await?);
                } else {
                    change.periods = PeriodCascade::Reinstate { after: now };
                }
            }
            Transition::Deactivate => {
                change.deactivated_at = Stamp::Set(now);
                change.clear_current_period = true;
                change.periods = PeriodCascade::CancelPending { after: None };
            }
        }

        Ok(change)
    }

    async fn fresh_period(
        &self,
        subscription: &Subscription,
        now: DateTime<Utc>,
    ) -> Result<NewPeriod, AppError> {
        let plan = self
            .deps
            .store
            .get_plan_for_offer(subscription.offer_id)
            .await?
            .ok_or_else(|| {
                AppError::Conflict(anyhow::anyhow!(
                    "Offer {} has no plan to start a period with",
                    subscription.offer_id
                ))
            })?;

        Ok(NewPeriod {
            subscription_id: subscription.subscription_id,
            offer_id: subscription.offer_id,
            starts_at: now,
            ends_at: plan.period_end(now)?,
        })
    }

    async fn dispatch_cascade(&self, transition: Transition, result: &StatusChangeResult) {
        let subscription = &result.subscription;

        if transition == Transition::Deactivate {
            self.deps
                .orders
                .dispatch(OrderCommand::DeactivatePlan {
                    user_id: subscription.user_id,
                    subscription_id: subscription.subscription_id,
                })
                .await;
        }

        for period in &result.periods {
            match period.status {
                PeriodStatus::Cancelled => self.abort_orders(period).await,
                PeriodStatus::Pending => {
                    self.deps
                        .orders
                        .dispatch(OrderCommand::RenewPlan {
                            user_id: subscription.user_id,
                            offer_id: period.offer_id,
                            subscription_id: subscription.subscription_id,
                            period_id: period.period_id,
                        })
                        .await
                }
                _ => {}
            }
        }
    }

    async fn abort_orders(&self, period: &SubscriptionPeriod) {
        let orders = match self.deps.store.list_orders_for_period(period.period_id).await {
            Ok(orders) => orders,
            Err(e) => {
                tracing::error!(period_id = %period.period_id, error = %e, "Failed to list orders to abort");
                return;
            }
        };

        for order in orders {
            self.deps
                .orders
                .dispatch(OrderCommand::AbortIfActive {
                    order_id: order.order_id,
                })
                .await;
        }
    }

    async fn publish(&self, event: SubscriptionEvent, now: DateTime<Utc>) {
        self.deps.events.publish(EventEnvelope::new(event, now)).await;
    }

    async fn load(&self, subscription_id: Uuid) -> Result<Subscription, AppError> {
        self.deps
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Subscription not found")))
    }
}
