//! Order workflow callbacks: reflect order progress on the ordered period.

use crate::engine::{StatusEngine, Transition, TransitionOutcome};
use crate::models::{OrderKind, OrderStatus, PeriodStatus, SubscriptionPeriod, SubscriptionStatus};
use crate::services::SubscriptionStore;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// The period moved to a new status.
    PeriodUpdated {
        period: SubscriptionPeriod,
        subscription_activated: bool,
    },
    /// Nothing to change: the period already moved on, or the order is not a renewal.
    Ignored,
}

pub struct OrderCompletion {
    store: Arc<dyn SubscriptionStore>,
    status: StatusEngine,
}

impl OrderCompletion {
    pub fn new(store: Arc<dyn SubscriptionStore>, status: StatusEngine) -> Self {
        Self { store, status }
    }

    #[tracing::instrument(skip(self))]
    pub async fn handle(
        &self,
        order_id: Uuid,
        order_status: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<CompletionOutcome, AppError> {
        let link = self
            .store
            .get_order_link(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Order not found")))?;

        let period_id = match (link.kind, link.period_id) {
            (OrderKind::Renewal, Some(period_id)) => period_id,
            _ => {
                tracing::info!(order_id = %order_id, kind = link.kind.as_str(), "Order completion ignored");
                return Ok(CompletionOutcome::Ignored);
            }
        };

        let (expected, next): (&[PeriodStatus], PeriodStatus) = match order_status {
            OrderStatus::Processing => (&[PeriodStatus::Pending], PeriodStatus::Processing),
            OrderStatus::Succeeded => (
                &[PeriodStatus::Pending, PeriodStatus::Processing],
                PeriodStatus::Done,
            ),
            OrderStatus::Failed => (
                &[PeriodStatus::Pending, PeriodStatus::Processing],
                PeriodStatus::Failed,
            ),
            OrderStatus::Pending | OrderStatus::Aborted => return Ok(CompletionOutcome::Ignored),
        };

        let Some(period) = self
            .store
            .update_period_status(period_id, expected, next)
            .await?
        else {
            tracing::info!(period_id = %period_id, "Period already moved on");
            return Ok(CompletionOutcome::Ignored);
        };

        tracing::info!(
            order_id = %order_id,
            period_id = %period_id,
            status = period.status.as_str(),
            "Period status updated from order"
        );

        let mut subscription_activated = false;
        if period.status == PeriodStatus::Done {
            subscription_activated = self
                .activate_if_first(link.subscription_id, period_id, now)
                .await?;
        }

        Ok(CompletionOutcome::PeriodUpdated {
            period,
            subscription_activated,
        })
    }

    /// A PENDING subscription becomes ACTIVE once its current period is paid for.
    async fn activate_if_first(
        &self,
        subscription_id: Uuid,
        period_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let Some(subscription) = self.store.get_subscription(subscription_id).await? else {
            return Ok(false);
        };
        if subscription.status != SubscriptionStatus::Pending
            || subscription.current_period_id != Some(period_id)
        {
            return Ok(false);
        }

        let outcome = self
            .status
            .apply_to(&subscription, Transition::Activate, now)
            .await?;
        Ok(matches!(outcome, TransitionOutcome::Applied(_)))
    }
}
