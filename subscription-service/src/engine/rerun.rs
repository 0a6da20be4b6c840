//! Operator recovery for a period whose order got lost or failed.

use crate::engine::EngineDeps;
use crate::models::{PeriodStatus, SubscriptionPeriod};
use crate::services::OrderCommand;
use serde::Serialize;
use service_core::error::AppError;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RerunOutcome {
    /// The latest order was still in flight and has been retried.
    Retried { order_id: Uuid },
    /// A new renewal order was created and the period reset to PENDING.
    Reordered {
        order_id: Uuid,
        period: SubscriptionPeriod,
    },
}

pub struct PeriodRerun {
    deps: EngineDeps,
}

impl PeriodRerun {
    pub fn new(deps: EngineDeps) -> Self {
        Self { deps }
    }

    #[tracing::instrument(skip(self))]
    pub async fn rerun(
        &self,
        subscription_id: Uuid,
        period_id: Uuid,
    ) -> Result<RerunOutcome, AppError> {
        let subscription = self
            .deps
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Subscription not found")))?;

        let period = self
            .deps
            .store
            .get_period(period_id)
            .await?
            .filter(|p| p.subscription_id == subscription_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Period not found")))?;

        let latest = self
            .deps
            .store
            .list_orders_for_period(period_id)
            .await?
            .into_iter()
            .next();

        if let Some(link) = latest {
            let order = self.deps.orders.get_order(link.order_id).await?;
            if !order.status.is_final() {
                self.deps.orders.retry_order(link.order_id).await?;
                tracing::info!(order_id = %link.order_id, "Order retried");
                return Ok(RerunOutcome::Retried {
                    order_id: link.order_id,
                });
            }
        }

        let period = self
            .deps
            .store
            .update_period_status(period_id, &[], PeriodStatus::Pending)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Period not found")))?;

        let order = self
            .deps
            .orders
            .execute(OrderCommand::RenewPlan {
                user_id: subscription.user_id,
                offer_id: period.offer_id,
                subscription_id,
                period_id,
            })
            .await?
            .ok_or_else(|| {
                AppError::Conflict(anyhow::anyhow!(
                    "Period {} changed before it could be ordered",
                    period_id
                ))
            })?;

        tracing::info!(order_id = %order.order_id, period_id = %period_id, "Period reordered");

        Ok(RerunOutcome::Reordered {
            order_id: order.order_id,
            period,
        })
    }
}
