//! Period generation: keeps one future period queued per auto-renewing subscription.

use crate::engine::{EngineDeps, TickReport};
use crate::models::{NewPeriod, Subscription, SubscriptionPeriod};
use crate::services::metrics::{record_error, record_invariant_violation, record_period_generated};
use crate::services::OrderCommand;
use chrono::{DateTime, Utc};
use service_core::error::AppError;

pub struct PeriodGenerator {
    deps: EngineDeps,
    batch_size: i64,
}

impl PeriodGenerator {
    pub fn new(deps: EngineDeps, batch_size: i64) -> Self {
        Self { deps, batch_size }
    }

    #[tracing::instrument(name = "period_generator", skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, AppError> {
        let subscriptions = self
            .deps
            .store
            .find_subscriptions_needing_period(now, self.batch_size)
            .await?;

        let mut report = TickReport {
            selected: subscriptions.len(),
            ..Default::default()
        };

        for subscription in &subscriptions {
            match self.generate_for(subscription).await {
                Ok(Some(period)) => {
                    report.changed += 1;
                    record_period_generated("inserted");
                    self.deps
                        .orders
                        .dispatch(OrderCommand::RenewPlan {
                            user_id: subscription.user_id,
                            offer_id: period.offer_id,
                            subscription_id: subscription.subscription_id,
                            period_id: period.period_id,
                        })
                        .await;
                }
                Ok(None) => {
                    report.skipped += 1;
                    record_period_generated("already_exists");
                }
                Err(e) => {
                    report.failed += 1;
                    record_period_generated("failed");
                    if let AppError::InvariantViolation(_) = e {
                        record_invariant_violation("period_generation");
                    }
                    record_error(e.kind(), "generate_period");
                    tracing::error!(
                        subscription_id = %subscription.subscription_id,
                        error = %e,
                        "Period generation failed"
                    );
                }
            }
        }

        Ok(report)
    }

    /// Insert the period following the latest one. `None` when another writer
    /// inserted it first.
    async fn generate_for(
        &self,
        subscription: &Subscription,
    ) -> Result<Option<SubscriptionPeriod>, AppError> {
        let plan = self
            .deps
            .store
            .get_plan_for_offer(subscription.offer_id)
            .await?
            .ok_or_else(|| {
                AppError::InternalError(anyhow::anyhow!(
                    "Offer {} has no plan",
                    subscription.offer_id
                ))
            })?;

        let anchor = self
            .deps
            .store
            .latest_period(subscription.subscription_id)
            .await?
            .ok_or_else(|| {
                AppError::InvariantViolation(anyhow::anyhow!(
                    "Active subscription {} has no periods",
                    subscription.subscription_id
                ))
            })?;

        let next = NewPeriod::following(&anchor, subscription.offer_id, &plan)?;
        let inserted = self.deps.store.insert_next_period(&next).await?;

        match &inserted {
            Some(period) => tracing::info!(
                subscription_id = %subscription.subscription_id,
                period_id = %period.period_id,
                starts_at = %period.starts_at,
                ends_at = %period.ends_at,
                "Period generated"
            ),
            None => tracing::debug!(
                subscription_id = %subscription.subscription_id,
                starts_at = %next.starts_at,
                "Period already generated"
            ),
        }

        Ok(inserted)
    }
}
