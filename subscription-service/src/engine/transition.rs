//! Period boundary handling: move to the next period, or deactivate when
//! there is none.

use crate::engine::{EngineDeps, StatusEngine, TickReport, Transition, TransitionOutcome};
use crate::models::Subscription;
use crate::services::metrics::record_error;
use chrono::{DateTime, Utc};
use service_core::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    Advanced,
    Deactivated,
    Skipped,
}

pub struct PeriodTransitionEngine {
    deps: EngineDeps,
    status: StatusEngine,
    batch_size: i64,
}

impl PeriodTransitionEngine {
    pub fn new(deps: EngineDeps, status: StatusEngine, batch_size: i64) -> Self {
        Self {
            deps,
            status,
            batch_size,
        }
    }

    #[tracing::instrument(name = "period_transition", skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, AppError> {
        let subscriptions = self
            .deps
            .store
            .find_subscriptions_with_ended_period(now, self.batch_size)
            .await?;

        let mut report = TickReport {
            selected: subscriptions.len(),
            ..Default::default()
        };

        for subscription in &subscriptions {
            match self.cross_boundary(subscription, now).await {
                Ok(Boundary::Advanced) | Ok(Boundary::Deactivated) => report.changed += 1,
                Ok(Boundary::Skipped) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    record_error(e.kind(), "period_transition");
                    tracing::error!(
                        subscription_id = %subscription.subscription_id,
                        error = %e,
                        "Period transition failed"
                    );
                }
            }
        }

        Ok(report)
    }

    async fn cross_boundary(
        &self,
        subscription: &Subscription,
        now: DateTime<Utc>,
    ) -> Result<Boundary, AppError> {
        let Some(ended_period_id) = subscription.current_period_id else {
            return Ok(Boundary::Skipped);
        };

        let next = self
            .deps
            .store
            .find_period_at(subscription.subscription_id, now)
            .await?;

        match next {
            Some(next) if next.period_id != ended_period_id => {
                let advanced = self
                    .deps
                    .store
                    .advance_current_period(subscription.subscription_id, ended_period_id, &next)
                    .await?;
                if advanced {
                    tracing::info!(
                        subscription_id = %subscription.subscription_id,
                        from_period_id = %ended_period_id,
                        to_period_id = %next.period_id,
                        offer_id = %next.offer_id,
                        "Current period advanced"
                    );
                    Ok(Boundary::Advanced)
                } else {
                    Ok(Boundary::Skipped)
                }
            }
            Some(_) => Ok(Boundary::Skipped),
            None => {
                tracing::info!(
                    subscription_id = %subscription.subscription_id,
                    period_id = %ended_period_id,
                    "No period follows the ended one, deactivating"
                );
                match self
                    .status
                    .apply_to(subscription, Transition::Deactivate, now)
                    .await?
                {
                    TransitionOutcome::Applied(_) => Ok(Boundary::Deactivated),
                    TransitionOutcome::Skipped => Ok(Boundary::Skipped),
                }
            }
        }
    }
}
