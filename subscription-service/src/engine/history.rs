//! Periodic usage history snapshots of root subscriptions and their lines.

use crate::engine::TickReport;
use crate::models::{usage_with_increments, Subscription, SubscriptionHistory, TelcoUsage};
use crate::services::metrics::{record_error, record_history_snapshot, record_invariant_violation};
use crate::services::{SubscriptionStore, TelcoProvider};
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub struct HistorySnapshotter {
    store: Arc<dyn SubscriptionStore>,
    telco: Arc<dyn TelcoProvider>,
    batch_size: i64,
    window: chrono::Duration,
}

impl HistorySnapshotter {
    /// `window` is the tracking interval minus the allowed drift.
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        telco: Arc<dyn TelcoProvider>,
        batch_size: i64,
        window: Duration,
    ) -> Result<Self, AppError> {
        let window = chrono::Duration::from_std(window).map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("History window out of range: {}", e))
        })?;

        Ok(Self {
            store,
            telco,
            batch_size,
            window,
        })
    }

    #[tracing::instrument(name = "history_snapshotter", skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, AppError> {
        let cutoff = now - self.window;
        let roots = self
            .store
            .find_subscriptions_due_for_history(cutoff, self.batch_size)
            .await?;

        let mut report = TickReport {
            selected: roots.len(),
            ..Default::default()
        };

        for root in &roots {
            match self.snapshot(root, now, cutoff).await {
                Ok(rows) => {
                    report.changed += 1;
                    record_history_snapshot("recorded");
                    self.enrich(root, &rows, now).await;
                }
                Err(AppError::InvariantViolation(e)) => {
                    report.failed += 1;
                    record_history_snapshot("rolled_back");
                    record_invariant_violation("multiple_sub_history");
                    tracing::error!(
                        subscription_id = %root.subscription_id,
                        error = %e,
                        "History snapshot rolled back"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    record_history_snapshot("failed");
                    record_error(e.kind(), "history_snapshot");
                    tracing::error!(
                        subscription_id = %root.subscription_id,
                        error = %e,
                        "History snapshot failed"
                    );
                }
            }
        }

        Ok(report)
    }

    async fn snapshot(
        &self,
        root: &Subscription,
        now: DateTime<Utc>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SubscriptionHistory>, AppError> {
        let children = self
            .store
            .list_child_subscriptions(root.subscription_id)
            .await?;
        let rows = self
            .store
            .insert_history_snapshot(root, &children, now, cutoff)
            .await?;

        tracing::info!(
            subscription_id = %root.subscription_id,
            rows = rows.len(),
            "History snapshot recorded"
        );
        Ok(rows)
    }

    /// Attach provider config and usage to freshly inserted rows. Failures are
    /// logged; the snapshot itself stays.
    async fn enrich(&self, root: &Subscription, rows: &[SubscriptionHistory], now: DateTime<Utc>) {
        let children: Vec<Uuid> = rows
            .iter()
            .map(|r| r.subscription_id)
            .filter(|id| *id != root.subscription_id)
            .collect();

        match self
            .telco
            .get_subscription_config(root.subscription_id, &children)
            .await
        {
            Ok(configs) => {
                for config in configs {
                    let Some(row) = rows.iter().find(|r| r.subscription_id == config.subscription_id)
                    else {
                        continue;
                    };
                    if let Err(e) = self
                        .store
                        .attach_history_config(row.history_id, &config.config)
                        .await
                    {
                        tracing::warn!(history_id = %row.history_id, error = %e, "Failed to attach config");
                    }
                }
            }
            Err(e) => tracing::warn!(
                subscription_id = %root.subscription_id,
                error = %e,
                "Telco config unavailable"
            ),
        }

        let usage = match self
            .telco
            .get_subscription_usage(root.subscription_id, &children)
            .await
        {
            Ok(usage) => usage,
            Err(e) => {
                tracing::warn!(
                    subscription_id = %root.subscription_id,
                    error = %e,
                    "Telco usage unavailable"
                );
                return;
            }
        };

        for row in rows {
            let current: Vec<TelcoUsage> = usage
                .iter()
                .filter(|u| u.subscription_id == row.subscription_id)
                .cloned()
                .collect();
            if current.is_empty() {
                continue;
            }

            let result = async {
                let previous = self.store.previous_usage(row.subscription_id, now).await?;
                let rows = usage_with_increments(row.history_id, &current, &previous);
                self.store.insert_history_usage(&rows).await
            }
            .await;

            if let Err(e) = result {
                tracing::warn!(
                    subscription_id = %row.subscription_id,
                    history_id = %row.history_id,
                    error = %e,
                    "Failed to record usage"
                );
            }
        }
    }
}
