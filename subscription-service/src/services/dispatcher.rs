//! Order side effects, dispatched after the local change has committed.
//!
//! Commands run either inline (tests, single-shot tools) or through a bounded
//! queue drained by an `OrderWorker`. Each command is retried with exponential
//! backoff; a command that still fails is logged and left for `rerun`.

use crate::models::{OrderKind, OrderLink, OrderRef, PeriodStatus};
use crate::services::metrics::{record_error, record_order_command};
use crate::services::order_client::OrderWorkflow;
use crate::services::store::SubscriptionStore;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use chrono::Utc;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderCommand {
    RenewPlan {
        user_id: Uuid,
        offer_id: Uuid,
        subscription_id: Uuid,
        period_id: Uuid,
    },
    DeactivatePlan {
        user_id: Uuid,
        subscription_id: Uuid,
    },
    /// Abort the order unless the workflow already finished it.
    AbortIfActive { order_id: Uuid },
}

impl OrderCommand {
    pub fn name(&self) -> &'static str {
        match self {
            OrderCommand::RenewPlan { .. } => "renew_plan",
            OrderCommand::DeactivatePlan { .. } => "deactivate_plan",
            OrderCommand::AbortIfActive { .. } => "abort",
        }
    }
}

fn is_transient(error: &AppError) -> bool {
    matches!(
        error,
        AppError::ServiceUnavailable | AppError::BadGateway(_) | AppError::DatabaseError(_)
    )
}

/// Runs order commands against the workflow and records the orders created.
struct OrderExecutor {
    workflow: Arc<dyn OrderWorkflow>,
    store: Arc<dyn SubscriptionStore>,
    max_elapsed: Duration,
}

impl OrderExecutor {
    /// Renewal orders are only created for periods still PENDING; a period
    /// cancelled while its command sat in the queue is skipped.
    async fn period_awaits_order(&self, period_id: Uuid) -> Result<bool, AppError> {
        match self.store.get_period(period_id).await? {
            Some(period) if period.status == PeriodStatus::Pending => Ok(true),
            Some(period) => {
                tracing::info!(
                    period_id = %period_id,
                    status = period.status.as_str(),
                    "Period no longer pending, renewal order skipped"
                );
                record_order_command("renew_plan", "skipped");
                Ok(false)
            }
            None => {
                tracing::warn!(period_id = %period_id, "Period to order not found");
                record_order_command("renew_plan", "skipped");
                Ok(false)
            }
        }
    }

    /// Abort an order whose period was cancelled between the status check
    /// and the order link being recorded.
    async fn abort_if_cancelled(&self, period_id: Uuid, order_id: Uuid) {
        let cancelled = match self.store.get_period(period_id).await {
            Ok(period) => period.is_some_and(|p| p.status == PeriodStatus::Cancelled),
            Err(e) => {
                tracing::error!(period_id = %period_id, error = %e, "Failed to re-check period");
                return;
            }
        };
        if !cancelled {
            return;
        }

        match self.workflow.abort(order_id).await {
            Ok(()) => {
                tracing::info!(order_id = %order_id, period_id = %period_id, "Order for cancelled period aborted");
                record_order_command("abort", "success");
            }
            Err(e) => {
                record_order_command("abort", "failure");
                record_error(e.kind(), "abort");
                tracing::error!(order_id = %order_id, error = %e, "Failed to abort order for cancelled period");
            }
        }
    }

    async fn execute(&self, command: &OrderCommand) -> Result<Option<OrderRef>, AppError> {
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(self.max_elapsed),
            ..Default::default()
        };

        let result = retry(backoff, || async {
            self.execute_once(command).await.map_err(|e| {
                if is_transient(&e) {
                    tracing::warn!(command = command.name(), error = %e, "Order command failed, retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await;

        match &result {
            Ok(_) => record_order_command(command.name(), "success"),
            Err(e) => {
                record_order_command(command.name(), "failure");
                record_error(e.kind(), command.name());
            }
        }
        result
    }

    async fn execute_once(&self, command: &OrderCommand) -> Result<Option<OrderRef>, AppError> {
        match *command {
            OrderCommand::RenewPlan {
                user_id,
                offer_id,
                subscription_id,
                period_id,
            } => {
                if !self.period_awaits_order(period_id).await? {
                    return Ok(None);
                }
                let order = self
                    .workflow
                    .create_renew_plan(user_id, offer_id, subscription_id, period_id)
                    .await?;
                self.store
                    .record_order(&OrderLink {
                        order_id: order.order_id,
                        subscription_id,
                        period_id: Some(period_id),
                        kind: OrderKind::Renewal,
                        created_utc: Utc::now(),
                    })
                    .await?;
                self.abort_if_cancelled(period_id, order.order_id).await;
                Ok(Some(order))
            }
            OrderCommand::DeactivatePlan {
                user_id,
                subscription_id,
            } => {
                let order = self
                    .workflow
                    .create_deactivate_plan(user_id, subscription_id)
                    .await?;
                self.store
                    .record_order(&OrderLink {
                        order_id: order.order_id,
                        subscription_id,
                        period_id: None,
                        kind: OrderKind::Deactivation,
                        created_utc: Utc::now(),
                    })
                    .await?;
                Ok(Some(order))
            }
            OrderCommand::AbortIfActive { order_id } => {
                let order = match self.workflow.get_order(order_id).await {
                    Ok(order) => order,
                    Err(AppError::NotFound(_)) => {
                        tracing::warn!(order_id = %order_id, "Order to abort not found");
                        return Ok(None);
                    }
                    Err(e) => return Err(e),
                };
                if order.status.is_final() {
                    return Ok(None);
                }
                self.workflow.abort(order_id).await?;
                tracing::info!(order_id = %order_id, "Order aborted");
                Ok(None)
            }
        }
    }
}

enum DispatchMode {
    Inline,
    Queued(mpsc::Sender<OrderCommand>),
}

/// Handle used by the engines to hand off order commands.
#[derive(Clone)]
pub struct OrderDispatcher {
    executor: Arc<OrderExecutor>,
    mode: Arc<DispatchMode>,
}

impl OrderDispatcher {
    /// Commands run to completion inside `dispatch`.
    pub fn inline(
        workflow: Arc<dyn OrderWorkflow>,
        store: Arc<dyn SubscriptionStore>,
        max_elapsed: Duration,
    ) -> Self {
        Self {
            executor: Arc::new(OrderExecutor {
                workflow,
                store,
                max_elapsed,
            }),
            mode: Arc::new(DispatchMode::Inline),
        }
    }

    /// Commands are queued for the returned worker.
    pub fn queued(
        workflow: Arc<dyn OrderWorkflow>,
        store: Arc<dyn SubscriptionStore>,
        max_elapsed: Duration,
        queue_size: usize,
    ) -> (Self, OrderWorker) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let executor = Arc::new(OrderExecutor {
            workflow,
            store,
            max_elapsed,
        });

        let dispatcher = Self {
            executor: executor.clone(),
            mode: Arc::new(DispatchMode::Queued(tx)),
        };
        (dispatcher, OrderWorker { executor, rx })
    }

    /// Hand off a command. Failures are logged, never returned.
    pub async fn dispatch(&self, command: OrderCommand) {
        match self.mode.as_ref() {
            DispatchMode::Inline => {
                if let Err(e) = self.executor.execute(&command).await {
                    tracing::error!(command = command.name(), error = %e, "Order command failed");
                }
            }
            DispatchMode::Queued(tx) => {
                if let Err(e) = tx.try_send(command) {
                    let command = match e {
                        mpsc::error::TrySendError::Full(c) | mpsc::error::TrySendError::Closed(c) => c,
                    };
                    record_order_command(command.name(), "dropped");
                    tracing::error!(command = ?command, "Order queue unavailable, command dropped");
                }
            }
        }
    }

    /// Run a command now and report the outcome to the caller.
    pub async fn execute(&self, command: OrderCommand) -> Result<Option<OrderRef>, AppError> {
        self.executor.execute(&command).await
    }

    /// Current state of an order in the workflow.
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderRef, AppError> {
        self.executor.workflow.get_order(order_id).await
    }

    /// Retry an existing order, with the same backoff as other commands.
    pub async fn retry_order(&self, order_id: Uuid) -> Result<(), AppError> {
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(self.executor.max_elapsed),
            ..Default::default()
        };
        let workflow = &self.executor.workflow;
        let result = retry(backoff, || async {
            workflow.retry(order_id).await.map_err(|e| {
                if is_transient(&e) {
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await;

        record_order_command("retry", if result.is_ok() { "success" } else { "failure" });
        result
    }
}

/// Drains queued order commands one at a time.
pub struct OrderWorker {
    executor: Arc<OrderExecutor>,
    rx: mpsc::Receiver<OrderCommand>,
}

impl OrderWorker {
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!("Order worker started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.drain().await;
                    break;
                }
                command = self.rx.recv() => {
                    match command {
                        Some(command) => {
                            if let Err(e) = self.executor.execute(&command).await {
                                tracing::error!(command = ?command, error = %e, "Order command failed");
                            }
                        }
                        None => {
                            tracing::info!("Order queue closed, worker exiting");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Close the queue and run the commands it already accepted.
    async fn drain(&mut self) {
        self.rx.close();
        let mut drained = 0usize;
        while let Some(command) = self.rx.recv().await {
            if let Err(e) = self.executor.execute(&command).await {
                tracing::error!(command = ?command, error = %e, "Order command failed during shutdown");
            }
            drained += 1;
        }
        tracing::info!(drained, "Order worker shut down");
    }
}
