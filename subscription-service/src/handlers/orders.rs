use crate::engine::CompletionOutcome;
use crate::models::OrderStatus;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use service_core::error::AppError;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct OrderCompletionRequest {
    pub status: OrderStatus,
}

/// Callback from the order workflow when an order changes status.
#[tracing::instrument(skip(state))]
pub async fn order_completion(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<OrderCompletionRequest>,
) -> Result<Json<Value>, AppError> {
    let outcome = state
        .completion
        .handle(order_id, request.status, state.clock.now())
        .await?;

    Ok(Json(match outcome {
        CompletionOutcome::PeriodUpdated {
            period,
            subscription_activated,
        } => json!({
            "outcome": "period_updated",
            "period": period,
            "subscription_activated": subscription_activated,
        }),
        CompletionOutcome::Ignored => json!({ "outcome": "ignored" }),
    }))
}
