use crate::engine::{RerunOutcome, Transition};
use crate::models::{
    CreateSubscription, HistoryUsage, Subscription, SubscriptionHistory, SubscriptionPeriod,
};
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateSubscriptionRequest {
    pub user_id: Uuid,
    pub offer_id: Uuid,
    pub parent_id: Option<Uuid>,
    #[validate(length(min = 18, max = 22, message = "ICCID must be 18 to 22 characters"))]
    pub sim_iccid: Option<String>,
    #[validate(length(min = 8, max = 15, message = "MSISDN must be 8 to 15 digits"))]
    pub phone_number_msisdn: Option<String>,
    /// Defaults to the time of the request.
    pub starts_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSubscriptionResponse {
    pub subscription: Subscription,
    pub period: SubscriptionPeriod,
}

#[derive(Debug, Deserialize, Validate)]
pub struct HistoryQuery {
    #[validate(range(min = 1, max = 100))]
    #[serde(default = "default_history_limit")]
    pub limit: i64,
}

fn default_history_limit() -> i64 {
    20
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub history: SubscriptionHistory,
    pub usage: Vec<HistoryUsage>,
}

#[tracing::instrument(skip(state, request))]
pub async fn create_subscription(
    State(state): State<AppState>,
    Json(request): Json<CreateSubscriptionRequest>,
) -> Result<(StatusCode, Json<CreateSubscriptionResponse>), AppError> {
    request.validate()?;

    let now = state.clock.now();
    let input = CreateSubscription {
        user_id: request.user_id,
        offer_id: request.offer_id,
        parent_id: request.parent_id,
        sim_iccid: request.sim_iccid,
        phone_number_msisdn: request.phone_number_msisdn,
        starts_at: request.starts_at.unwrap_or(now),
    };

    let (subscription, period) = state.status.create(&input, now).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateSubscriptionResponse {
            subscription,
            period,
        }),
    ))
}

#[tracing::instrument(skip(state))]
pub async fn get_subscription(
    State(state): State<AppState>,
    Path(subscription_id): Path<Uuid>,
) -> Result<Json<Subscription>, AppError> {
    let subscription = state
        .store
        .get_subscription(subscription_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Subscription not found")))?;

    Ok(Json(subscription))
}

#[tracing::instrument(skip(state))]
pub async fn list_periods(
    State(state): State<AppState>,
    Path(subscription_id): Path<Uuid>,
) -> Result<Json<Vec<SubscriptionPeriod>>, AppError> {
    state
        .store
        .get_subscription(subscription_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Subscription not found")))?;

    Ok(Json(state.store.list_periods(subscription_id).await?))
}

#[tracing::instrument(skip(state))]
pub async fn list_history(
    State(state): State<AppState>,
    Path(subscription_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryEntry>>, AppError> {
    query.validate()?;

    state
        .store
        .get_subscription(subscription_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Subscription not found")))?;

    let rows = state.store.list_history(subscription_id, query.limit).await?;
    let mut entries = Vec::with_capacity(rows.len());
    for history in rows {
        let usage = state.store.list_history_usage(history.history_id).await?;
        entries.push(HistoryEntry { history, usage });
    }

    Ok(Json(entries))
}

async fn transition(
    state: &AppState,
    subscription_id: Uuid,
    transition: Transition,
) -> Result<Json<Subscription>, AppError> {
    tracing::info!(subscription_id = %subscription_id, transition = %transition, "Status change requested");
    let subscription = state
        .status
        .request(subscription_id, transition, state.clock.now())
        .await?;
    Ok(Json(subscription))
}

pub async fn activate(
    State(state): State<AppState>,
    Path(subscription_id): Path<Uuid>,
) -> Result<Json<Subscription>, AppError> {
    transition(&state, subscription_id, Transition::Activate).await
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(subscription_id): Path<Uuid>,
) -> Result<Json<Subscription>, AppError> {
    transition(&state, subscription_id, Transition::Cancel).await
}

pub async fn uncancel(
    State(state): State<AppState>,
    Path(subscription_id): Path<Uuid>,
) -> Result<Json<Subscription>, AppError> {
    transition(&state, subscription_id, Transition::Uncancel).await
}

pub async fn suspend(
    State(state): State<AppState>,
    Path(subscription_id): Path<Uuid>,
) -> Result<Json<Subscription>, AppError> {
    transition(&state, subscription_id, Transition::Suspend).await
}

pub async fn reactivate(
    State(state): State<AppState>,
    Path(subscription_id): Path<Uuid>,
) -> Result<Json<Subscription>, AppError> {
    transition(&state, subscription_id, Transition::Reactivate).await
}

pub async fn deactivate(
    State(state): State<AppState>,
    Path(subscription_id): Path<Uuid>,
) -> Result<Json<Subscription>, AppError> {
    transition(&state, subscription_id, Transition::Deactivate).await
}

#[tracing::instrument(skip(state))]
pub async fn rerun_period(
    State(state): State<AppState>,
    Path((subscription_id, period_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<RerunOutcome>, AppError> {
    Ok(Json(state.rerun.rerun(subscription_id, period_id).await?))
}
