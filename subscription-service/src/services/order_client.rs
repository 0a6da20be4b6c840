//! Order workflow client.
//!
//! The workflow owns the order state machine (billing charge, telco
//! provisioning). This service only creates, aborts and retries orders and
//! reads their status.

use crate::models::{OrderRef, OrderStatus};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use service_core::observability::TracedClientExt;
use std::time::Duration;
use uuid::Uuid;

#[async_trait]
pub trait OrderWorkflow: Send + Sync {
    async fn create_renew_plan(
        &self,
        user_id: Uuid,
        offer_id: Uuid,
        subscription_id: Uuid,
        period_id: Uuid,
    ) -> Result<OrderRef, AppError>;

    async fn create_deactivate_plan(
        &self,
        user_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<OrderRef, AppError>;

    async fn abort(&self, order_id: Uuid) -> Result<(), AppError>;

    async fn retry(&self, order_id: Uuid) -> Result<(), AppError>;

    async fn get_order(&self, order_id: Uuid) -> Result<OrderRef, AppError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RenewPlanRequest {
    user_id: Uuid,
    offer_id: Uuid,
    subscription_id: Uuid,
    subscription_period_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeactivatePlanRequest {
    user_id: Uuid,
    subscription_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: Uuid,
    status: OrderStatus,
}

impl From<OrderResponse> for OrderRef {
    fn from(response: OrderResponse) -> Self {
        OrderRef {
            order_id: response.id,
            status: response.status,
        }
    }
}

/// HTTP client for the order workflow service.
#[derive(Clone)]
pub struct HttpOrderWorkflow {
    client: Client,
    base_url: String,
}

impl HttpOrderWorkflow {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Invalid HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn check(response: Response, operation: &str) -> Result<Response, AppError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        tracing::error!(status = %status, body = %body, operation, "Order workflow call failed");

        if status == reqwest::StatusCode::NOT_FOUND {
            Err(AppError::NotFound(anyhow::anyhow!("Order not found")))
        } else if status.is_server_error() {
            Err(AppError::ServiceUnavailable)
        } else {
            Err(AppError::BadGateway(format!(
                "order workflow {} returned {}",
                operation, status
            )))
        }
    }
}

#[async_trait]
impl OrderWorkflow for HttpOrderWorkflow {
    #[tracing::instrument(skip(self))]
    async fn create_renew_plan(
        &self,
        user_id: Uuid,
        offer_id: Uuid,
        subscription_id: Uuid,
        period_id: Uuid,
    ) -> Result<OrderRef, AppError> {
        let url = format!("{}/orders/renew-plan", self.base_url);
        let request = RenewPlanRequest {
            user_id,
            offer_id,
            subscription_id,
            subscription_period_id: period_id,
        };

        let response = self.client.traced_post(&url).json(&request).send().await?;
        let order: OrderResponse = Self::check(response, "renew-plan").await?.json().await?;

        tracing::info!(order_id = %order.id, "Renewal order created");
        Ok(order.into())
    }

    #[tracing::instrument(skip(self))]
    async fn create_deactivate_plan(
        &self,
        user_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<OrderRef, AppError> {
        let url = format!("{}/orders/deactivate-plan", self.base_url);
        let request = DeactivatePlanRequest {
            user_id,
            subscription_id,
        };

        let response = self.client.traced_post(&url).json(&request).send().await?;
        let order: OrderResponse = Self::check(response, "deactivate-plan").await?.json().await?;

        tracing::info!(order_id = %order.id, "Deactivation order created");
        Ok(order.into())
    }

    #[tracing::instrument(skip(self))]
    async fn abort(&self, order_id: Uuid) -> Result<(), AppError> {
        let url = format!("{}/orders/{}/abort", self.base_url, order_id);
        let response = self.client.traced_post(&url).send().await?;
        Self::check(response, "abort").await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn retry(&self, order_id: Uuid) -> Result<(), AppError> {
        let url = format!("{}/orders/{}/retry", self.base_url, order_id);
        let response = self.client.traced_post(&url).send().await?;
        Self::check(response, "retry").await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn get_order(&self, order_id: Uuid) -> Result<OrderRef, AppError> {
        let url = format!("{}/orders/{}", self.base_url, order_id);
        let response = self.client.traced_get(&url).send().await?;
        let order: OrderResponse = Self::check(response, "get").await?.json().await?;
        Ok(order.into())
    }
}
