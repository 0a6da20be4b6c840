//! Telco provider client: per-line usage counters and line configuration.

use crate::models::{TelcoConfig, TelcoUsage};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use service_core::error::AppError;
use service_core::observability::TracedClientExt;
use std::time::Duration;
use uuid::Uuid;

#[async_trait]
pub trait TelcoProvider: Send + Sync {
    /// Usage for a root subscription and its child lines.
    async fn get_subscription_usage(
        &self,
        subscription_id: Uuid,
        children: &[Uuid],
    ) -> Result<Vec<TelcoUsage>, AppError>;

    /// Line configuration for a root subscription and its child lines.
    async fn get_subscription_config(
        &self,
        subscription_id: Uuid,
        children: &[Uuid],
    ) -> Result<Vec<TelcoConfig>, AppError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FamilyRequest<'a> {
    subscription_id: Uuid,
    children: &'a [Uuid],
}

/// HTTP client for the telco provider gateway.
#[derive(Clone)]
pub struct HttpTelcoProvider {
    client: Client,
    base_url: String,
}

impl HttpTelcoProvider {
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

    async fn post_family<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        subscription_id: Uuid,
        children: &[Uuid],
    ) -> Result<T, AppError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .traced_post(&url)
            .json(&FamilyRequest {
                subscription_id,
                children,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, path, "Telco provider call failed");
            return Err(AppError::BadGateway(format!(
                "telco provider {} returned {}",
                path, status
            )));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl TelcoProvider for HttpTelcoProvider {
    #[tracing::instrument(skip(self, children), fields(children = children.len()))]
    async fn get_subscription_usage(
        &self,
        subscription_id: Uuid,
        children: &[Uuid],
    ) -> Result<Vec<TelcoUsage>, AppError> {
        self.post_family("/subscriptions/usage", subscription_id, children)
            .await
    }

    #[tracing::instrument(skip(self, children), fields(children = children.len()))]
    async fn get_subscription_config(
        &self,
        subscription_id: Uuid,
        children: &[Uuid],
    ) -> Result<Vec<TelcoConfig>, AppError> {
        self.post_family("/subscriptions/config", subscription_id, children)
            .await
    }
}
