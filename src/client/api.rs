//! Agent HTTP Client
//!
//! 封装与部署 agent 的 HTTP 交互，复用连接池

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::PollerConfig;
use crate::domain::deploy::{DeploymentStatus, PendingCount, SubmitResponse};
use crate::middleware::API_KEY_HEADER;

use super::poller::StatusSource;
use super::ClientError;

/// 部署 agent 客户端
///
/// - 提交部署 (submit)
/// - 待部署数量 (pending_count)
/// - 部署状态 (deployment_status)
#[derive(Clone)]
pub struct DeployApiClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl DeployApiClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    pub fn from_config(config: &PollerConfig) -> Result<Self, ClientError> {
        Self::new(config.server_url.clone(), config.api_key.clone())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// 提交部署
    ///
    /// 400 / 409 的响应体带有拒绝原因，转换为 `ClientError::Rejected`
    pub async fn submit(&self) -> Result<SubmitResponse, ClientError> {
        let url = format!("{}/deploy/submit", self.base_url);
        let response = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let body: SubmitResponse = response.json().await?;
            info!(run_id = ?body.run_id, "Deployment submitted");
            return Ok(body);
        }

        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<SubmitResponse>(&text) {
            Ok(body) if !body.started => Err(ClientError::Rejected {
                status: status.as_u16(),
                stage: body.stage,
                error: body.error.unwrap_or_else(|| status.to_string()),
                run_id: body.run_id,
            }),
            _ => Err(ClientError::Status {
                status: status.as_u16(),
                body: text,
            }),
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).query(query).send().await?;
        debug!(url = %url, status = %response.status(), "Agent response");
        Ok(check_status(response).await?.json().await?)
    }
}

async fn check_status(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(ClientError::Status {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl StatusSource for DeployApiClient {
    async fn pending_count(&self) -> Result<u64, ClientError> {
        let body: PendingCount = self.get_json("/deploy/pending/count", &[]).await?;
        Ok(body.count)
    }

    async fn deployment_status(&self, run_id: Option<&str>) -> Result<DeploymentStatus, ClientError> {
        match run_id {
            Some(run_id) => self.get_json("/deploy/status", &[("run_id", run_id)]).await,
            None => self.get_json("/deploy/status", &[]).await,
        }
    }
}
