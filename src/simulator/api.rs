//! Simulator control endpoint

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SimulatorApiConfig;
use crate::error::EngineError;
use crate::models::SimulatorStatus;

/// Who is asking, and on behalf of which session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorRequest {
    pub session_id: Option<String>,
    pub device_id: String,
    pub access_token: Option<String>,
}

#[async_trait]
pub trait SimulatorApi: Send + Sync {
    /// Returns the status the server reports after accepting the call
    async fn start(&self, request: &SimulatorRequest) -> Result<SimulatorStatus, EngineError>;

    async fn stop(&self, request: &SimulatorRequest) -> Result<SimulatorStatus, EngineError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ControlBody<'a> {
    session_id: Option<&'a str>,
    device_id: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct ControlResponse {
    #[serde(default)]
    status: Option<SimulatorStatus>,
}

/// `POST {base}/simulator/{start,stop}` with a bearer token
pub struct HttpSimulatorApi {
    client: Client,
    base_url: String,
}

impl HttpSimulatorApi {
    pub fn new(config: &SimulatorApiConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn call(
        &self,
        action: &str,
        request: &SimulatorRequest,
    ) -> Result<SimulatorStatus, EngineError> {
        let token = request
            .access_token
            .as_deref()
            .ok_or_else(|| EngineError::Identity("no access token".to_string()))?;
        let url = format!("{}/simulator/{}", self.base_url, action);

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&ControlBody {
                session_id: request.session_id.as_deref(),
                device_id: &request.device_id,
            })
            .send()
            .await
            .map_err(|e| EngineError::Simulator(format!("{action} request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(EngineError::Identity(format!("{action} rejected: {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Simulator(format!(
                "{action} failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        // Empty bodies are allowed; the caller falls back to the transitional status
        let bytes = response
            .bytes()
            .await
            .map_err(|e| EngineError::Simulator(format!("{action} body read failed: {e}")))?;
        let parsed: ControlResponse = if bytes.is_empty() {
            ControlResponse::default()
        } else {
            serde_json::from_slice(&bytes)
                .map_err(|e| EngineError::Protocol(format!("{action} response: {e}")))?
        };

        debug!(action, status = ?parsed.status, "simulator_api_ok");
        Ok(parsed.status.unwrap_or_default())
    }
}

#[async_trait]
impl SimulatorApi for HttpSimulatorApi {
    async fn start(&self, request: &SimulatorRequest) -> Result<SimulatorStatus, EngineError> {
        self.call("start", request).await
    }

    async fn stop(&self, request: &SimulatorRequest) -> Result<SimulatorStatus, EngineError> {
        self.call("stop", request).await
    }
}
