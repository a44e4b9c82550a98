// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use bytes::Bytes;
use hyper::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

use crate::agent_data::AgentData;
use crate::config::Config;
use crate::error::RelayError;
use crate::http_utils::build_client;
use crate::transport::TransportHealth;

const INTAKE_V2_EVENTS_PATH: &str = "intake/v2/events";

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("Request to APM server timed out: {0}")]
    Timeout(String),
    #[error("Network error sending to APM server: {0}")]
    Network(String),
    #[error("APM server responded with status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl From<reqwest::Error> for ForwardError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ForwardError::Timeout(e.to_string())
        } else {
            ForwardError::Network(e.to_string())
        }
    }
}

/// A single delivery attempt of one payload. Implementations must not retry.
#[async_trait]
pub trait Forwarder {
    async fn forward(&self, data: &AgentData) -> Result<(), ForwardError>;
}

/// Response of the APM server root endpoint, relayed by the intake info route.
#[derive(Debug)]
pub struct ServerInfo {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
}

pub struct ApmServerForwarder {
    config: Arc<Config>,
    client: reqwest::Client,
    health: Arc<TransportHealth>,
    intake_url: String,
}

impl ApmServerForwarder {
    pub fn new(config: Arc<Config>, health: Arc<TransportHealth>) -> Result<Self, RelayError> {
        let client = build_client(config.https_proxy.as_deref(), config.forwarder_timeout)
            .map_err(|e| RelayError::HttpClient(e.to_string()))?;
        let intake_url = format!("{}{INTAKE_V2_EVENTS_PATH}", config.apm_server_url);
        Ok(ApmServerForwarder {
            config,
            client,
            health,
            intake_url,
        })
    }

    pub fn health(&self) -> &Arc<TransportHealth> {
        &self.health
    }

    /// The API key takes precedence over the secret token when both are configured.
    fn authorization(&self) -> Option<String> {
        if let Some(api_key) = self.config.api_key.as_deref() {
            Some(format!("ApiKey {api_key}"))
        } else {
            self.config
                .secret_token
                .as_deref()
                .map(|token| format!("Bearer {token}"))
        }
    }

    fn create_request(&self, data: &AgentData) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(&self.intake_url)
            .timeout(self.config.forwarder_timeout)
            .header(CONTENT_TYPE, data.content_type())
            .body(data.data().clone());
        if let Some(encoding) = data.content_encoding() {
            request = request.header(CONTENT_ENCODING, encoding);
        }
        if let Some(auth) = self.authorization() {
            request = request.header(AUTHORIZATION, auth);
        }
        request
    }

    async fn send(&self, data: &AgentData) -> Result<(), ForwardError> {
        let time = Instant::now();
        let response = self.create_request(data).send().await?;
        let elapsed = time.elapsed();

        let status = response.status();
        if status.is_success() {
            debug!(
                "Successfully sent {} bytes of agent data in {} ms",
                data.len(),
                elapsed.as_millis()
            );
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(ForwardError::Status { status, body })
    }

    /// Fetches the APM server root endpoint. Diagnostic only, so transport health is left alone.
    pub async fn server_info(&self) -> Result<ServerInfo, ForwardError> {
        let mut request = self
            .client
            .get(&self.config.apm_server_url)
            .timeout(self.config.forwarder_timeout);
        if let Some(auth) = self.authorization() {
            request = request.header(AUTHORIZATION, auth);
        }
        let response = request.send().await?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;
        Ok(ServerInfo {
            status,
            content_type,
            body,
        })
    }
}

#[async_trait]
impl Forwarder for ApmServerForwarder {
    async fn forward(&self, data: &AgentData) -> Result<(), ForwardError> {
        let result = self.send(data).await;
        match &result {
            Ok(()) => self.health.record_success(),
            Err(e) => {
                error!("Failed to forward agent data: {e}");
                self.health.record_failure();
            }
        }
        result
    }
}
