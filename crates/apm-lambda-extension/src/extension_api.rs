// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Minimal client for the Lambda Extensions API.

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use serde_json::json;

const EXTENSION_NAME_HEADER: &str = "Lambda-Extension-Name";
const EXTENSION_ID_HEADER: &str = "Lambda-Extension-Identifier";
const EXTENSION_API_VERSION: &str = "2020-01-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Invoke,
    Shutdown,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NextEventResponse {
    pub event_type: EventType,
    pub deadline_ms: i64,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub invoked_function_arn: String,
    #[serde(default)]
    pub shutdown_reason: Option<String>,
}

pub struct ExtensionClient {
    client: reqwest::Client,
    base_url: String,
    extension_id: String,
}

impl ExtensionClient {
    /// Registers for `INVOKE` and `SHUTDOWN` events. `runtime_api` is the
    /// `AWS_LAMBDA_RUNTIME_API` host and port.
    pub async fn register(runtime_api: &str, extension_name: &str) -> anyhow::Result<Self> {
        // next-event long-polls, so no request timeout here
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .build()
            .context("building extensions API client")?;
        let base_url = format!("http://{runtime_api}/{EXTENSION_API_VERSION}/extension");

        let response = client
            .post(format!("{base_url}/register"))
            .header(EXTENSION_NAME_HEADER, extension_name)
            .json(&json!({ "events": ["INVOKE", "SHUTDOWN"] }))
            .send()
            .await
            .context("registering extension")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("extension registration failed with {status}: {body}"));
        }
        let extension_id = response
            .headers()
            .get(EXTENSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("registration response is missing {EXTENSION_ID_HEADER}"))?;

        Ok(ExtensionClient {
            client,
            base_url,
            extension_id,
        })
    }

    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    /// Blocks until Lambda delivers the next event.
    pub async fn next_event(&self) -> anyhow::Result<NextEventResponse> {
        let response = self
            .client
            .get(format!("{}/event/next", self.base_url))
            .header(EXTENSION_ID_HEADER, &self.extension_id)
            .send()
            .await
            .context("requesting next event")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("next event request failed with {status}: {body}"));
        }
        response
            .json::<NextEventResponse>()
            .await
            .context("decoding next event")
    }
}

/// Formats any serializable value as indented JSON, or an empty string if it can't be.
pub fn pretty_print<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}
