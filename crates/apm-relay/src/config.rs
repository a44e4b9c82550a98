// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::warn;

use crate::error::RelayError;

const DEFAULT_RECEIVER_HOST: &str = "127.0.0.1";
const DEFAULT_RECEIVER_PORT: u16 = 8200;
const DEFAULT_RECEIVER_TIMEOUT_SECS: u64 = 15;
const DEFAULT_FORWARDER_TIMEOUT_SECS: u64 = 3;
const DEFAULT_AGENT_DATA_BUFFER_SIZE: usize = 100;
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// How buffered agent data reaches the APM server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SendStrategy {
    /// Drain the buffer at the end of each invocation, before handing control back to Lambda.
    #[default]
    SyncFlush,
    /// Drain continuously from a background task for the life of the process.
    Background,
}

impl SendStrategy {
    /// Anything other than `background` (case-insensitive) selects `SyncFlush`.
    pub fn from_env_value(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("background") {
            SendStrategy::Background
        } else {
            SendStrategy::SyncFlush
        }
    }
}

impl fmt::Display for SendStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendStrategy::SyncFlush => write!(f, "syncflush"),
            SendStrategy::Background => write!(f, "background"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// APM server base url, always ending in `/`
    pub apm_server_url: String,
    pub secret_token: Option<String>,
    pub api_key: Option<String>,
    /// address the agent data intake listens on
    pub receiver_addr: SocketAddr,
    /// bounds header and body reads on the intake server
    pub receiver_timeout: Duration,
    /// bounds each outbound request to the APM server
    pub forwarder_timeout: Duration,
    pub send_strategy: SendStrategy,
    pub log_level: String,
    /// number of agent payloads held before the intake starts rejecting
    pub agent_data_buffer_size: usize,
    /// how long an intake request may wait for room in a full buffer
    pub enqueue_timeout: Duration,
    pub max_request_content_length: usize,
    pub transport_cooldown_base: Duration,
    pub transport_cooldown_max: Duration,
    /// how long the background flusher waits for data before re-checking for shutdown
    pub background_idle_timeout: Duration,
    pub https_proxy: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            apm_server_url: "http://localhost:8200/".to_string(),
            secret_token: None,
            api_key: None,
            receiver_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_RECEIVER_PORT)),
            receiver_timeout: Duration::from_secs(DEFAULT_RECEIVER_TIMEOUT_SECS),
            forwarder_timeout: Duration::from_secs(DEFAULT_FORWARDER_TIMEOUT_SECS),
            send_strategy: SendStrategy::SyncFlush,
            log_level: "info".to_string(),
            agent_data_buffer_size: DEFAULT_AGENT_DATA_BUFFER_SIZE,
            enqueue_timeout: Duration::ZERO,
            max_request_content_length: 10 * 1024 * 1024, // 10MB in Bytes
            transport_cooldown_base: Duration::from_secs(1),
            transport_cooldown_max: Duration::from_secs(60),
            background_idle_timeout: Duration::from_millis(100),
            https_proxy: None,
        }
    }
}

impl Config {
    /// Reads the configuration and logs any fallback warnings through `tracing`.
    pub fn from_env() -> Result<Config, RelayError> {
        let (config, warnings) = Config::from_env_with_warnings()?;
        for warning in &warnings {
            warn!("{warning}");
        }
        Ok(config)
    }

    /// Reads the configuration, returning the fallback warnings instead of logging them. Used
    /// when the subscriber depends on the configuration and isn't installed yet.
    pub fn from_env_with_warnings() -> Result<(Config, Vec<String>), RelayError> {
        let mut warnings = Vec::new();
        let apm_server_url = env::var("ELASTIC_APM_LAMBDA_APM_SERVER")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .map(|url| normalize_server_url(&url))
            .ok_or_else(|| {
                RelayError::InvalidConfig(
                    "ELASTIC_APM_LAMBDA_APM_SERVER environment variable is not set".to_string(),
                )
            })?;

        let receiver_addr = match env::var("ELASTIC_APM_DATA_RECEIVER_SERVER_PORT") {
            Ok(port) => parse_receiver_addr(&port)?,
            Err(_) => SocketAddr::from(([127, 0, 0, 1], DEFAULT_RECEIVER_PORT)),
        };

        let agent_data_buffer_size = match env::var("ELASTIC_APM_AGENT_DATA_BUFFER_SIZE") {
            Ok(size) => match size.trim().parse::<usize>() {
                Ok(0) | Err(_) => {
                    return Err(RelayError::InvalidConfig(format!(
                        "ELASTIC_APM_AGENT_DATA_BUFFER_SIZE must be a positive integer, got '{size}'"
                    )))
                }
                Ok(size) => size,
            },
            Err(_) => DEFAULT_AGENT_DATA_BUFFER_SIZE,
        };

        let log_level = match env::var("ELASTIC_APM_LOG_LEVEL").map(|val| val.to_lowercase()) {
            Ok(val) if VALID_LOG_LEVELS.contains(&val.as_str()) => val,
            Ok(val) => {
                warnings.push(format!("Invalid log level '{val}', falling back to info"));
                "info".to_string()
            }
            Err(_) => "info".to_string(),
        };

        let config = Config {
            apm_server_url,
            secret_token: non_empty_var("ELASTIC_APM_SECRET_TOKEN"),
            api_key: non_empty_var("ELASTIC_APM_API_KEY"),
            receiver_addr,
            receiver_timeout: Duration::from_secs(positive_secs_or_default(
                "ELASTIC_APM_DATA_RECEIVER_TIMEOUT_SECONDS",
                DEFAULT_RECEIVER_TIMEOUT_SECS,
                &mut warnings,
            )),
            forwarder_timeout: Duration::from_secs(positive_secs_or_default(
                "ELASTIC_APM_DATA_FORWARDER_TIMEOUT_SECONDS",
                DEFAULT_FORWARDER_TIMEOUT_SECS,
                &mut warnings,
            )),
            send_strategy: env::var("ELASTIC_APM_SEND_STRATEGY")
                .map(|val| SendStrategy::from_env_value(&val))
                .unwrap_or_default(),
            log_level,
            agent_data_buffer_size,
            enqueue_timeout: Duration::from_millis(
                env::var("ELASTIC_APM_DATA_RECEIVER_ENQUEUE_WAIT_MS")
                    .ok()
                    .and_then(|ms| ms.trim().parse::<u64>().ok())
                    .unwrap_or(0),
            ),
            https_proxy: env::var("ELASTIC_APM_PROXY_HTTPS")
                .or_else(|_| env::var("HTTPS_PROXY"))
                .ok(),
            ..Default::default()
        };

        Ok((config, warnings))
    }
}

/// The server url is joined with intake paths, so it has to end with a slash.
fn normalize_server_url(url: &str) -> String {
    let url = url.trim();
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

/// Accepts `8201`, `:8201` or a full `host:port`.
fn parse_receiver_addr(value: &str) -> Result<SocketAddr, RelayError> {
    let value = value.trim();
    let candidate = match value.strip_prefix(':') {
        Some(port) => format!("{DEFAULT_RECEIVER_HOST}:{port}"),
        None if !value.contains(':') => format!("{DEFAULT_RECEIVER_HOST}:{value}"),
        None => value.to_string(),
    };
    candidate.parse::<SocketAddr>().map_err(|_| {
        RelayError::InvalidConfig(format!(
            "Invalid ELASTIC_APM_DATA_RECEIVER_SERVER_PORT '{value}'"
        ))
    })
}

/// Zero would time out every request, so it falls back to the default like a parse failure.
fn positive_secs_or_default(var: &str, default: u64, warnings: &mut Vec<String>) -> u64 {
    match env::var(var) {
        Ok(val) => match val.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => secs,
            _ => {
                warnings.push(format!(
                    "Invalid {var}='{val}', using default of {default}s"
                ));
                default
            }
        },
        Err(_) => default,
    }
}

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var).ok().filter(|val| !val.is_empty())
}
