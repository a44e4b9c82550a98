// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;

/// Errors raised while setting up the relay. Nothing here is raised once data is flowing.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("Failed to bind intake server on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = RelayError::InvalidConfig("missing APM server URL".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid configuration: missing APM server URL"
        );
    }

    #[test]
    fn test_bind_error_display() {
        let error = RelayError::Bind {
            addr: "127.0.0.1:8200".parse().unwrap(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
        };
        assert_eq!(
            error.to_string(),
            "Failed to bind intake server on 127.0.0.1:8200: address in use"
        );
    }
}
