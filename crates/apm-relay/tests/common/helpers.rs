// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::timeout;

/// A newline-delimited event batch shaped like what an APM agent sends
pub fn create_test_events_payload(transaction_id: &str) -> Vec<u8> {
    format!(
        "{{\"metadata\":{{\"service\":{{\"name\":\"test-function\"}}}}}}\n{{\"transaction\":{{\"id\":\"{transaction_id}\"}}}}\n"
    )
    .into_bytes()
}

/// Send an HTTP request over TCP and return the response
pub async fn send_tcp_request(
    addr: SocketAddr,
    uri: &str,
    method: &str,
    body: Option<Vec<u8>>,
) -> Result<Response<hyper::body::Incoming>, Box<dyn std::error::Error>> {
    let stream = timeout(Duration::from_secs(2), tokio::net::TcpStream::connect(addr)).await??;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let mut request_builder = Request::builder()
        .uri(uri)
        .method(method)
        .header("Host", addr.to_string())
        .header("Content-Type", "application/x-ndjson");

    let body_data = body.unwrap_or_default();
    request_builder = request_builder.header("Content-Length", body_data.len().to_string());
    let request = request_builder.body(Full::new(Bytes::from(body_data)))?;
    let response = timeout(Duration::from_secs(5), sender.send_request(request)).await??;

    Ok(response)
}

pub async fn response_body(response: Response<hyper::body::Incoming>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}
