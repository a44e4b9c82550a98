// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::rt::{self, ReadBufCursor};
use hyper::service::service_fn;
use hyper::{header, http, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::error::Error;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent_data::{AgentData, AgentDataBuffer, EnqueueError, DEFAULT_CONTENT_TYPE};
use crate::config::Config;
use crate::error::RelayError;
use crate::forwarder::ApmServerForwarder;
use crate::http_utils::{
    create_http_response, log_and_create_http_response, verify_request_content_length,
    HttpResponse,
};

const INFO_ENDPOINT_PATH: &str = "/";
const INTAKE_ENDPOINT_PATH: &str = "/intake/v2/events";
const MAX_HEADER_BYTES: usize = 1 << 20;

/// Local HTTP endpoint the APM agent sends its data to.
#[derive(Clone)]
pub struct IntakeServer {
    pub config: Arc<Config>,
    pub buffer: Arc<AgentDataBuffer>,
    pub forwarder: Arc<ApmServerForwarder>,
    pub agent_done: Arc<AgentDoneSignal>,
}

/// Raised when the agent reports, with `?flushed=true`, that it has sent everything for the
/// current invocation. Backed by a generation counter so each listener only sees signals
/// newer than its last [`AgentDoneListener::reset`].
#[derive(Debug)]
pub struct AgentDoneSignal {
    tx: watch::Sender<u64>,
}

impl Default for AgentDoneSignal {
    fn default() -> Self {
        AgentDoneSignal::new()
    }
}

impl AgentDoneSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        AgentDoneSignal { tx }
    }

    pub fn notify(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    pub fn subscribe(&self) -> AgentDoneListener {
        AgentDoneListener {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Debug)]
pub struct AgentDoneListener {
    rx: watch::Receiver<u64>,
}

impl AgentDoneListener {
    /// Forgets every signal raised so far.
    pub fn reset(&mut self) {
        self.rx.borrow_and_update();
    }

    /// Waits for a signal raised after the last reset. Returns `false` if the signal is gone.
    pub async fn wait(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

/// Owned handle to a running intake server.
pub struct IntakeServerHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl IntakeServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and drops in-flight ones. Data already queued is untouched.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            error!("Intake server task failed: {e}");
        }
    }
}

impl IntakeServer {
    pub async fn start(self) -> Result<IntakeServerHandle, RelayError> {
        let addr = self.config.receiver_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| RelayError::Bind { addr, source })?;
        info!("Extension listening for apm data on {local_addr}");

        let cancel = CancellationToken::new();
        let server_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = self.serve_tcp(listener, server_cancel).await {
                error!("Error upon APM data server start: {e}");
            }
        });

        Ok(IntakeServerHandle {
            local_addr,
            cancel,
            handle,
        })
    }

    async fn serve_tcp(
        self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut server = hyper::server::conn::http1::Builder::new();
        server
            .timer(TokioTimer::new())
            .header_read_timeout(self.config.receiver_timeout)
            .max_buf_size(MAX_HEADER_BYTES);
        let mut joinset = tokio::task::JoinSet::new();
        let write_timeout = self.config.receiver_timeout;

        let intake = Arc::new(self);
        let service = service_fn(move |req| {
            let intake = Arc::clone(&intake);
            async move { intake.endpoint_handler(req).await }
        });

        loop {
            let conn = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Intake server closed");
                    break;
                }
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Server error: {e}");
                        return Err(e.into());
                    }
                    Ok((conn, _)) => conn,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        error!("Connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
            };
            let conn = WriteTimeoutIo::new(TokioIo::new(conn), write_timeout);
            let server = server.clone();
            let service = service.clone();
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(conn, service).await {
                    debug!("Connection error: {e}");
                }
            });
        }

        joinset.shutdown().await;
        Ok(())
    }

    pub async fn endpoint_handler<B>(&self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn Error + Send + Sync>>,
    {
        match (req.method(), req.uri().path()) {
            (&Method::POST, INTAKE_ENDPOINT_PATH) => self.intake_handler(req).await,
            (_, INTAKE_ENDPOINT_PATH) => {
                create_http_response("Method not allowed", StatusCode::METHOD_NOT_ALLOWED)
            }
            (&Method::GET | &Method::POST, INFO_ENDPOINT_PATH) => self.info_handler().await,
            _ => {
                let mut not_found = Response::default();
                *not_found.status_mut() = StatusCode::NOT_FOUND;
                Ok(not_found)
            }
        }
    }

    async fn intake_handler<B>(&self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();
        if let Some(response) = verify_request_content_length(
            &parts.headers,
            self.config.max_request_content_length,
            "Error processing agent data",
        ) {
            return response;
        }

        let limited = Limited::new(body, self.config.max_request_content_length);
        let body_bytes =
            match tokio::time::timeout(self.config.receiver_timeout, limited.collect()).await {
                Ok(Ok(collected)) => collected.to_bytes(),
                Ok(Err(e)) if e.downcast_ref::<LengthLimitError>().is_some() => {
                    return log_and_create_http_response(
                        "Error processing agent data: Payload too large",
                        StatusCode::PAYLOAD_TOO_LARGE,
                    );
                }
                Ok(Err(e)) => {
                    return log_and_create_http_response(
                        &format!("Error reading agent data: {e}"),
                        StatusCode::BAD_REQUEST,
                    );
                }
                Err(_) => {
                    return log_and_create_http_response(
                        "Timed out reading agent data",
                        StatusCode::REQUEST_TIMEOUT,
                    );
                }
            };

        let flushed = is_flushed(parts.uri.query());
        let response = if !body_bytes.is_empty() {
            self.queue_agent_data(&parts.headers, body_bytes).await
        } else if flushed {
            create_http_response("Received agent flush signal", StatusCode::OK)
        } else {
            log_and_create_http_response(
                "Error processing agent data: Empty payload",
                StatusCode::BAD_REQUEST,
            )
        };

        // raised once the payload is queued or rejected
        if flushed {
            debug!("Agent signalled the end of the invocation");
            self.agent_done.notify();
        }
        response
    }

    async fn queue_agent_data(
        &self,
        headers: &http::HeaderMap,
        body_bytes: Bytes,
    ) -> http::Result<HttpResponse> {
        let content_type = header_str(headers, header::CONTENT_TYPE)
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let content_encoding =
            header_str(headers, header::CONTENT_ENCODING).map(str::to_string);
        let agent_data =
            AgentData::new(body_bytes, content_type).with_content_encoding(content_encoding);

        match self
            .buffer
            .enqueue_timeout(agent_data, self.config.enqueue_timeout)
            .await
        {
            Ok(()) => log_and_create_http_response(
                "Successfully buffered agent data to be flushed",
                StatusCode::OK,
            ),
            Err(EnqueueError::Full) => {
                warn!("Agent data buffer full, dropping payload");
                create_http_response(
                    "Agent data buffer is full",
                    StatusCode::SERVICE_UNAVAILABLE,
                )
            }
            Err(EnqueueError::Closed) => {
                warn!("Agent data buffer closed, dropping payload");
                create_http_response(
                    "Extension is shutting down",
                    StatusCode::SERVICE_UNAVAILABLE,
                )
            }
        }
    }

    async fn info_handler(&self) -> http::Result<HttpResponse> {
        match self.forwarder.server_info().await {
            Ok(info) => {
                let mut builder = Response::builder().status(info.status);
                if let Some(content_type) = info.content_type {
                    builder = builder.header(header::CONTENT_TYPE, content_type);
                }
                builder.body(Full::new(info.body))
            }
            Err(e) => log_and_create_http_response(
                &format!("Unable to reach APM server: {e}"),
                StatusCode::BAD_GATEWAY,
            ),
        }
    }
}

fn header_str(headers: &http::HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Fails a write that has made no progress for `timeout`, so a client that stops reading can't
/// pin its connection forever. Reads and idle keep-alive connections are left alone.
struct WriteTimeoutIo<T> {
    inner: T,
    timeout: Duration,
    stalled: Option<Pin<Box<Sleep>>>,
}

impl<T> WriteTimeoutIo<T> {
    fn new(inner: T, timeout: Duration) -> Self {
        WriteTimeoutIo {
            inner,
            timeout,
            stalled: None,
        }
    }

    fn check_stall<R>(
        &mut self,
        cx: &mut Context<'_>,
        poll: Poll<io::Result<R>>,
    ) -> Poll<io::Result<R>> {
        if poll.is_ready() {
            self.stalled = None;
            return poll;
        }
        let timeout = self.timeout;
        let stalled = self
            .stalled
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
        match stalled.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "response write timed out",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: rt::Read + Unpin> rt::Read for WriteTimeoutIo<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<T: rt::Write + Unpin> rt::Write for WriteTimeoutIo<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        this.check_stall(cx, poll)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        this.check_stall(cx, poll)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_flush(cx);
        this.check_stall(cx, poll)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_shutdown(cx);
        this.check_stall(cx, poll)
    }
}

fn is_flushed(query: Option<&str>) -> bool {
    query.is_some_and(|query| {
        query
            .split('&')
            .any(|pair| pair.eq_ignore_ascii_case("flushed=true"))
    })
}
