// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc::{
    self,
    error::{SendTimeoutError, TryRecvError, TrySendError},
    Receiver, Sender,
};
use tokio::sync::Mutex;

use crate::error::RelayError;

pub const DEFAULT_CONTENT_TYPE: &str = "application/x-ndjson";

/// A single payload received from the APM agent, forwarded as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentData {
    data: Bytes,
    content_type: String,
    content_encoding: Option<String>,
}

impl AgentData {
    pub fn new(data: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        AgentData {
            data: data.into(),
            content_type: content_type.into(),
            content_encoding: None,
        }
    }

    #[must_use]
    pub fn with_content_encoding(mut self, content_encoding: Option<String>) -> Self {
        self.content_encoding = content_encoding;
        self
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.content_encoding.as_deref()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("agent data buffer is full")]
    Full,
    #[error("agent data buffer is closed")]
    Closed,
}

/// Bounded FIFO between the intake handlers (many producers) and the flusher (single consumer).
///
/// Closing the buffer rejects new data but keeps whatever is already queued available
/// to the final drain.
pub struct AgentDataBuffer {
    tx: Sender<AgentData>,
    rx: Mutex<Receiver<AgentData>>,
}

impl AgentDataBuffer {
    pub fn new(capacity: usize) -> Result<Self, RelayError> {
        if capacity == 0 {
            return Err(RelayError::InvalidConfig(
                "agent data buffer capacity must be greater than 0".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel(capacity);
        Ok(AgentDataBuffer {
            tx,
            rx: Mutex::new(rx),
        })
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queues `data` without waiting.
    pub fn try_enqueue(&self, data: AgentData) -> Result<(), EnqueueError> {
        self.tx.try_send(data).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Queues `data`, waiting at most `wait` for room. A zero wait never suspends.
    pub async fn enqueue_timeout(&self, data: AgentData, wait: Duration) -> Result<(), EnqueueError> {
        if wait.is_zero() {
            return self.try_enqueue(data);
        }
        self.tx.send_timeout(data, wait).await.map_err(|e| match e {
            SendTimeoutError::Timeout(_) => EnqueueError::Full,
            SendTimeoutError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Removes and returns everything queued right now, oldest first.
    pub async fn drain_nonblocking(&self) -> Vec<AgentData> {
        let mut rx = self.rx.lock().await;
        let mut drained = Vec::with_capacity(self.len());
        loop {
            match rx.try_recv() {
                Ok(data) => drained.push(data),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        drained
    }

    /// Waits up to `timeout` for the next item. Returns `None` on timeout, or right away
    /// once the buffer is closed and empty.
    pub async fn next_blocking(&self, timeout: Duration) -> Option<AgentData> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    pub async fn close(&self) {
        self.rx.lock().await.close();
    }
}
