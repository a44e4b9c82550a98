// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::agent_data::{AgentData, AgentDataBuffer};
use crate::config::SendStrategy;
use crate::forwarder::Forwarder;
use crate::transport::TransportHealth;

// keeps a failing transport from spinning the background loop
const MIN_PROBE_WAIT: Duration = Duration::from_millis(1);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    /// the transport was failing, nothing was drained
    pub skipped: bool,
    pub attempted: usize,
    pub forwarded: usize,
    pub failed: usize,
}

impl FlushOutcome {
    fn merge(&mut self, other: FlushOutcome) {
        self.attempted += other.attempted;
        self.forwarded += other.forwarded;
        self.failed += other.failed;
    }
}

/// Drains the agent data buffer into a [`Forwarder`], one attempt per payload.
pub struct AgentDataFlusher {
    buffer: Arc<AgentDataBuffer>,
    forwarder: Arc<dyn Forwarder + Send + Sync>,
    health: Arc<TransportHealth>,
}

impl AgentDataFlusher {
    pub fn new(
        buffer: Arc<AgentDataBuffer>,
        forwarder: Arc<dyn Forwarder + Send + Sync>,
        health: Arc<TransportHealth>,
    ) -> Self {
        AgentDataFlusher {
            buffer,
            forwarder,
            health,
        }
    }

    /// Forwards everything queued right now, in arrival order, without waiting for new data.
    /// A failed payload is dropped and the rest of the pass carries on.
    pub async fn flush(&self) -> FlushOutcome {
        if !self.health.is_healthy_or_pending() {
            debug!("Flush skipped - Transport unhealthy");
            return FlushOutcome {
                skipped: true,
                ..Default::default()
            };
        }
        debug!("Flush started - Checking for agent data");
        let mut outcome = FlushOutcome::default();
        for data in self.buffer.drain_nonblocking().await {
            self.forward_one(data, &mut outcome).await;
        }
        debug!(
            "Flush ended - forwarded {} of {} agent data payloads",
            outcome.forwarded, outcome.attempted
        );
        outcome
    }

    async fn forward_one(&self, data: AgentData, outcome: &mut FlushOutcome) {
        outcome.attempted += 1;
        match self.forwarder.forward(&data).await {
            Ok(()) => outcome.forwarded += 1,
            Err(e) => {
                outcome.failed += 1;
                error!("Error sending to APM server, skipping: {e}");
            }
        }
    }

    /// Forwards payloads as they arrive until `cancel` fires, then does one final drain.
    ///
    /// While the transport is failing, payloads stay in the buffer until the next probe is due.
    pub async fn run_background(
        &self,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) -> FlushOutcome {
        let mut totals = FlushOutcome::default();
        loop {
            if !self.health.is_healthy_or_pending() {
                let wait = self
                    .health
                    .time_until_probe()
                    .min(idle_timeout)
                    .max(MIN_PROBE_WAIT);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => continue,
                }
            }

            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.buffer.next_blocking(idle_timeout) => next,
            };
            match next {
                Some(data) => self.forward_one(data, &mut totals).await,
                None if self.buffer.is_closed() => {
                    // nothing more can arrive
                    cancel.cancelled().await;
                    break;
                }
                None => {}
            }
        }

        debug!("Background flusher stopping, performing final drain");
        let last = self.flush().await;
        totals.merge(last);
        totals.skipped = last.skipped;
        totals
    }
}

/// The flush schedule chosen once from [`SendStrategy`].
pub enum FlushScheduler {
    /// The lifecycle loop drives every flush.
    SyncFlush { flusher: Arc<AgentDataFlusher> },
    /// A task drains continuously for the life of the process.
    Background {
        cancel: CancellationToken,
        handle: JoinHandle<FlushOutcome>,
    },
}

impl FlushScheduler {
    /// Must be called from within a tokio runtime when `strategy` is `Background`.
    pub fn start(
        strategy: SendStrategy,
        flusher: Arc<AgentDataFlusher>,
        idle_timeout: Duration,
    ) -> Self {
        info!("Starting agent data flusher with send strategy {strategy}");
        match strategy {
            SendStrategy::SyncFlush => FlushScheduler::SyncFlush { flusher },
            SendStrategy::Background => {
                let cancel = CancellationToken::new();
                let task_cancel = cancel.clone();
                let handle = tokio::spawn(async move {
                    flusher.run_background(idle_timeout, task_cancel).await
                });
                FlushScheduler::Background { cancel, handle }
            }
        }
    }

    /// Called at the end of each invocation. Only flushes in `SyncFlush` mode.
    pub async fn on_invocation_end(&self) -> Option<FlushOutcome> {
        match self {
            FlushScheduler::SyncFlush { flusher } => Some(flusher.flush().await),
            FlushScheduler::Background { .. } => None,
        }
    }

    /// Performs the final best-effort drain. In `Background` mode this stops the task, which
    /// drains on its way out, and returns its totals.
    pub async fn shutdown(self) -> FlushOutcome {
        match self {
            FlushScheduler::SyncFlush { flusher } => flusher.flush().await,
            FlushScheduler::Background { cancel, handle } => {
                cancel.cancel();
                match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!("Background flusher task failed: {e}");
                        FlushOutcome::default()
                    }
                }
            }
        }
    }
}
