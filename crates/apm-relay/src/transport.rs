// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Healthy,
    /// Cool-down elapsed; the next forward is a probe.
    Pending,
    Failing,
}

#[derive(Debug)]
struct TransportState {
    status: TransportStatus,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
    consecutive_failures: u32,
}

/// Tracks whether the APM server is reachable so flushes can be skipped while it is not.
///
/// Only the forwarder reports outcomes. The lock is never held across an await point.
#[derive(Debug)]
pub struct TransportHealth {
    state: Mutex<TransportState>,
    cooldown_base: Duration,
    cooldown_max: Duration,
}

impl TransportHealth {
    pub fn new(cooldown_base: Duration, cooldown_max: Duration) -> Self {
        TransportHealth {
            state: Mutex::new(TransportState {
                status: TransportStatus::Healthy,
                last_success: None,
                last_failure: None,
                consecutive_failures: 0,
            }),
            cooldown_base,
            cooldown_max,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.transport_cooldown_base, config.transport_cooldown_max)
    }

    fn lock(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cool-down grows quadratically with consecutive failures, capped at `cooldown_max`.
    fn cooldown(&self, consecutive_failures: u32) -> Duration {
        let factor = consecutive_failures.saturating_mul(consecutive_failures);
        self.cooldown_base
            .saturating_mul(factor)
            .min(self.cooldown_max)
    }

    /// Current status. A `Failing` transport whose cool-down has elapsed moves to `Pending` here.
    pub fn status(&self) -> TransportStatus {
        let mut state = self.lock();
        if state.status == TransportStatus::Failing {
            let cooldown = self.cooldown(state.consecutive_failures);
            let elapsed = state
                .last_failure
                .map_or(true, |failed_at| failed_at.elapsed() >= cooldown);
            if elapsed {
                info!(
                    "APM server transport cool-down of {}ms elapsed, allowing a probe",
                    cooldown.as_millis()
                );
                state.status = TransportStatus::Pending;
            }
        }
        state.status
    }

    pub fn is_healthy_or_pending(&self) -> bool {
        self.status() != TransportStatus::Failing
    }

    /// Time left before a failing transport may be probed again. Zero unless `Failing`.
    pub fn time_until_probe(&self) -> Duration {
        let state = self.lock();
        match (state.status, state.last_failure) {
            (TransportStatus::Failing, Some(failed_at)) => self
                .cooldown(state.consecutive_failures)
                .saturating_sub(failed_at.elapsed()),
            _ => Duration::ZERO,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn last_success(&self) -> Option<Instant> {
        self.lock().last_success
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.lock().last_failure
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        if state.status != TransportStatus::Healthy {
            info!("APM server transport is healthy again");
        }
        state.status = TransportStatus::Healthy;
        state.consecutive_failures = 0;
        state.last_success = Some(Instant::now());
    }

    pub fn record_failure(&self) {
        let mut state = self.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure = Some(Instant::now());
        if state.status != TransportStatus::Failing {
            warn!(
                "APM server transport marked as failing, next probe in {}ms",
                self.cooldown(state.consecutive_failures).as_millis()
            );
        }
        state.status = TransportStatus::Failing;
    }

    /// Forces the transport back to `Healthy`, dropping the failure history.
    pub fn reset(&self) {
        let mut state = self.lock();
        debug!("Resetting APM server transport status");
        state.status = TransportStatus::Healthy;
        state.consecutive_failures = 0;
        state.last_failure = None;
    }
}
