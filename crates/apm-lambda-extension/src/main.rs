// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod extension_api;
mod logger;

use anyhow::Context;
use std::{
    env,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, error, info, info_span, warn, Instrument};

use apm_relay::{
    agent_data::AgentDataBuffer,
    config::Config,
    flusher::{AgentDataFlusher, FlushOutcome, FlushScheduler},
    forwarder::ApmServerForwarder,
    intake::{AgentDoneListener, AgentDoneSignal, IntakeServer, IntakeServerHandle},
    transport::TransportHealth,
};

use extension_api::{pretty_print, EventType, ExtensionClient, NextEventResponse};

const DEFAULT_EXTENSION_NAME: &str = "apm-lambda-extension";
// stop waiting for the agent this long before the invocation deadline
const DEADLINE_MARGIN: Duration = Duration::from_millis(100);

#[tokio::main]
pub async fn main() {
    if let Err(e) = run().await {
        error!("Extension stopped: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let (config, warnings) = match Config::from_env_with_warnings() {
        Ok((config, warnings)) => (Arc::new(config), warnings),
        Err(e) => {
            // logging isn't configured yet, fall back to defaults so the error is visible
            let _ = logger::init("info");
            return Err(e).context("loading configuration");
        }
    };
    logger::init(&config.log_level).context("initializing logging")?;
    debug!("Logging subsystem enabled");
    for warning in &warnings {
        warn!("{warning}");
    }

    let runtime_api =
        env::var("AWS_LAMBDA_RUNTIME_API").context("AWS_LAMBDA_RUNTIME_API is not set")?;
    let extension_name = extension_name();
    let extension = ExtensionClient::register(&runtime_api, &extension_name).await?;
    info!(
        "Registered extension {extension_name} with id {}",
        extension.extension_id()
    );

    let health = Arc::new(TransportHealth::from_config(&config));
    let buffer = Arc::new(AgentDataBuffer::new(config.agent_data_buffer_size)?);
    let forwarder = Arc::new(ApmServerForwarder::new(config.clone(), health.clone())?);
    let flusher = Arc::new(AgentDataFlusher::new(
        buffer.clone(),
        forwarder.clone(),
        health.clone(),
    ));
    let scheduler = FlushScheduler::start(
        config.send_strategy,
        flusher,
        config.background_idle_timeout,
    );

    let agent_done = Arc::new(AgentDoneSignal::new());
    let mut agent_done_listener = agent_done.subscribe();
    let server = IntakeServer {
        config: config.clone(),
        buffer: buffer.clone(),
        forwarder,
        agent_done,
    }
    .start()
    .await?;

    loop {
        let event = match extension.next_event().await {
            Ok(event) => event,
            Err(e) => {
                error!("Error fetching next event: {e:#}");
                stop(&buffer, scheduler, server).await;
                return Err(e);
            }
        };
        debug!("Received event: {}", pretty_print(&event));

        match event.event_type {
            EventType::Invoke => {
                let span = info_span!("invocation", request_id = %event.request_id);
                async {
                    wait_for_agent(&mut agent_done_listener, &event).await;
                    finish_invocation(&scheduler, &mut agent_done_listener).await;
                }
                .instrument(span)
                .await;
            }
            EventType::Shutdown => {
                info!(
                    "Received shutdown event: {}",
                    event.shutdown_reason.as_deref().unwrap_or("unknown")
                );
                stop(&buffer, scheduler, server).await;
                return Ok(());
            }
        }
    }
}

/// Waits until the agent signals it is done with the invocation or the deadline is near.
async fn wait_for_agent(agent_done: &mut AgentDoneListener, event: &NextEventResponse) {
    let remaining = time_until_deadline(event.deadline_ms, SystemTime::now());
    let wait = remaining.saturating_sub(DEADLINE_MARGIN);
    match tokio::time::timeout(wait, agent_done.wait()).await {
        Ok(true) => debug!("Agent signalled it is done"),
        Ok(false) => debug!("Agent done signal closed"),
        Err(_) => debug!("No flush signal from agent before deadline"),
    }
}

async fn finish_invocation(scheduler: &FlushScheduler, agent_done: &mut AgentDoneListener) {
    if let Some(outcome) = scheduler.on_invocation_end().await {
        debug!(
            "Flush finished - forwarded {} of {} payloads",
            outcome.forwarded, outcome.attempted
        );
    }
    // a signal that arrived late for this invocation must not end the next one
    agent_done.reset();
}

/// Refuses new agent data, runs the final drain, then stops the intake server.
async fn stop(
    buffer: &AgentDataBuffer,
    scheduler: FlushScheduler,
    server: IntakeServerHandle,
) -> FlushOutcome {
    buffer.close().await;
    let outcome = scheduler.shutdown().await;
    if outcome.skipped {
        warn!(
            "Final flush skipped, {} payloads left unsent",
            buffer.len()
        );
    } else {
        info!(
            "Final flush forwarded {} payloads, {} failed",
            outcome.forwarded, outcome.failed
        );
    }
    server.shutdown().await;
    outcome
}

fn time_until_deadline(deadline_ms: i64, now: SystemTime) -> Duration {
    let now_ms = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let deadline_ms = u128::try_from(deadline_ms).unwrap_or_default();
    let remaining = deadline_ms.saturating_sub(now_ms);
    Duration::from_millis(u64::try_from(remaining).unwrap_or(u64::MAX))
}

fn extension_name() -> String {
    env::current_exe()
        .ok()
        .and_then(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| DEFAULT_EXTENSION_NAME.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use apm_relay::config::SendStrategy;

    fn invoke_event(deadline_ms: i64) -> NextEventResponse {
        NextEventResponse {
            event_type: EventType::Invoke,
            deadline_ms,
            request_id: "req-1".to_string(),
            invoked_function_arn: String::new(),
            shutdown_reason: None,
        }
    }

    fn deadline_in(wait: Duration) -> i64 {
        (SystemTime::now() + wait)
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64
    }

    fn sync_scheduler(config: &Arc<Config>) -> (Arc<AgentDataBuffer>, FlushScheduler) {
        let health = Arc::new(TransportHealth::from_config(config));
        let buffer = Arc::new(AgentDataBuffer::new(config.agent_data_buffer_size).unwrap());
        let forwarder =
            Arc::new(ApmServerForwarder::new(config.clone(), health.clone()).unwrap());
        let flusher = Arc::new(AgentDataFlusher::new(buffer.clone(), forwarder, health));
        let scheduler = FlushScheduler::start(
            SendStrategy::SyncFlush,
            flusher,
            config.background_idle_timeout,
        );
        (buffer, scheduler)
    }

    #[test]
    fn test_time_until_deadline() {
        let now = UNIX_EPOCH + Duration::from_millis(10_000);
        assert_eq!(
            time_until_deadline(12_500, now),
            Duration::from_millis(2_500)
        );
        assert_eq!(time_until_deadline(9_000, now), Duration::ZERO);
        assert_eq!(time_until_deadline(-1, now), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_wait_for_agent_returns_on_signal() {
        let agent_done = Arc::new(AgentDoneSignal::new());
        let mut listener = agent_done.subscribe();
        let event = invoke_event(deadline_in(Duration::from_secs(30)));

        let notifier = agent_done.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            notifier.notify();
        });

        tokio::time::timeout(Duration::from_secs(5), wait_for_agent(&mut listener, &event))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_agent_stops_at_deadline() {
        let agent_done = AgentDoneSignal::new();
        let mut listener = agent_done.subscribe();

        tokio::time::timeout(
            Duration::from_secs(1),
            wait_for_agent(&mut listener, &invoke_event(0)),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_late_signal_does_not_end_next_invocation() {
        let config = Arc::new(Config::default());
        let (_buffer, scheduler) = sync_scheduler(&config);
        let agent_done = AgentDoneSignal::new();
        let mut listener = agent_done.subscribe();

        // the previous invocation gave up waiting, then the agent's signal showed up
        wait_for_agent(&mut listener, &invoke_event(0)).await;
        agent_done.notify();
        finish_invocation(&scheduler, &mut listener).await;

        let next = invoke_event(deadline_in(Duration::from_secs(10)));
        assert!(tokio::time::timeout(
            Duration::from_millis(200),
            wait_for_agent(&mut listener, &next)
        )
        .await
        .is_err());
    }

    #[tokio::test]
    async fn test_stop_closes_buffer_before_draining() {
        let config = Arc::new(Config {
            receiver_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        });
        let (buffer, scheduler) = sync_scheduler(&config);
        let server = IntakeServer {
            config: config.clone(),
            buffer: buffer.clone(),
            forwarder: Arc::new(
                ApmServerForwarder::new(
                    config.clone(),
                    Arc::new(TransportHealth::from_config(&config)),
                )
                .unwrap(),
            ),
            agent_done: Arc::new(AgentDoneSignal::new()),
        }
        .start()
        .await
        .unwrap();

        let outcome = stop(&buffer, scheduler, server).await;
        assert_eq!(outcome.attempted, 0);
        assert!(buffer.is_closed());
    }
}
