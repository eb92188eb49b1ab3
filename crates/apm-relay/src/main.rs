// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Reads NDJSON events from stdin and delivers them through an [`Agent`].
//!
//! Each input line is a single-key object such as `{"transaction": {...}}`.
//! The relay stops at end of input or on Ctrl-C, giving the agent its configured
//! grace period to flush what is still queued.

mod logger;

use anyhow::Context;
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use apm_agent_core::config::{LogLevel, DEFAULT_SERVICE_NAME};
use apm_agent_core::{Agent, ConfigSnapshot, Event};

/// How often the relay checks the active snapshot for a new `log_level`.
const LOG_LEVEL_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
pub async fn main() {
    // The level and service are read ahead of the full configuration so that
    // problems with the other settings are logged.
    let log_level = env::var("APM_LOG_LEVEL")
        .ok()
        .and_then(|v| LogLevel::from_str(&v).ok())
        .unwrap_or_default();
    let service = env::var("APM_SERVICE_NAME")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());
    let level_handle = match logger::install(log_level, service) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("APM_RELAY | ERROR | setting default subscriber failed: {e:#}");
            return;
        }
    };
    debug!("Logging subsystem enabled");

    if let Err(e) = run(level_handle).await {
        error!("APM | Relay failed: {e:#}");
        std::process::exit(1);
    }
}

/// Applies the `log_level` of every newly published snapshot to the subscriber.
async fn follow_log_level(agent: Arc<Agent>, handle: logger::LevelHandle, cancel: CancellationToken) {
    let mut current = agent.config().log_level;
    let mut ticker = tokio::time::interval(LOG_LEVEL_POLL_INTERVAL);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let level = agent.config().log_level;
        if level == current {
            continue;
        }
        match logger::env_filter(level).map(|filter| handle.reload(filter)) {
            Ok(Ok(())) => {
                info!("APM | Log level changed from {current:?} to {level:?}");
                current = level;
            }
            Ok(Err(e)) => warn!("APM | Could not apply log level {level:?}: {e}"),
            Err(e) => warn!("APM | Could not apply log level {level:?}: {e}"),
        }
    }
}

async fn run(level_handle: logger::LevelHandle) -> anyhow::Result<()> {
    let config = ConfigSnapshot::from_env();
    debug!("APM | Relay configuration: {config:?}");
    let grace = config.shutdown_grace_period;

    let agent = Arc::new(Agent::new(config).context("building agent")?);
    agent.start().context("starting agent")?;
    let log_cancel = CancellationToken::new();
    let log_task = tokio::spawn(follow_log_level(
        Arc::clone(&agent),
        level_handle,
        log_cancel.clone(),
    ));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let (mut line_no, mut accepted, mut rejected) = (0u64, 0u64, 0u64);
    loop {
        tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => {
                info!("APM | Interrupted, shutting down");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    debug!("APM | End of input");
                    break;
                };
                line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }
                match Event::from_ndjson_line(&line) {
                    Some(event) => {
                        if agent.enqueue(event) {
                            accepted += 1;
                        }
                    }
                    None => {
                        rejected += 1;
                        warn!("APM | Ignoring malformed input line {line_no}");
                    }
                }
            }
        }
    }

    info!("APM | Queued {accepted} events ({rejected} malformed lines), flushing");
    let stopped = agent.stop(grace).await.context("stopping agent");
    log_cancel.cancel();
    let _ = log_task.await;
    stopped
}
