// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent wiring and lifecycle.
//!
//! An [`Agent`] owns the pipeline components and the two background tasks:
//!
//! - **Batch flusher**: drains the queue and sends batches through the transport
//! - **Central config fetcher**: polls the collector and publishes snapshots
//!
//! Both tasks share one [`CancellationToken`]. [`Agent::stop`] cancels it, waits for
//! the tasks up to a deadline and aborts whatever is still running.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::central_config::client::{CentralConfigClient, FetchError};
use crate::central_config::state::BackoffConfig;
use crate::central_config::{
    CentralConfigFetcher, CentralConfigHandle, RefreshError, RefreshOutcome,
};
use crate::config::store::ConfigStore;
use crate::config::ConfigSnapshot;
use crate::counters::{DeliveryCounters, DeliverySnapshot};
use crate::event::{Event, EventKind};
use crate::filters::{Filter, FilterRegistry};
use crate::flusher::BatchFlusher;
use crate::http::HttpClientError;
use crate::queue::{EnqueueOutcome, EventQueue};
use crate::transport::{HttpTransport, Transport};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent is already running")]
    AlreadyStarted,

    #[error("agent has been stopped")]
    Stopped,

    #[error("agent must be started from within a tokio runtime: {0}")]
    NoRuntime(String),

    #[error("central configuration is disabled")]
    CentralConfigDisabled,

    #[error("central configuration is not running")]
    CentralConfigNotRunning,

    #[error("shutdown did not complete within {timeout:?}, aborted {aborted} task(s)")]
    ShutdownTimeout { timeout: Duration, aborted: usize },

    #[error("default agent is already initialized")]
    AlreadyInitialized,

    #[error(transparent)]
    Http(#[from] HttpClientError),

    #[error(transparent)]
    CentralConfig(#[from] FetchError),

    #[error(transparent)]
    Refresh(#[from] RefreshError),
}

enum Lifecycle {
    Created,
    Running {
        tasks: Vec<(&'static str, JoinHandle<()>)>,
        central: Option<CentralConfigHandle>,
    },
    Stopped,
}

pub struct Agent {
    store: Arc<ConfigStore>,
    filters: Arc<FilterRegistry>,
    counters: Arc<DeliveryCounters>,
    queue: Arc<EventQueue>,
    transport: Arc<dyn Transport>,
    central_backoff: BackoffConfig,
    shutdown_token: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
}

impl Agent {
    /// Builds an agent from a local snapshot. Nothing runs until [`Agent::start`].
    pub fn new(local: ConfigSnapshot) -> Result<Self, AgentError> {
        let transport = HttpTransport::new(&local)?;
        Ok(Self::with_transport(local, Arc::new(transport)))
    }

    /// Builds an agent that delivers batches through `transport`.
    #[must_use]
    pub fn with_transport(local: ConfigSnapshot, transport: Arc<dyn Transport>) -> Self {
        let store = Arc::new(ConfigStore::new(local));
        let filters = Arc::new(FilterRegistry::new());
        let counters = Arc::new(DeliveryCounters::default());
        let queue = Arc::new(EventQueue::new(
            Arc::clone(&store),
            Arc::clone(&filters),
            Arc::clone(&counters),
        ));
        Self {
            store,
            filters,
            counters,
            queue,
            transport,
            central_backoff: BackoffConfig::default(),
            shutdown_token: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle::Created),
        }
    }

    #[must_use]
    pub fn with_central_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.central_backoff = backoff;
        self
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the flusher and, when enabled, the central config fetcher.
    pub fn start(&self) -> Result<(), AgentError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AgentError::NoRuntime(e.to_string()))?;
        let mut lifecycle = self.lifecycle();
        match *lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Running { .. } => return Err(AgentError::AlreadyStarted),
            Lifecycle::Stopped => return Err(AgentError::Stopped),
        }

        let local = self.store.local();
        let central_client = if local.central_config && local.enabled {
            Some(CentralConfigClient::new(&local)?)
        } else {
            None
        };
        let mut tasks = Vec::with_capacity(2);

        let flusher = BatchFlusher::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.store),
            Arc::clone(&self.transport),
        );
        tasks.push((
            "batch flusher",
            runtime.spawn(flusher.run(self.shutdown_token.clone())),
        ));

        let mut central = None;
        if let Some(client) = central_client {
            let (fetcher, handle) =
                CentralConfigFetcher::new(client, Arc::clone(&self.store), self.central_backoff);
            tasks.push((
                "central config fetcher",
                runtime.spawn(fetcher.run(self.shutdown_token.clone())),
            ));
            central = Some(handle);
        }

        info!(
            "APM | Agent started for service {} (central config {})",
            local.service_name,
            if central.is_some() { "on" } else { "off" }
        );
        *lifecycle = Lifecycle::Running { tasks, central };
        Ok(())
    }

    /// Stops both workers, waiting at most `timeout` for the final flush.
    ///
    /// Calling it again, or on an agent that never started, is a no-op.
    pub async fn stop(&self, timeout: Duration) -> Result<(), AgentError> {
        let tasks = {
            let mut lifecycle = self.lifecycle();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running { tasks, .. } => tasks,
                Lifecycle::Created => {
                    self.queue.close();
                    return Ok(());
                }
                Lifecycle::Stopped => return Ok(()),
            }
        };

        debug!("APM | Stopping agent");
        self.shutdown_token.cancel();

        let deadline = tokio::time::Instant::now() + timeout;
        let mut aborted = 0;
        for (name, mut handle) in tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!("APM | {name} stopped"),
                Ok(Err(e)) => error!("APM | {name} failed: {e}"),
                Err(_) => {
                    warn!("APM | {name} did not stop within {timeout:?}, aborting");
                    handle.abort();
                    aborted += 1;
                }
            }
        }
        // The queue is closed by the flusher; close it here too in case it was aborted.
        self.queue.close();

        info!("APM | Agent stopped, {}", self.counters.snapshot());
        if aborted > 0 {
            return Err(AgentError::ShutdownTimeout { timeout, aborted });
        }
        Ok(())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle(), Lifecycle::Running { .. })
    }

    /// Offers an event to the pipeline. Returns whether it was queued.
    pub fn enqueue(&self, event: Event) -> bool {
        self.try_enqueue(event).is_enqueued()
    }

    /// Like [`Agent::enqueue`], with the drop reason.
    pub fn try_enqueue(&self, event: Event) -> EnqueueOutcome {
        self.queue.try_enqueue(event)
    }

    /// Appends a filter for `kind`. The chain stays open for the agent's lifetime.
    pub fn add_filter<F>(&self, kind: EventKind, filter: F) -> bool
    where
        F: Fn(Event) -> Option<Event> + Send + Sync + 'static,
    {
        self.add_shared_filter(kind, Arc::new(filter))
    }

    pub(crate) fn add_shared_filter(&self, kind: EventKind, filter: Filter) -> bool {
        self.filters.add(kind, filter);
        true
    }

    /// The active configuration snapshot.
    #[must_use]
    pub fn config(&self) -> Arc<ConfigSnapshot> {
        self.store.current()
    }

    #[must_use]
    pub fn counters(&self) -> DeliverySnapshot {
        self.counters.snapshot()
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Asks the fetcher for an immediate fetch and waits for its outcome.
    pub async fn refresh_config_now(&self) -> Result<RefreshOutcome, AgentError> {
        let handle = {
            let lifecycle = self.lifecycle();
            match &*lifecycle {
                Lifecycle::Running {
                    central: Some(handle),
                    ..
                } => handle.clone(),
                Lifecycle::Running { central: None, .. } => {
                    return Err(AgentError::CentralConfigDisabled)
                }
                Lifecycle::Created | Lifecycle::Stopped => {
                    return Err(AgentError::CentralConfigNotRunning)
                }
            }
        };
        Ok(handle.refresh_now().await?)
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("config", &self.store.current())
            .field("filters", &self.filters)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
        if let Lifecycle::Running { tasks, .. } = &*self.lifecycle() {
            for (_, handle) in tasks {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::recording::RecordingTransport;
    use serde_json::json;

    fn agent_with(snapshot: ConfigSnapshot) -> (Agent, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let agent = Agent::with_transport(
            ConfigSnapshot {
                central_config: false,
                ..snapshot
            },
            transport.clone(),
        );
        (agent, transport)
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (agent, _) = agent_with(ConfigSnapshot::default());
        agent.start().unwrap();
        assert!(matches!(agent.start(), Err(AgentError::AlreadyStarted)));
        agent.stop(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(agent.start(), Err(AgentError::Stopped)));
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let (agent, _) = agent_with(ConfigSnapshot::default());
        assert!(matches!(agent.start(), Err(AgentError::NoRuntime(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_flushes_and_is_idempotent() {
        let (agent, transport) = agent_with(ConfigSnapshot {
            max_batch_event_count: 10,
            flush_interval: Duration::from_secs(60),
            ..ConfigSnapshot::default()
        });
        agent.start().unwrap();
        for i in 0..3 {
            assert!(agent.enqueue(Event::Transaction(json!({ "id": i }))));
        }

        agent.stop(Duration::from_secs(5)).await.unwrap();
        agent.stop(Duration::from_secs(5)).await.unwrap();

        let batches = transport.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
        assert!(!agent.is_running());
        assert!(!agent.enqueue(Event::Transaction(json!({}))));
        assert_eq!(agent.counters().kind(EventKind::Transaction).sent, 3);
    }

    #[tokio::test]
    async fn test_stop_from_another_task() {
        let (agent, _) = agent_with(ConfigSnapshot::default());
        let agent = Arc::new(agent);
        agent.start().unwrap();
        let stopper = {
            let agent = Arc::clone(&agent);
            tokio::spawn(async move { agent.stop(Duration::from_secs(1)).await })
        };
        stopper.await.unwrap().unwrap();
        assert!(!agent.is_running());
    }

    #[tokio::test]
    async fn test_stop_before_start_closes_queue() {
        let (agent, transport) = agent_with(ConfigSnapshot::default());
        agent.stop(Duration::from_secs(1)).await.unwrap();
        assert!(!agent.enqueue(Event::Span(json!({}))));
        assert!(transport.batches().is_empty());
    }

    #[tokio::test]
    async fn test_add_filter_applies_to_enqueue() {
        let (agent, _) = agent_with(ConfigSnapshot::default());
        assert!(agent.add_filter(EventKind::Span, |_| None));
        assert!(!agent.enqueue(Event::Span(json!({}))));
        assert!(agent.enqueue(Event::Error(json!({}))));
        assert_eq!(agent.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_requires_central_config() {
        let (agent, _) = agent_with(ConfigSnapshot::default());
        assert!(matches!(
            agent.refresh_config_now().await,
            Err(AgentError::CentralConfigNotRunning)
        ));
        agent.start().unwrap();
        assert!(matches!(
            agent.refresh_config_now().await,
            Err(AgentError::CentralConfigDisabled)
        ));
        agent.stop(Duration::from_secs(1)).await.unwrap();
    }
}
