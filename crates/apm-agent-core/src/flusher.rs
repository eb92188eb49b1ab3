// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background worker turning the event queue into bounded batches.
//!
//! ```text
//!   Idle ──data──▶ Collecting ──count or age──▶ Sending ──▶ Idle
//!     │                │
//!     └─────stop───────┴──────────▶ Stopped (final drain)
//! ```
//!
//! A batch closes when the queue holds `max_batch_event_count` entries or when its
//! oldest entry has waited `flush_interval`. Batches are sent one at a time and a
//! batch that fails after the transport's retry is dropped.

use std::sync::Arc;
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::config::store::ConfigStore;
use crate::config::ConfigSnapshot;
use crate::counters::DeliveryCounters;
use crate::event::EventKind;
use crate::queue::{Batch, EventQueue};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlusherState {
    Idle,
    Collecting,
    Sending,
    Stopped,
}

pub struct BatchFlusher {
    queue: Arc<EventQueue>,
    store: Arc<ConfigStore>,
    transport: Arc<dyn Transport>,
    counters: Arc<DeliveryCounters>,
}

impl BatchFlusher {
    #[must_use]
    pub fn new(
        queue: Arc<EventQueue>,
        store: Arc<ConfigStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let counters = Arc::clone(queue.counters());
        Self {
            queue,
            store,
            transport,
            counters,
        }
    }

    /// Runs until `cancel` fires, then drains what is left within the grace period.
    pub async fn run(self, cancel: CancellationToken) {
        debug!("APM | Batch flusher started");
        let mut state = FlusherState::Idle;
        while state != FlusherState::Stopped {
            let next = match state {
                FlusherState::Idle => self.idle(&cancel).await,
                FlusherState::Collecting => self.collect(&cancel).await,
                FlusherState::Sending => self.send_next().await,
                FlusherState::Stopped => FlusherState::Stopped,
            };
            if next != state {
                trace!("APM | Batch flusher {state:?} -> {next:?}");
            }
            state = next;
        }
        self.shutdown().await;
        debug!("APM | Batch flusher stopped, {}", self.counters.snapshot());
    }

    async fn idle(&self, cancel: &CancellationToken) -> FlusherState {
        if cancel.is_cancelled() {
            return FlusherState::Stopped;
        }
        if !self.queue.is_empty() {
            return FlusherState::Collecting;
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => FlusherState::Stopped,
            () = self.queue.data_notified() => FlusherState::Collecting,
        }
    }

    async fn collect(&self, cancel: &CancellationToken) -> FlusherState {
        loop {
            if cancel.is_cancelled() {
                return FlusherState::Stopped;
            }
            let snapshot = self.store.current();
            if self.queue.len() >= snapshot.max_batch_event_count {
                return FlusherState::Sending;
            }
            let Some(oldest) = self.queue.oldest_enqueued_at() else {
                return FlusherState::Idle;
            };
            let deadline = oldest + snapshot.flush_interval;
            if Instant::now() >= deadline {
                return FlusherState::Sending;
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => return FlusherState::Stopped,
                () = self.queue.watermark_notified() => {}
                () = sleep_until(deadline) => return FlusherState::Sending,
            }
        }
    }

    async fn send_next(&self) -> FlusherState {
        let snapshot = self.store.current();
        if let Some(batch) = self.queue.drain_batch(snapshot.max_batch_event_count) {
            self.deliver(batch, &snapshot).await;
        }
        FlusherState::Idle
    }

    async fn deliver(&self, batch: Batch, snapshot: &ConfigSnapshot) {
        let counts = batch.counts_by_kind();
        match self.transport.send(&batch, snapshot).await {
            Ok(report) => {
                for kind in EventKind::ALL {
                    self.counters.record_sent(kind, counts[kind.index()]);
                }
                debug!(
                    "APM | Sent {} events ({} bytes) in {} attempt(s), status {}",
                    report.events, report.bytes, report.attempts, report.status
                );
            }
            Err(e) => {
                for kind in EventKind::ALL {
                    self.counters.record_failed(kind, counts[kind.index()]);
                }
                if e.is_auth() {
                    error!("APM | Dropping batch of {} events: {e}", batch.len());
                } else {
                    warn!("APM | Dropping batch of {} events: {e}", batch.len());
                }
            }
        }
    }

    /// Closes the queue and sends what remains until it is empty or the grace
    /// period elapses.
    async fn shutdown(&self) {
        self.queue.close();
        let snapshot = self.store.current();
        let deadline = Instant::now() + snapshot.shutdown_grace_period;
        while let Some(batch) = self.queue.drain_batch(snapshot.max_batch_event_count) {
            let len = batch.len();
            debug!("APM | Final flush of {len} events");
            if timeout_at(deadline, self.deliver(batch, &snapshot))
                .await
                .is_err()
            {
                let abandoned = len + self.queue.len();
                warn!(
                    "APM | Shutdown grace period of {:?} elapsed, abandoning {abandoned} events",
                    snapshot.shutdown_grace_period
                );
                return;
            }
        }
    }
}
