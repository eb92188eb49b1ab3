// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded event queue shared by producers and the batch flusher.
//!
//! Producers never block: an event that does not fit is dropped and counted.
//! The flusher is woken when data arrives and again when the queue reaches the
//! batch watermark.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::config::store::ConfigStore;
use crate::counters::DeliveryCounters;
use crate::event::{Event, EventKind};
use crate::filters::FilterRegistry;

/// Drops are logged for the first occurrence and then once every this many.
const DROP_LOG_SAMPLE_RATE: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// `enabled` is false in the active snapshot.
    Disabled,
    /// `recording` is false in the active snapshot.
    NotRecording,
    /// The queue was closed by shutdown.
    Closed,
    /// A filter returned `None`.
    Filtered,
    /// The event payload could not be serialized.
    Serialization,
    /// The queue is at its event count or byte budget.
    QueueFull,
}

impl DropReason {
    pub const COUNT: usize = 6;

    pub const ALL: [DropReason; Self::COUNT] = [
        DropReason::Disabled,
        DropReason::NotRecording,
        DropReason::Closed,
        DropReason::Filtered,
        DropReason::Serialization,
        DropReason::QueueFull,
    ];

    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            DropReason::Disabled => 0,
            DropReason::NotRecording => 1,
            DropReason::Closed => 2,
            DropReason::Filtered => 3,
            DropReason::Serialization => 4,
            DropReason::QueueFull => 5,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            DropReason::Disabled => "agent disabled",
            DropReason::NotRecording => "not recording",
            DropReason::Closed => "queue closed",
            DropReason::Filtered => "filtered",
            DropReason::Serialization => "serialization failed",
            DropReason::QueueFull => "queue full",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    Dropped(DropReason),
}

impl EnqueueOutcome {
    #[must_use]
    pub fn is_enqueued(self) -> bool {
        matches!(self, EnqueueOutcome::Enqueued)
    }
}

/// An event serialized to one NDJSON line at enqueue time.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    kind: EventKind,
    line: Vec<u8>,
    enqueued_at: Instant,
}

impl QueueEntry {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// The serialized line, newline included.
    #[must_use]
    pub fn line(&self) -> &[u8] {
        &self.line
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.line.len()
    }

    #[must_use]
    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    #[cfg(test)]
    pub(crate) fn for_test(event: Event) -> Self {
        Self {
            kind: event.kind(),
            line: event.to_ndjson_line().expect("test event serializes"),
            enqueued_at: Instant::now(),
        }
    }
}

/// A closed, non-empty run of entries in FIFO order.
#[derive(Debug, Clone)]
pub struct Batch {
    entries: Vec<QueueEntry>,
    size_bytes: usize,
}

impl Batch {
    /// Returns `None` for an empty entry list; a batch always holds at least one entry.
    #[must_use]
    pub fn new(entries: Vec<QueueEntry>) -> Option<Self> {
        if entries.is_empty() {
            return None;
        }
        let size_bytes = entries.iter().map(QueueEntry::size_bytes).sum();
        Some(Self {
            entries,
            size_bytes,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    #[must_use]
    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    /// Number of entries per kind, indexed by [`EventKind::index`].
    #[must_use]
    pub fn counts_by_kind(&self) -> [u64; 4] {
        let mut counts = [0; 4];
        for entry in &self.entries {
            counts[entry.kind.index()] += 1;
        }
        counts
    }
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<QueueEntry>,
    size_bytes: usize,
    closed: bool,
}

pub struct EventQueue {
    state: Mutex<QueueState>,
    max_events: usize,
    max_bytes: usize,
    store: Arc<ConfigStore>,
    filters: Arc<FilterRegistry>,
    counters: Arc<DeliveryCounters>,
    data: Notify,
    watermark: Notify,
}

impl EventQueue {
    /// Creates a queue sized from the store's current snapshot.
    #[must_use]
    pub fn new(
        store: Arc<ConfigStore>,
        filters: Arc<FilterRegistry>,
        counters: Arc<DeliveryCounters>,
    ) -> Self {
        let snapshot = store.current();
        Self {
            state: Mutex::new(QueueState::default()),
            max_events: snapshot.max_queue_event_count,
            max_bytes: snapshot.max_queue_bytes,
            store,
            filters,
            counters,
            data: Notify::new(),
            watermark: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Filters, serializes and appends `event` without blocking.
    pub fn try_enqueue(&self, event: Event) -> EnqueueOutcome {
        let kind = event.kind();
        let snapshot = self.store.current();
        if !snapshot.enabled {
            return self.dropped(kind, DropReason::Disabled);
        }
        if !snapshot.recording {
            return self.dropped(kind, DropReason::NotRecording);
        }

        let Some(event) = self.filters.apply(event) else {
            return self.dropped(kind, DropReason::Filtered);
        };
        // Filters may rewrite the event into another kind.
        let kind = event.kind();
        let line = match event.to_ndjson_line() {
            Ok(line) => line,
            Err(e) => {
                trace!("APM | Failed to serialize {kind}: {e}");
                return self.dropped(kind, DropReason::Serialization);
            }
        };
        let entry = QueueEntry {
            kind,
            line,
            enqueued_at: Instant::now(),
        };
        self.push(entry, snapshot.max_batch_event_count)
    }

    /// Appends an already serialized entry.
    fn push(&self, entry: QueueEntry, watermark: usize) -> EnqueueOutcome {
        let kind = entry.kind;
        let len = {
            let mut state = self.lock();
            if state.closed {
                drop(state);
                return self.dropped(kind, DropReason::Closed);
            }
            if state.entries.len() >= self.max_events
                || state.size_bytes + entry.size_bytes() > self.max_bytes
            {
                drop(state);
                return self.dropped(kind, DropReason::QueueFull);
            }
            state.size_bytes += entry.size_bytes();
            state.entries.push_back(entry);
            state.entries.len()
        };

        self.counters.record_enqueued(kind);
        self.data.notify_one();
        if len >= watermark {
            self.watermark.notify_one();
        }
        EnqueueOutcome::Enqueued
    }

    fn dropped(&self, kind: EventKind, reason: DropReason) -> EnqueueOutcome {
        let total = self.counters.record_dropped(kind, reason);
        if total == 1 || total % DROP_LOG_SAMPLE_RATE == 0 {
            warn!("APM | Dropped {kind} ({reason}), {total} dropped for this reason so far");
        }
        EnqueueOutcome::Dropped(reason)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.lock().size_bytes
    }

    /// Enqueue instant of the oldest entry still queued.
    #[must_use]
    pub fn oldest_enqueued_at(&self) -> Option<Instant> {
        self.lock().entries.front().map(QueueEntry::enqueued_at)
    }

    /// Removes up to `max` entries from the front of the queue.
    pub fn drain_batch(&self, max: usize) -> Option<Batch> {
        let entries: Vec<QueueEntry> = {
            let mut state = self.lock();
            let take = max.max(1).min(state.entries.len());
            let entries: Vec<QueueEntry> = state.entries.drain(..take).collect();
            state.size_bytes -= entries.iter().map(QueueEntry::size_bytes).sum::<usize>();
            entries
        };
        Batch::new(entries)
    }

    /// Rejects every later enqueue. Entries already queued stay drainable.
    pub fn close(&self) {
        self.lock().closed = true;
        self.data.notify_waiters();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Resolves once an entry has been queued since the last wakeup.
    pub fn data_notified(&self) -> Notified<'_> {
        self.data.notified()
    }

    /// Resolves once the queue reached the batch watermark since the last wakeup.
    pub fn watermark_notified(&self) -> Notified<'_> {
        self.watermark.notified()
    }

    #[must_use]
    pub fn counters(&self) -> &Arc<DeliveryCounters> {
        &self.counters
    }
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("EventQueue")
            .field("len", &state.entries.len())
            .field("size_bytes", &state.size_bytes)
            .field("closed", &state.closed)
            .field("max_events", &self.max_events)
            .field("max_bytes", &self.max_bytes)
            .finish_non_exhaustive()
    }
}
