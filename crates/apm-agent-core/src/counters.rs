// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-kind delivery counters.
//!
//! All counters use relaxed atomics; they are diagnostics, not synchronization.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::event::EventKind;
use crate::queue::DropReason;

#[derive(Debug, Default)]
struct KindCounters {
    enqueued: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    dropped: [AtomicU64; DropReason::COUNT],
}

#[derive(Debug, Default)]
pub struct DeliveryCounters {
    kinds: [KindCounters; 4],
}

impl DeliveryCounters {
    pub fn record_enqueued(&self, kind: EventKind) {
        self.kinds[kind.index()]
            .enqueued
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Records a drop and returns the number of drops for that reason so far,
    /// including this one.
    pub fn record_dropped(&self, kind: EventKind, reason: DropReason) -> u64 {
        self.kinds[kind.index()].dropped[reason.index()].fetch_add(1, Ordering::Relaxed);
        self.dropped_for_reason(reason)
    }

    pub fn record_sent(&self, kind: EventKind, count: u64) {
        self.kinds[kind.index()]
            .sent
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_failed(&self, kind: EventKind, count: u64) {
        self.kinds[kind.index()]
            .failed
            .fetch_add(count, Ordering::Relaxed);
    }

    fn dropped_for_reason(&self, reason: DropReason) -> u64 {
        self.kinds
            .iter()
            .map(|kind| kind.dropped[reason.index()].load(Ordering::Relaxed))
            .sum()
    }

    #[must_use]
    pub fn snapshot(&self) -> DeliverySnapshot {
        let mut snapshot = DeliverySnapshot::default();
        for kind in EventKind::ALL {
            let counters = &self.kinds[kind.index()];
            let out = &mut snapshot.kinds[kind.index()];
            out.enqueued = counters.enqueued.load(Ordering::Relaxed);
            out.sent = counters.sent.load(Ordering::Relaxed);
            out.failed = counters.failed.load(Ordering::Relaxed);
            for reason in DropReason::ALL {
                out.dropped[reason.index()] =
                    counters.dropped[reason.index()].load(Ordering::Relaxed);
            }
        }
        snapshot
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindSnapshot {
    pub enqueued: u64,
    pub sent: u64,
    pub failed: u64,
    pub dropped: [u64; DropReason::COUNT],
}

impl KindSnapshot {
    #[must_use]
    pub fn dropped_total(&self) -> u64 {
        self.dropped.iter().sum()
    }
}

/// Plain data representation of [`DeliveryCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySnapshot {
    kinds: [KindSnapshot; 4],
}

impl DeliverySnapshot {
    #[must_use]
    pub fn kind(&self, kind: EventKind) -> &KindSnapshot {
        &self.kinds[kind.index()]
    }

    #[must_use]
    pub fn dropped(&self, kind: EventKind, reason: DropReason) -> u64 {
        self.kinds[kind.index()].dropped[reason.index()]
    }

    #[must_use]
    pub fn total_enqueued(&self) -> u64 {
        self.kinds.iter().map(|k| k.enqueued).sum()
    }

    #[must_use]
    pub fn total_sent(&self) -> u64 {
        self.kinds.iter().map(|k| k.sent).sum()
    }

    #[must_use]
    pub fn total_dropped(&self) -> u64 {
        self.kinds.iter().map(KindSnapshot::dropped_total).sum()
    }
}

impl fmt::Display for DeliverySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, kind) in EventKind::ALL.into_iter().enumerate() {
            let counters = self.kind(kind);
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(
                f,
                "{kind}: enqueued={}, sent={}, failed={}, dropped={}",
                counters.enqueued,
                counters.sent,
                counters.failed,
                counters.dropped_total()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let counters = DeliveryCounters::default();
        counters.record_enqueued(EventKind::Span);
        counters.record_enqueued(EventKind::Span);
        counters.record_sent(EventKind::Span, 2);
        counters.record_failed(EventKind::Error, 3);
        assert_eq!(counters.record_dropped(EventKind::Span, DropReason::QueueFull), 1);
        assert_eq!(
            counters.record_dropped(EventKind::Transaction, DropReason::QueueFull),
            2
        );

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.kind(EventKind::Span).enqueued, 2);
        assert_eq!(snapshot.kind(EventKind::Span).sent, 2);
        assert_eq!(snapshot.kind(EventKind::Error).failed, 3);
        assert_eq!(snapshot.dropped(EventKind::Span, DropReason::QueueFull), 1);
        assert_eq!(snapshot.total_dropped(), 2);
        assert_eq!(snapshot.total_sent(), 2);
    }

    #[test]
    fn test_display() {
        let counters = DeliveryCounters::default();
        counters.record_enqueued(EventKind::Transaction);
        let text = counters.snapshot().to_string();
        assert!(text.starts_with("transaction: enqueued=1, sent=0, failed=0, dropped=0; span:"));
        assert!(text.contains("metricset: enqueued=0"));
    }
}
