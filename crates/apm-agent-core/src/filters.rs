// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-kind filter chains applied to events right before they are queued.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{error, trace};

use crate::event::{Event, EventKind};

/// A transform over an event; returning `None` drops it.
pub type Filter = Arc<dyn Fn(Event) -> Option<Event> + Send + Sync>;

#[derive(Default)]
pub struct FilterRegistry {
    chains: [RwLock<Vec<Filter>>; 4],
}

impl FilterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `filter` to the chain for `kind`. Filters are never removed.
    pub fn add(&self, kind: EventKind, filter: Filter) {
        self.chains[kind.index()]
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(filter);
    }

    #[must_use]
    pub fn len(&self, kind: EventKind) -> usize {
        self.chains[kind.index()]
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        EventKind::ALL.into_iter().all(|kind| self.len(kind) == 0)
    }

    /// Runs the chain for the event's kind in registration order.
    ///
    /// The first filter returning `None` stops the chain. A filter that panics is
    /// skipped and the event it was given continues unchanged.
    pub fn apply(&self, event: Event) -> Option<Event> {
        let kind = event.kind();
        // Clone the chain so user code never runs under the lock.
        let chain: Vec<Filter> = self.chains[kind.index()]
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut event = event;
        for (position, filter) in chain.iter().enumerate() {
            let input = event.clone();
            match catch_unwind(AssertUnwindSafe(|| filter(input))) {
                Ok(Some(next)) => event = next,
                Ok(None) => {
                    trace!("APM | {kind} dropped by filter {position}");
                    return None;
                }
                Err(_) => {
                    error!("APM | {kind} filter {position} panicked, passing the event through unchanged");
                }
            }
        }
        Some(event)
    }
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for kind in EventKind::ALL {
            map.entry(&kind.as_str(), &self.len(kind));
        }
        map.finish()
    }
}
