// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Optional process-wide default agent.
//!
//! Instrumentation that cannot be handed an [`Agent`] explicitly reports through
//! these functions. Until [`init`] registers the default agent:
//!
//! - [`enqueue`] buffers up to [`MAX_PENDING_EVENTS`] events
//! - [`add_filter`] records static filters
//!
//! On [`init`] the static filters move into the agent's chains and the buffered
//! events are replayed through them. Registration happens at most once per process.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::{debug, warn};

use crate::agent::{Agent, AgentError};
use crate::event::{Event, EventKind};
use crate::filters::Filter;

/// Events offered before [`init`] beyond this are dropped.
pub const MAX_PENDING_EVENTS: usize = 1000;

static DEFAULT_AGENT: OnceLock<Arc<Agent>> = OnceLock::new();
static PENDING: Mutex<Pending> = Mutex::new(Pending {
    events: VecDeque::new(),
    filters: Vec::new(),
    dropped: 0,
});

struct Pending {
    events: VecDeque<Event>,
    filters: Vec<(EventKind, Filter)>,
    dropped: u64,
}

fn pending() -> MutexGuard<'static, Pending> {
    PENDING.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registers `agent` as the process-wide default.
///
/// The static filters are installed and the buffered events replayed before the
/// agent becomes visible to [`enqueue`], so no event bypasses the filters or
/// overtakes the buffered ones.
pub fn init(agent: Arc<Agent>) -> Result<(), AgentError> {
    // Held until the agent is published; `enqueue` and `add_filter` wait on it.
    let mut pending = pending();
    if DEFAULT_AGENT.get().is_some() {
        return Err(AgentError::AlreadyInitialized);
    }

    let filters = std::mem::take(&mut pending.filters);
    let filter_count = filters.len();
    for (kind, filter) in filters {
        agent.add_shared_filter(kind, filter);
    }
    let buffered = pending.events.len();
    let accepted = pending
        .events
        .drain(..)
        .map(|event| agent.enqueue(event))
        .filter(|queued| *queued)
        .count();
    let dropped = std::mem::take(&mut pending.dropped);

    DEFAULT_AGENT
        .set(agent)
        .map_err(|_| AgentError::AlreadyInitialized)?;
    drop(pending);

    debug!(
        "APM | Default agent initialized with {filter_count} static filters, replayed {accepted}/{buffered} buffered events"
    );
    if dropped > 0 {
        warn!("APM | {dropped} events were dropped before the default agent was initialized");
    }
    Ok(())
}

/// The default agent, once registered.
#[must_use]
pub fn agent() -> Option<Arc<Agent>> {
    DEFAULT_AGENT.get().cloned()
}

/// Offers `event` to the default agent, buffering it until [`init`].
pub fn enqueue(event: Event) -> bool {
    if let Some(agent) = DEFAULT_AGENT.get() {
        return agent.enqueue(event);
    }
    let mut pending = pending();
    // `init` may have completed while we waited for the lock.
    if let Some(agent) = DEFAULT_AGENT.get() {
        drop(pending);
        return agent.enqueue(event);
    }
    if pending.events.len() >= MAX_PENDING_EVENTS {
        pending.dropped += 1;
        return false;
    }
    pending.events.push_back(event);
    true
}

/// Registers a static filter applied once the default agent exists.
///
/// Returns `false` after [`init`]; later filters must be added on the agent itself.
pub fn add_filter<F>(kind: EventKind, filter: F) -> bool
where
    F: Fn(Event) -> Option<Event> + Send + Sync + 'static,
{
    let mut pending = pending();
    if DEFAULT_AGENT.get().is_some() {
        return false;
    }
    pending.filters.push((kind, Arc::new(filter)));
    true
}
