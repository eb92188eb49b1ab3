// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Observability events accepted from instrumentation.
//!
//! An [`Event`] serializes to exactly one line of the intake NDJSON format: the
//! variant name is the object key and the payload is the value, e.g.
//! `{"transaction":{"id":"abc","duration":12.5}}`.

use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Discriminator used for per-kind filter chains, counters and log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Transaction,
    Span,
    Error,
    Metricset,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Transaction,
        EventKind::Span,
        EventKind::Error,
        EventKind::Metricset,
    ];

    /// Stable index used by fixed-size per-kind tables.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            EventKind::Transaction => 0,
            EventKind::Span => 1,
            EventKind::Error => 2,
            EventKind::Metricset => 3,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EventKind::Transaction => "transaction",
            EventKind::Span => "span",
            EventKind::Error => "error",
            EventKind::Metricset => "metricset",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observability record produced by instrumentation.
///
/// The payload is opaque to the delivery pipeline; only its serialized size and
/// the kind matter once it is queued.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    Transaction(Value),
    Span(Value),
    Error(Value),
    Metricset(Value),
}

impl Event {
    #[must_use]
    pub fn new(kind: EventKind, payload: Value) -> Self {
        match kind {
            EventKind::Transaction => Event::Transaction(payload),
            EventKind::Span => Event::Span(payload),
            EventKind::Error => Event::Error(payload),
            EventKind::Metricset => Event::Metricset(payload),
        }
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Transaction(_) => EventKind::Transaction,
            Event::Span(_) => EventKind::Span,
            Event::Error(_) => EventKind::Error,
            Event::Metricset(_) => EventKind::Metricset,
        }
    }

    #[must_use]
    pub fn payload(&self) -> &Value {
        match self {
            Event::Transaction(payload)
            | Event::Span(payload)
            | Event::Error(payload)
            | Event::Metricset(payload) => payload,
        }
    }

    pub fn payload_mut(&mut self) -> &mut Value {
        match self {
            Event::Transaction(payload)
            | Event::Span(payload)
            | Event::Error(payload)
            | Event::Metricset(payload) => payload,
        }
    }

    /// Parses one intake line (`{"span":{...}}`) back into an event.
    ///
    /// Returns `None` when the line is not a single-key object naming a known kind.
    #[must_use]
    pub fn from_ndjson_line(line: &str) -> Option<Self> {
        let Value::Object(mut object) = serde_json::from_str::<Value>(line).ok()? else {
            return None;
        };
        if object.len() != 1 {
            return None;
        }
        let (key, payload) = object.iter_mut().next()?;
        let kind = EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == key.as_str())?;
        Some(Event::new(kind, payload.take()))
    }

    /// Serializes the event as one NDJSON line, including the trailing newline.
    pub fn to_ndjson_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}
