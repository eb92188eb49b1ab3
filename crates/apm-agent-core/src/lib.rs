// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # APM Agent Core
//!
//! Telemetry delivery core of an application performance monitoring agent.
//!
//! ## Overview
//!
//! Instrumentation hands observability events to an [`agent::Agent`]. Each event
//! passes through a per-kind filter chain, is serialized into a bounded queue and is
//! shipped to the collector in NDJSON batches by a single background flusher.
//! Independently, a central configuration fetcher polls the collector and publishes
//! new configuration snapshots without restarting the agent.
//!
//! ```text
//! enqueue ─▶ FilterRegistry ─▶ EventQueue ─▶ BatchFlusher ─▶ Transport ─▶ collector
//!                                  ▲              ▲
//!                                  └─ ConfigStore ┘ ◀── CentralConfigFetcher
//! ```
//!
//! ## Architecture
//!
//! - [`agent`]: component wiring and the start/stop lifecycle
//! - [`config`]: configuration snapshots, the environment loader and the store
//! - [`filters`]: per-kind filter chains
//! - [`queue`]: the bounded event queue and batches
//! - [`flusher`]: the batching worker
//! - [`transport`]: authenticated HTTP delivery with a single retry
//! - [`central_config`]: the central configuration poll loop
//! - [`global`]: the optional process-wide default agent

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod agent;
pub mod central_config;
pub mod config;
pub mod counters;
pub mod event;
pub mod filters;
pub mod flusher;
pub mod global;
pub mod http;
pub mod queue;
pub mod redact;
pub mod transport;

pub use agent::{Agent, AgentError};
pub use config::ConfigSnapshot;
pub use event::{Event, EventKind};
