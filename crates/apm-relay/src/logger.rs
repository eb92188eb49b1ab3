// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log output of the relay.
//!
//! Lines carry the relay prefix, the service the relay reports for and the level.
//! Events from other crates (reqwest, h2) also name their target:
//!
//! ```text
//! APM_RELAY | checkout | WARN | APM | Dropping batch of 10 events: ...
//! APM_RELAY | checkout | DEBUG | [reqwest::connect] starting new connection
//! ```
//!
//! The level filter sits behind a reload handle so a `log_level` published by
//! central configuration takes effect without restarting.

use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext,
};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{reload, EnvFilter, Registry};

use apm_agent_core::config::LogLevel;

const LIBRARY_TARGET: &str = "apm_agent_core";
const RELAY_TARGET: &str = "apm_relay";

/// Handle used to swap the level filter at runtime.
pub type LevelHandle = reload::Handle<EnvFilter, Registry>;

pub fn env_filter(level: LogLevel) -> Result<EnvFilter, tracing_subscriber::filter::ParseError> {
    EnvFilter::try_new(format!(
        "h2=off,hyper=off,rustls=off,{}",
        level.as_filter_directive()
    ))
}

/// Installs the global subscriber and returns the handle to its level filter.
pub fn install(level: LogLevel, service: String) -> anyhow::Result<LevelHandle> {
    let (filter, handle) = reload::Layer::new(env_filter(level)?);
    let subscriber = Registry::default().with(filter).with(
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .event_format(Formatter::new(service)),
    );
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(handle)
}

#[derive(Debug, Clone)]
pub struct Formatter {
    service: String,
}

impl Formatter {
    #[must_use]
    pub fn new(service: String) -> Self {
        Self { service }
    }
}

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(
            &mut writer,
            "APM_RELAY | {} | {} | ",
            self.service,
            metadata.level()
        )?;
        let target = metadata.target();
        if !target.starts_with(LIBRARY_TARGET) && !target.starts_with(RELAY_TARGET) {
            write!(writer, "[{target}] ")?;
        }
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
