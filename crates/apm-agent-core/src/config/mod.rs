// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent configuration snapshots.
//!
//! A [`ConfigSnapshot`] is an immutable, fully populated record of every tunable.
//! Snapshots are produced by the local loader ([`ConfigSnapshot::from_env`]) or by
//! the central configuration fetcher, and published through the [`store::ConfigStore`].
//! They are replaced, never mutated in place.
//!
//! ## Precedence
//!
//! 1. **Defaults** - hard-coded in [`ConfigSnapshot::default`]
//! 2. **Environment** - `APM_*` variables
//! 3. **Central configuration** - validated keys from the collector, merged over 1+2
//!
//! Keys that disappear from a later central response fall back to 1+2, never to an
//! earlier central value.

pub mod settings;
pub mod store;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error};

use crate::redact::{redact_url, REDACTED};

pub const DEFAULT_SERVER_URL: &str = "http://localhost:8200";
pub const DEFAULT_SERVICE_NAME: &str = "unknown-service";
pub const DEFAULT_MAX_QUEUE_EVENT_COUNT: usize = 1000;
pub const DEFAULT_MAX_QUEUE_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_BATCH_EVENT_COUNT: usize = 10;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);
/// Polling cadence used when the collector sends no `Cache-Control: max-age`.
pub const DEFAULT_CENTRAL_CONFIG_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Where the active snapshot came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigOrigin {
    /// Defaults plus the local environment.
    #[default]
    Local,
    /// Local values with central overrides merged on top.
    Central {
        /// Cache-validation token of the response that produced the snapshot.
        etag: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureBody {
    #[default]
    Off,
    Errors,
    Transactions,
    All,
}

impl FromStr for CaptureBody {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(CaptureBody::Off),
            "errors" => Ok(CaptureBody::Errors),
            "transactions" => Ok(CaptureBody::Transactions),
            "all" => Ok(CaptureBody::All),
            other => Err(format!(
                "expected one of off, errors, transactions, all; got {other:?}"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
    Off,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    #[must_use]
    pub const fn as_filter_directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
            LogLevel::Off => "off",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" | "information" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            "off" | "none" => Ok(LogLevel::Off),
            other => Err(format!("unknown log level {other:?}")),
        }
    }
}

#[derive(Clone, PartialEq)]
pub struct ConfigSnapshot {
    pub service_name: String,
    pub service_version: Option<String>,
    pub environment: Option<String>,
    /// Collector base URL, without a trailing slash.
    pub server_url: String,
    pub api_key: Option<String>,
    pub secret_token: Option<String>,
    pub proxy_https: Option<String>,
    /// Master switch, only settable locally.
    pub enabled: bool,
    /// Runtime switch, centrally configurable.
    pub recording: bool,
    pub max_queue_event_count: usize,
    /// Budget for the serialized size of all queued events.
    pub max_queue_bytes: usize,
    pub max_batch_event_count: usize,
    /// Maximum time a batch stays open after its first event was queued.
    pub flush_interval: Duration,
    /// Per-request timeout for the collector and central config endpoints.
    pub server_timeout: Duration,
    /// Time allowed for the final drain on shutdown.
    pub shutdown_grace_period: Duration,
    /// zstd level for intake payloads; `0` sends uncompressed bodies.
    pub compression_level: i32,
    pub central_config: bool,
    pub central_config_default_interval: Duration,
    pub log_level: LogLevel,
    pub transaction_sample_rate: f64,
    /// `-1` means unlimited.
    pub transaction_max_spans: i32,
    pub capture_body: CaptureBody,
    pub capture_headers: bool,
    pub stack_trace_limit: i32,
    pub span_stack_trace_min_duration: Duration,
    pub exit_span_min_duration: Duration,
    pub sanitize_field_names: Vec<String>,
    pub ignore_message_queues: Vec<String>,
    pub origin: ConfigOrigin,
    /// Keys whose value came from central configuration, sorted.
    pub central_keys: Vec<String>,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            service_version: None,
            environment: None,
            server_url: DEFAULT_SERVER_URL.to_string(),
            api_key: None,
            secret_token: None,
            proxy_https: None,
            enabled: true,
            recording: true,
            max_queue_event_count: DEFAULT_MAX_QUEUE_EVENT_COUNT,
            max_queue_bytes: DEFAULT_MAX_QUEUE_BYTES,
            max_batch_event_count: DEFAULT_MAX_BATCH_EVENT_COUNT,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            server_timeout: DEFAULT_SERVER_TIMEOUT,
            shutdown_grace_period: DEFAULT_SHUTDOWN_GRACE_PERIOD,
            compression_level: 0,
            central_config: true,
            central_config_default_interval: DEFAULT_CENTRAL_CONFIG_INTERVAL,
            log_level: LogLevel::default(),
            transaction_sample_rate: 1.0,
            transaction_max_spans: 500,
            capture_body: CaptureBody::default(),
            capture_headers: true,
            stack_trace_limit: 50,
            span_stack_trace_min_duration: Duration::from_millis(5),
            exit_span_min_duration: Duration::ZERO,
            sanitize_field_names: [
                "password",
                "passwd",
                "pwd",
                "secret",
                "*key",
                "*token*",
                "*session*",
                "*credit*",
                "*card*",
                "authorization",
                "set-cookie",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
            ignore_message_queues: Vec::new(),
            origin: ConfigOrigin::Local,
            central_keys: Vec::new(),
        }
    }
}

impl fmt::Debug for ConfigSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secret = |value: &Option<String>| value.as_ref().map(|_| REDACTED);
        f.debug_struct("ConfigSnapshot")
            .field("service_name", &self.service_name)
            .field("service_version", &self.service_version)
            .field("environment", &self.environment)
            .field("server_url", &redact_url(&self.server_url))
            .field("api_key", &secret(&self.api_key))
            .field("secret_token", &secret(&self.secret_token))
            .field(
                "proxy_https",
                &self.proxy_https.as_deref().map(redact_url),
            )
            .field("enabled", &self.enabled)
            .field("recording", &self.recording)
            .field("max_queue_event_count", &self.max_queue_event_count)
            .field("max_queue_bytes", &self.max_queue_bytes)
            .field("max_batch_event_count", &self.max_batch_event_count)
            .field("flush_interval", &self.flush_interval)
            .field("server_timeout", &self.server_timeout)
            .field("shutdown_grace_period", &self.shutdown_grace_period)
            .field("compression_level", &self.compression_level)
            .field("central_config", &self.central_config)
            .field(
                "central_config_default_interval",
                &self.central_config_default_interval,
            )
            .field("log_level", &self.log_level)
            .field("transaction_sample_rate", &self.transaction_sample_rate)
            .field("transaction_max_spans", &self.transaction_max_spans)
            .field("capture_body", &self.capture_body)
            .field("capture_headers", &self.capture_headers)
            .field("stack_trace_limit", &self.stack_trace_limit)
            .field(
                "span_stack_trace_min_duration",
                &self.span_stack_trace_min_duration,
            )
            .field("exit_span_min_duration", &self.exit_span_min_duration)
            .field("sanitize_field_names", &self.sanitize_field_names)
            .field("ignore_message_queues", &self.ignore_message_queues)
            .field("origin", &self.origin)
            .field("central_keys", &self.central_keys)
            .finish()
    }
}

impl ConfigSnapshot {
    /// Loads the local snapshot from `APM_*` process environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_env_iter(std::env::vars())
    }

    /// Loads the local snapshot from an arbitrary variable source.
    ///
    /// Invalid values are logged and the default is kept, so loading never fails.
    pub fn from_env_iter<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let mut snapshot = Self::default();
        for setting in settings::SETTINGS {
            let Some(value) = vars.get(setting.env) else {
                continue;
            };
            if let Err(e) = setting.apply(&mut snapshot, value) {
                error!("APM | Ignoring {}: {e}", setting.env);
            }
        }

        // HTTPS_PROXY is honoured the same way the HTTP client stack does.
        if snapshot.proxy_https.is_none() {
            if let Some(proxy) = vars.get("HTTPS_PROXY").filter(|p| !p.trim().is_empty()) {
                snapshot.proxy_https = Some(proxy.trim().to_string());
            }
        }

        debug!("APM | Loaded local configuration: {snapshot:?}");
        snapshot
    }

    /// Returns true when events should currently be accepted.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.enabled && self.recording
    }

    #[must_use]
    pub fn is_central(&self) -> bool {
        matches!(self.origin, ConfigOrigin::Central { .. })
    }
}
