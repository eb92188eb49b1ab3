// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;
use tokio::time::Instant;

/// Lower bound applied to any `max-age` the collector advertises.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Exponential backoff policy applied after failed fetches.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(5 * 60),
            factor: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay after `failures` consecutive failures (`failures >= 1`).
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32);
        #[allow(clippy::cast_possible_wrap)]
        let secs = self.base.as_secs_f64() * self.factor.powi(exponent as i32);
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }
}

/// Bookkeeping for the central configuration poll loop.
#[derive(Debug)]
pub struct FetchState {
    etag: Option<String>,
    last_success: Option<Instant>,
    next_fetch: Instant,
    consecutive_failures: u32,
    backoff: BackoffConfig,
    default_interval: Duration,
}

impl FetchState {
    /// The first fetch is due immediately.
    #[must_use]
    pub fn new(backoff: BackoffConfig, default_interval: Duration) -> Self {
        Self {
            etag: None,
            last_success: None,
            next_fetch: Instant::now(),
            consecutive_failures: 0,
            backoff,
            default_interval,
        }
    }

    #[must_use]
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    #[must_use]
    pub fn last_success(&self) -> Option<Instant> {
        self.last_success
    }

    #[must_use]
    pub fn next_fetch(&self) -> Instant {
        self.next_fetch
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Records a `200` carrying a new configuration. Its validator replaces the
    /// previous one, even when the response had none.
    pub fn record_modified(&mut self, etag: Option<String>, max_age: Option<Duration>) -> Duration {
        self.etag = etag;
        self.schedule_after_success(max_age)
    }

    /// Records a `304`; the current validator stays valid.
    pub fn record_not_modified(&mut self, max_age: Option<Duration>) -> Duration {
        self.schedule_after_success(max_age)
    }

    fn schedule_after_success(&mut self, max_age: Option<Duration>) -> Duration {
        let now = Instant::now();
        self.last_success = Some(now);
        self.consecutive_failures = 0;
        let interval = max_age
            .unwrap_or(self.default_interval)
            .max(MIN_POLL_INTERVAL);
        self.next_fetch = now + interval;
        interval
    }

    /// Records a failed fetch and returns the backoff delay before the next one.
    pub fn record_failure(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let delay = self.backoff.delay(self.consecutive_failures);
        self.next_fetch = Instant::now() + delay;
        delay
    }
}
