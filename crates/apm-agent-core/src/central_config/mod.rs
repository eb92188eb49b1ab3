// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Central configuration poll loop.
//!
//! The fetcher runs as a single background task:
//!
//! 1. Sleep until the next fetch is due, or until [`CentralConfigHandle::refresh_now`]
//!    asks for an immediate fetch.
//! 2. `GET /config/v1/agents` with `If-None-Match` once an ETag is known.
//! 3. On `304`, keep the active snapshot and reschedule from `max-age`.
//! 4. On `200`, merge the valid keys over the local snapshot and publish it.
//! 5. On any failure, keep the active snapshot and back off exponentially.
//!
//! Cancellation is observed while waiting; an in-flight request completes (it is
//! bounded by the request timeout) before the loop exits.

pub mod apply;
pub mod client;
pub mod state;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::store::ConfigStore;
use client::{CentralConfigClient, FetchError, FetchResponse};
use state::{BackoffConfig, FetchState};

/// Refresh requests queued beyond this are rejected.
const REFRESH_QUEUE_CAPACITY: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new snapshot was published.
    Applied {
        etag: Option<String>,
        central_keys: Vec<String>,
        rejected_keys: Vec<String>,
    },
    /// The collector answered `304`; the active snapshot is unchanged.
    NotModified,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error("central config fetch failed: {0}")]
    Fetch(String),
    #[error("central config fetcher is not running")]
    Stopped,
    #[error("too many pending central config refresh requests")]
    Busy,
}

struct RefreshRequest {
    completion: oneshot::Sender<Result<RefreshOutcome, RefreshError>>,
}

/// Cloneable handle used to wake the fetcher.
#[derive(Debug, Clone)]
pub struct CentralConfigHandle {
    requests: mpsc::Sender<RefreshRequest>,
}

impl std::fmt::Debug for RefreshRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshRequest").finish_non_exhaustive()
    }
}

impl CentralConfigHandle {
    /// Fetches immediately and resolves with the outcome of that fetch.
    pub async fn refresh_now(&self) -> Result<RefreshOutcome, RefreshError> {
        let (completion, result) = oneshot::channel();
        self.requests
            .try_send(RefreshRequest { completion })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => RefreshError::Busy,
                mpsc::error::TrySendError::Closed(_) => RefreshError::Stopped,
            })?;
        result.await.map_err(|_| RefreshError::Stopped)?
    }
}

pub struct CentralConfigFetcher {
    client: CentralConfigClient,
    store: Arc<ConfigStore>,
    state: FetchState,
    requests: mpsc::Receiver<RefreshRequest>,
}

impl CentralConfigFetcher {
    #[must_use]
    pub fn new(
        client: CentralConfigClient,
        store: Arc<ConfigStore>,
        backoff: BackoffConfig,
    ) -> (Self, CentralConfigHandle) {
        let (tx, rx) = mpsc::channel(REFRESH_QUEUE_CAPACITY);
        let default_interval = store.local().central_config_default_interval;
        let fetcher = Self {
            client,
            store,
            state: FetchState::new(backoff, default_interval),
            requests: rx,
        };
        (fetcher, CentralConfigHandle { requests: tx })
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        debug!("central-config poller started");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("central-config poller shutting down");
                    break;
                }
                Some(request) = self.requests.recv() => {
                    debug!("central-config refresh requested");
                    let outcome = self.refresh().await;
                    let _ = request.completion.send(outcome);
                }
                () = sleep_until(self.state.next_fetch()) => {
                    let _ = self.refresh().await;
                }
            }
        }
    }

    async fn refresh(&mut self) -> Result<RefreshOutcome, RefreshError> {
        let local = self.store.local();
        match self.client.fetch(&local, self.state.etag()).await {
            Ok(FetchResponse::NotModified { max_age }) => {
                let interval = self.state.record_not_modified(max_age);
                debug!("central-config not modified, next fetch in {interval:?}");
                Ok(RefreshOutcome::NotModified)
            }
            Ok(FetchResponse::Modified {
                etag,
                max_age,
                values,
            }) => {
                let (snapshot, rejected) = apply::merge(&local, etag.clone(), &values);
                let central_keys = snapshot.central_keys.clone();
                self.store.publish(snapshot);
                let interval = self.state.record_modified(etag.clone(), max_age);
                info!(
                    "central-config applied keys {central_keys:?} (etag {etag:?}), next fetch in {interval:?}"
                );
                Ok(RefreshOutcome::Applied {
                    etag,
                    central_keys,
                    rejected_keys: rejected.into_iter().map(|r| r.key).collect(),
                })
            }
            Err(e) => {
                let delay = self.state.record_failure();
                self.log_failure(&e, delay);
                Err(RefreshError::Fetch(e.to_string()))
            }
        }
    }

    fn log_failure(&self, error: &FetchError, delay: Duration) {
        let failures = self.state.consecutive_failures();
        match error {
            FetchError::Unauthorized(_) => {
                error!(%error, failures, "central-config fetch rejected, retrying in {delay:?}");
            }
            _ if failures == 1 => {
                warn!(%error, "central-config fetch failed, retrying in {delay:?}");
            }
            _ => {
                debug!(%error, failures, "central-config fetch failed, retrying in {delay:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigOrigin, ConfigSnapshot};
    use mockito::Matcher;
    use tokio::task::JoinHandle;

    fn start(
        server_url: String,
    ) -> (
        Arc<ConfigStore>,
        CentralConfigHandle,
        CancellationToken,
        JoinHandle<()>,
    ) {
        let store = Arc::new(ConfigStore::new(ConfigSnapshot {
            server_url,
            service_name: "svc".to_string(),
            transaction_sample_rate: 0.9,
            ..ConfigSnapshot::default()
        }));
        let (fetcher, handle) = CentralConfigFetcher::new(
            CentralConfigClient::with_client(reqwest::Client::new()),
            Arc::clone(&store),
            BackoffConfig::default(),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(fetcher.run(cancel.clone()));
        (store, handle, cancel, task)
    }

    #[tokio::test]
    async fn test_refresh_now_applies_then_not_modified() {
        let mut server = mockito::Server::new_async().await;
        let modified = server
            .mock("GET", "/config/v1/agents")
            .match_query(Matcher::Any)
            .match_header("if-none-match", Matcher::Missing)
            .with_status(200)
            .with_header("etag", "\"abc\"")
            .with_header("cache-control", "max-age=300")
            .with_body(r#"{"transaction_sample_rate":"0.1"}"#)
            .expect(1)
            .create_async()
            .await;
        let not_modified = server
            .mock("GET", "/config/v1/agents")
            .match_query(Matcher::Any)
            .match_header("if-none-match", "\"abc\"")
            .with_status(304)
            .with_header("cache-control", "max-age=300")
            .expect(1)
            .create_async()
            .await;

        let (store, handle, cancel, task) = start(server.url());

        // Refresh requests are served ahead of the scheduled fetch.
        let first = handle.refresh_now().await.unwrap();
        let snapshot = store.current();
        assert!((snapshot.transaction_sample_rate - 0.1).abs() < f64::EPSILON);
        assert_eq!(
            snapshot.origin,
            ConfigOrigin::Central {
                etag: Some("\"abc\"".to_string())
            }
        );
        assert_eq!(
            first,
            RefreshOutcome::Applied {
                etag: Some("\"abc\"".to_string()),
                central_keys: vec!["transaction_sample_rate".to_string()],
                rejected_keys: vec![],
            }
        );

        let second = handle.refresh_now().await.unwrap();
        assert_eq!(second, RefreshOutcome::NotModified);
        // 304 leaves the published snapshot untouched.
        assert!(Arc::ptr_eq(&snapshot, &store.current()));

        modified.assert_async().await;
        not_modified.assert_async().await;
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_snapshot() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/config/v1/agents")
            .match_query(Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let (store, handle, cancel, task) = start(server.url());
        let before = store.current();
        let result = handle.refresh_now().await;
        assert!(matches!(result, Err(RefreshError::Fetch(_))));
        assert!(Arc::ptr_eq(&before, &store.current()));
        assert_eq!(store.current().origin, ConfigOrigin::Local);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(handle.refresh_now().await, Err(RefreshError::Stopped));
    }

    #[tokio::test]
    async fn test_removed_key_reverts() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("GET", "/config/v1/agents")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("etag", "\"1\"")
            .with_body(r#"{"transaction_sample_rate":"0.2","recording":"false"}"#)
            .create_async()
            .await;

        let (store, handle, cancel, task) = start(server.url());
        handle.refresh_now().await.unwrap();
        assert!(!store.current().recording);
        first.remove_async().await;

        server
            .mock("GET", "/config/v1/agents")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("etag", "\"2\"")
            .with_body(r#"{"recording":"false"}"#)
            .create_async()
            .await;
        let outcome = handle.refresh_now().await.unwrap();
        assert_eq!(
            outcome,
            RefreshOutcome::Applied {
                etag: Some("\"2\"".to_string()),
                central_keys: vec!["recording".to_string()],
                rejected_keys: vec![],
            }
        );
        let snapshot = store.current();
        assert!(!snapshot.recording);
        assert!((snapshot.transaction_sample_rate - 0.9).abs() < f64::EPSILON);

        cancel.cancel();
        task.await.unwrap();
    }
}
