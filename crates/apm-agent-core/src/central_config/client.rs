// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Conditional GET against the collector's agent configuration endpoint.

use reqwest::header::{HeaderMap, CACHE_CONTROL, ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::ConfigSnapshot;
use crate::http::{client_for, HttpClientError};
use crate::redact::{redact_reqwest_error, redact_url};
use crate::transport::auth_header;

pub const CONFIG_PATH: &str = "/config/v1/agents";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid central config URL {0}")]
    InvalidUrl(String),
    #[error("central config request failed: {0}")]
    Network(String),
    #[error("central config endpoint refused the credentials with status {0}")]
    Unauthorized(u16),
    #[error("central config endpoint returned status {0}")]
    Status(u16),
    #[error("central config response is not a JSON object: {0}")]
    Body(String),
    #[error("invalid credentials: {0}")]
    Credentials(String),
    #[error(transparent)]
    Client(#[from] HttpClientError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchResponse {
    NotModified {
        max_age: Option<Duration>,
    },
    Modified {
        etag: Option<String>,
        max_age: Option<Duration>,
        values: Map<String, Value>,
    },
}

#[derive(Debug, Clone)]
pub struct CentralConfigClient {
    client: reqwest::Client,
}

impl CentralConfigClient {
    pub fn new(snapshot: &ConfigSnapshot) -> Result<Self, FetchError> {
        Ok(Self::with_client(client_for(snapshot)?))
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// `{server_url}/config/v1/agents?service.name=..&service.environment=..`
    pub fn url(snapshot: &ConfigSnapshot) -> Result<reqwest::Url, FetchError> {
        let raw = format!("{}{CONFIG_PATH}", snapshot.server_url);
        let mut url = reqwest::Url::parse(&raw)
            .map_err(|e| FetchError::InvalidUrl(format!("{}: {e}", redact_url(&raw))))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("service.name", &snapshot.service_name);
            if let Some(environment) = &snapshot.environment {
                query.append_pair("service.environment", environment);
            }
        }
        Ok(url)
    }

    pub async fn fetch(
        &self,
        snapshot: &ConfigSnapshot,
        etag: Option<&str>,
    ) -> Result<FetchResponse, FetchError> {
        let url = Self::url(snapshot)?;
        let mut request = self.client.get(url).timeout(snapshot.server_timeout);
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(auth) =
            auth_header(snapshot).map_err(|e| FetchError::Credentials(e.to_string()))?
        {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Network(redact_reqwest_error(e)))?;
        let status = response.status();
        let max_age = parse_max_age(response.headers());
        debug!("central-config response status {status}, max-age {max_age:?}");

        match status {
            StatusCode::NOT_MODIFIED => Ok(FetchResponse::NotModified { max_age }),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(FetchError::Unauthorized(status.as_u16()))
            }
            status if status.is_success() => {
                let etag = response
                    .headers()
                    .get(ETAG)
                    .and_then(|value| value.to_str().ok())
                    .map(ToString::to_string);
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| FetchError::Network(redact_reqwest_error(e)))?;
                let values = match serde_json::from_slice::<Value>(&body) {
                    Ok(Value::Object(values)) => values,
                    Ok(other) => return Err(FetchError::Body(format!("got {other}"))),
                    Err(e) => return Err(FetchError::Body(e.to_string())),
                };
                Ok(FetchResponse::Modified {
                    etag,
                    max_age,
                    values,
                })
            }
            status => Err(FetchError::Status(status.as_u16())),
        }
    }
}

/// Extracts `max-age` from `Cache-Control`, ignoring every other directive.
#[must_use]
pub fn parse_max_age(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .find_map(|directive| {
            let (name, seconds) = directive.trim().split_once('=')?;
            if !name.trim().eq_ignore_ascii_case("max-age") {
                return None;
            }
            seconds
                .trim()
                .trim_matches('"')
                .parse::<u64>()
                .ok()
                .map(Duration::from_secs)
        })
}
