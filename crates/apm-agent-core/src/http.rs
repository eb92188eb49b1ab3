// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client construction shared by the transport and the central config client.
//!
//! With the `fips` feature the client uses the process-wide rustls provider, which
//! must be FIPS-compliant and installed before the agent starts. Otherwise reqwest's
//! bundled rustls stack is used.

use core::time::Duration;
use reqwest::ClientBuilder;
use thiserror::Error;
use tracing::error;
#[cfg(feature = "fips")]
use tracing::debug;

use crate::config::ConfigSnapshot;
use crate::redact::redact_url;

/// Idle pooled connections are closed before typical load balancer timeouts.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(270);
const TCP_KEEPALIVE: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum HttpClientError {
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("invalid proxy {proxy}: {source}")]
    Proxy {
        proxy: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

#[cfg(not(feature = "fips"))]
pub fn create_client_builder() -> Result<ClientBuilder, HttpClientError> {
    Ok(reqwest::Client::builder().use_rustls_tls())
}

/// Builds a client restricted to the pre-installed FIPS crypto provider and the
/// native root certificates.
#[cfg(feature = "fips")]
pub fn create_client_builder() -> Result<ClientBuilder, HttpClientError> {
    let provider = rustls::crypto::CryptoProvider::get_default()
        .ok_or_else(|| HttpClientError::Tls("no crypto provider installed".to_string()))?;
    if !provider.fips() {
        return Err(HttpClientError::Tls(
            "crypto provider is not FIPS-compliant".to_string(),
        ));
    }

    let mut roots = rustls::RootCertStore::empty();
    let mut valid = 0usize;
    for cert in rustls_native_certs::load_native_certs().certs {
        match roots.add(cert) {
            Ok(()) => valid += 1,
            Err(e) => debug!("APM | Skipping unparsable root certificate: {e:?}"),
        }
    }
    if valid == 0 {
        return Err(HttpClientError::Tls(
            "no valid certificates in the native root store".to_string(),
        ));
    }

    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .map_err(|e| HttpClientError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    if !config.fips() {
        return Err(HttpClientError::Tls(
            "resulting TLS configuration is not FIPS-compliant".to_string(),
        ));
    }
    debug!("APM | HTTP client configured with FIPS TLS");
    Ok(reqwest::Client::builder().use_preconfigured_tls(config))
}

/// Builds a client with a per-request `timeout` and an optional HTTPS proxy.
pub fn build_client(
    proxy_url: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client, HttpClientError> {
    let mut builder = create_client_builder()?
        .timeout(timeout)
        .pool_idle_timeout(Some(POOL_IDLE_TIMEOUT))
        .tcp_keepalive(Some(TCP_KEEPALIVE));
    if let Some(proxy) = proxy_url {
        let proxy_setting =
            reqwest::Proxy::https(proxy).map_err(|source| HttpClientError::Proxy {
                proxy: redact_url(proxy).into_owned(),
                source,
            })?;
        builder = builder.proxy(proxy_setting);
    }
    Ok(builder.build()?)
}

/// Returns a client for `snapshot`, falling back to a direct connection when the
/// proxy is unusable.
pub fn client_for(snapshot: &ConfigSnapshot) -> Result<reqwest::Client, HttpClientError> {
    match build_client(snapshot.proxy_https.as_deref(), snapshot.server_timeout) {
        Err(HttpClientError::Proxy { proxy, source }) => {
            error!(
                "APM | Unable to use proxy {proxy}: {source}, falling back to direct connection"
            );
            build_client(None, snapshot.server_timeout)
        }
        other => other,
    }
}

#[cfg(all(test, not(feature = "fips")))]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_build_client_without_proxy() {
        assert!(build_client(None, Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_build_client_with_proxy() {
        assert!(build_client(Some("http://proxy.local:3128"), Duration::from_secs(1)).is_ok());
    }

    #[test]
    #[traced_test]
    fn test_client_for_falls_back_on_bad_proxy() {
        let snapshot = ConfigSnapshot {
            proxy_https: Some("http://user:secret@[::1".to_string()),
            ..ConfigSnapshot::default()
        };
        assert!(client_for(&snapshot).is_ok());
        assert!(logs_contain("falling back to direct connection"));
        assert!(!logs_contain("secret"));
    }
}
