// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde_json::{Map, Value};
use tracing::warn;

use crate::config::settings::{apply_central, SettingError};
use crate::config::{ConfigOrigin, ConfigSnapshot};

/// A central key that was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedKey {
    pub key: String,
    pub error: SettingError,
}

/// Converts a JSON value to the textual form the settings table parses.
fn setting_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(ToString::to_string))
            .collect::<Option<Vec<_>>>()
            .map(|items| items.join(",")),
        Value::Null | Value::Object(_) => None,
    }
}

/// Builds a new snapshot from `local` with every valid key of `values` applied.
///
/// Keys not present in `values` keep their local value, so a key removed
/// centrally reverts. Invalid and unknown keys are logged once each and skipped.
pub fn merge(
    local: &ConfigSnapshot,
    etag: Option<String>,
    values: &Map<String, Value>,
) -> (ConfigSnapshot, Vec<RejectedKey>) {
    let mut snapshot = local.clone();
    let mut applied = Vec::new();
    let mut rejected = Vec::new();

    for (key, value) in values {
        let result = match setting_value(value) {
            Some(text) => apply_central(&mut snapshot, key, &text),
            None => Err(SettingError::Invalid {
                key: key.clone(),
                value: value.to_string(),
                reason: "unsupported JSON type".to_string(),
            }),
        };
        match result {
            Ok(()) => applied.push(key.clone()),
            Err(error) => {
                warn!("central-config ignoring key: {error}");
                rejected.push(RejectedKey {
                    key: key.clone(),
                    error,
                });
            }
        }
    }

    applied.sort();
    snapshot.central_keys = applied;
    snapshot.origin = ConfigOrigin::Central { etag };
    (snapshot, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureBody;
    use serde_json::json;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn values(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_merge_applies_valid_keys() {
        let local = ConfigSnapshot::default();
        let (snapshot, rejected) = merge(
            &local,
            Some("\"1\"".to_string()),
            &values(json!({
                "transaction_sample_rate": "0.25",
                "recording": false,
                "max_batch_event_count": 50,
                "capture_body": "errors",
                "sanitize_field_names": ["a", "b"],
            })),
        );
        assert!(rejected.is_empty());
        assert!((snapshot.transaction_sample_rate - 0.25).abs() < f64::EPSILON);
        assert!(!snapshot.recording);
        assert_eq!(snapshot.max_batch_event_count, 50);
        assert_eq!(snapshot.capture_body, CaptureBody::Errors);
        assert_eq!(snapshot.sanitize_field_names, vec!["a", "b"]);
        assert_eq!(
            snapshot.central_keys,
            vec![
                "capture_body",
                "max_batch_event_count",
                "recording",
                "sanitize_field_names",
                "transaction_sample_rate"
            ]
        );
        assert_eq!(
            snapshot.origin,
            ConfigOrigin::Central {
                etag: Some("\"1\"".to_string())
            }
        );
    }

    #[test]
    #[traced_test]
    fn test_merge_rejects_invalid_and_unknown_keys() {
        let local = ConfigSnapshot {
            flush_interval: Duration::from_secs(3),
            ..ConfigSnapshot::default()
        };
        let (snapshot, rejected) = merge(
            &local,
            None,
            &values(json!({
                "transaction_sample_rate": "2",
                "server_url": "http://elsewhere:8200",
                "mystery": "1",
                "flush_interval": null,
                "capture_headers": "false",
            })),
        );
        let mut keys: Vec<_> = rejected.iter().map(|r| r.key.as_str()).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec!["flush_interval", "mystery", "server_url", "transaction_sample_rate"]
        );
        assert_eq!(snapshot.central_keys, vec!["capture_headers"]);
        assert!(!snapshot.capture_headers);
        assert_eq!(snapshot.flush_interval, Duration::from_secs(3));
        assert_eq!(snapshot.server_url, local.server_url);
        assert!(logs_contain("central-config ignoring key"));
    }

    #[test]
    fn test_removed_keys_revert_to_local() {
        let local = ConfigSnapshot {
            transaction_sample_rate: 0.9,
            ..ConfigSnapshot::default()
        };
        let (first, _) = merge(
            &local,
            None,
            &values(json!({"transaction_sample_rate": "0.1"})),
        );
        assert!((first.transaction_sample_rate - 0.1).abs() < f64::EPSILON);

        // The second merge starts from the local snapshot, not from `first`.
        let (second, _) = merge(&local, None, &values(json!({})));
        assert!((second.transaction_sample_rate - 0.9).abs() < f64::EPSILON);
        assert!(second.central_keys.is_empty());
    }
}
