// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::debug;

use super::ConfigSnapshot;

/// Holds the active [`ConfigSnapshot`].
///
/// Reads are lock-free and always observe a complete snapshot. Publishing swaps the
/// whole snapshot; readers holding an older `Arc` keep it alive until they drop it.
pub struct ConfigStore {
    local: Arc<ConfigSnapshot>,
    current: ArcSwap<ConfigSnapshot>,
}

impl ConfigStore {
    #[must_use]
    pub fn new(local: ConfigSnapshot) -> Self {
        let local = Arc::new(local);
        Self {
            current: ArcSwap::new(Arc::clone(&local)),
            local,
        }
    }

    /// The active snapshot.
    #[must_use]
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    /// The locally loaded snapshot central overrides are merged onto.
    #[must_use]
    pub fn local(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&self.local)
    }

    pub fn publish(&self, snapshot: ConfigSnapshot) {
        debug!(
            "APM | Publishing configuration snapshot, origin: {:?}, central keys: {:?}",
            snapshot.origin, snapshot.central_keys
        );
        self.current.store(Arc::new(snapshot));
    }

    /// Restores the local snapshot, dropping every central override.
    pub fn reset_to_local(&self) {
        self.current.store(Arc::clone(&self.local));
    }
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("current", &self.current())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigOrigin;

    #[test]
    fn test_publish_replaces_snapshot() {
        let store = ConfigStore::new(ConfigSnapshot::default());
        let before = store.current();

        store.publish(ConfigSnapshot {
            recording: false,
            origin: ConfigOrigin::Central {
                etag: Some("\"1\"".to_string()),
            },
            central_keys: vec!["recording".to_string()],
            ..ConfigSnapshot::default()
        });

        let after = store.current();
        assert!(before.recording);
        assert!(!after.recording);
        assert!(after.is_central());
        assert_eq!(store.local().origin, ConfigOrigin::Local);
    }

    #[test]
    fn test_reset_to_local() {
        let store = ConfigStore::new(ConfigSnapshot::default());
        store.publish(ConfigSnapshot {
            max_batch_event_count: 99,
            ..ConfigSnapshot::default()
        });
        store.reset_to_local();
        assert!(Arc::ptr_eq(&store.current(), &store.local()));
    }

    #[test]
    fn test_concurrent_readers_see_whole_snapshots() {
        let store = Arc::new(ConfigStore::new(ConfigSnapshot::default()));
        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 1..500 {
                    store.publish(ConfigSnapshot {
                        max_batch_event_count: i,
                        max_queue_event_count: i,
                        ..ConfigSnapshot::default()
                    });
                }
            })
        };
        for _ in 0..500 {
            let snapshot = store.current();
            if snapshot.max_batch_event_count != crate::config::DEFAULT_MAX_BATCH_EVENT_COUNT {
                assert_eq!(snapshot.max_batch_event_count, snapshot.max_queue_event_count);
            }
        }
        writer.join().unwrap();
    }
}
