//! Replay protection store: contract plus reference implementations.
//!
//! `check_and_store` is an atomic "set if absent with expiration": it
//! returns `true` when the (provider, event id) pair was already present,
//! i.e. the event is a replay. Two concurrent callers with the same key
//! race; exactly one observes the replay. External backends implement the
//! same contract on top of any atomic set-if-absent-with-TTL primitive
//! and are expected to fail open (return `false`) and log on backend
//! errors.

#![deny(unsafe_code)]

use async_trait::async_trait;
use shield_core::clock::{Clock, SystemClock};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Backend failure while talking to the store.
#[derive(Debug, Error)]
#[error("replay store error: {0}")]
pub struct ReplayStoreError(pub String);

/// One idempotency check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayCheck {
    /// Webhook provider name.
    pub provider: String,
    /// Provider-assigned event identifier.
    pub event_id: String,
    /// How long the id stays tracked.
    pub ttl_seconds: u64,
}

/// External state tracking previously-seen webhook event ids.
#[async_trait]
pub trait ReplayStore: Send + Sync {
    /// Atomically record the event id; `true` means it was already
    /// present (a replay). Either completes fully or not at all.
    async fn check_and_store(&self, check: &ReplayCheck) -> Result<bool, ReplayStoreError>;
}

/// Reference key layout for external backends:
/// `contractshield:replay:<provider>:<sanitized-event-id>`, with
/// non-alphanumeric event id characters replaced by `_`.
#[must_use]
pub fn namespaced_key(provider: &str, event_id: &str) -> String {
    let sanitized: String = event_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("contractshield:replay:{provider}:{sanitized}")
}

/// In-memory reference implementation.
///
/// A single mutex guards the map, which makes check-and-set atomic by
/// construction. Each call first sweeps expired entries opportunistically.
pub struct MemoryReplayStore {
    entries: Mutex<HashMap<(String, String), u64>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryReplayStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryReplayStore {
    /// Store on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Store on an injected clock (tests, replay).
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { entries: Mutex::new(HashMap::new()), clock }
    }

    /// Number of live (unswept) entries; test hook.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("replay store lock poisoned").len()
    }

    /// Whether the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ReplayStore for MemoryReplayStore {
    async fn check_and_store(&self, check: &ReplayCheck) -> Result<bool, ReplayStoreError> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock().expect("replay store lock poisoned");
        entries.retain(|_, expiry| *expiry > now);
        let key = (check.provider.clone(), check.event_id.clone());
        if entries.contains_key(&key) {
            return Ok(true);
        }
        entries.insert(key, now + check.ttl_seconds.saturating_mul(1000));
        Ok(false)
    }
}

/// Store that never remembers anything. Useful for purity tests and for
/// hosts that explicitly opt out of replay protection.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReplayStore;

#[async_trait]
impl ReplayStore for NoopReplayStore {
    async fn check_and_store(&self, _check: &ReplayCheck) -> Result<bool, ReplayStoreError> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shield_core::clock::FixedClock;

    fn check(event_id: &str, ttl: u64) -> ReplayCheck {
        ReplayCheck { provider: "stripe".into(), event_id: event_id.into(), ttl_seconds: ttl }
    }

    #[tokio::test]
    async fn first_seen_then_replay() {
        let store = MemoryReplayStore::new();
        assert!(!store.check_and_store(&check("evt_1", 300)).await.unwrap());
        assert!(store.check_and_store(&check("evt_1", 300)).await.unwrap());
    }

    #[tokio::test]
    async fn providers_do_not_collide() {
        let store = MemoryReplayStore::new();
        assert!(!store.check_and_store(&check("evt_1", 300)).await.unwrap());
        let github = ReplayCheck {
            provider: "github".into(),
            event_id: "evt_1".into(),
            ttl_seconds: 300,
        };
        assert!(!store.check_and_store(&github).await.unwrap());
    }

    #[tokio::test]
    async fn expiry_frees_the_id() {
        let clock = Arc::new(FixedClock::new(1_000_000));
        let store = MemoryReplayStore::with_clock(clock.clone());
        assert!(!store.check_and_store(&check("evt_1", 10)).await.unwrap());
        clock.advance_ms(9_999);
        assert!(store.check_and_store(&check("evt_1", 10)).await.unwrap());
        clock.advance_ms(10_001);
        assert!(!store.check_and_store(&check("evt_1", 10)).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_removes_expired_entries() {
        let clock = Arc::new(FixedClock::new(0));
        let store = MemoryReplayStore::with_clock(clock.clone());
        for i in 0..10 {
            let _ = store.check_and_store(&check(&format!("evt_{i}"), 1)).await.unwrap();
        }
        assert_eq!(store.len(), 10);
        clock.advance_ms(2_000);
        let _ = store.check_and_store(&check("fresh", 300)).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_race_to_exactly_one_replay() {
        let store = Arc::new(MemoryReplayStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.check_and_store(&check("evt_race", 300)).await.unwrap()
            }));
        }
        let mut fresh = 0;
        for handle in handles {
            if !handle.await.unwrap() {
                fresh += 1;
            }
        }
        assert_eq!(fresh, 1, "exactly one caller must win the set-if-absent");
    }

    #[test]
    fn namespaced_key_sanitizes() {
        assert_eq!(
            namespaced_key("stripe", "evt_1!@#"),
            "contractshield:replay:stripe:evt_1___"
        );
        assert_eq!(namespaced_key("github", "abc123"), "contractshield:replay:github:abc123");
    }
}
