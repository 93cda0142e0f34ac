//! Shared key-value state store contract.
//!
//! Throttle state must be visible to every worker talking to a destination,
//! so it lives behind [`StateStore`] rather than in process memory. The
//! contract is a versioned get/put with TTLs and compare-and-swap
//! preconditions, which maps directly onto Redis (`WATCH`/`MULTI`) or any
//! store with conditional writes.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

/// Errors from a [`StateStore`] backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached or rejected the operation
    #[error("state store unavailable: {0}")]
    Unavailable(String),
    /// An in-process lock was poisoned by a panicking writer
    #[error("state store lock poisoned")]
    Poisoned,
    /// A stored value did not have the expected shape
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Expiry applied by a [`StateStore::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Keep the existing entry's remaining lifetime (none if the key is new).
    Keep,
    /// Expire after the given duration.
    Expire(Duration),
    /// Never expire.
    Never,
}

/// Condition a [`StateStore::put`] must satisfy to take effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Write only if the key is absent (or expired).
    DoesNotExist,
    /// Write only if the key's version equals the given one.
    MatchesVersion(u64),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write. A failed precondition is a normal
/// result, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutResult {
    /// Write applied; carries the new version.
    Success {
        /// Version after the write.
        version: u64,
    },
    /// Precondition not met; carries the current version, if any.
    PreconditionFailed {
        /// Version currently stored, `None` if the key is absent.
        current_version: Option<u64>,
    },
}

/// A stored value with its version and remaining lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    /// The value.
    pub value: Value,
    /// Monotonic version, bumped on every write to the key.
    pub version: u64,
    /// Time left before the entry expires, `None` if it never does.
    pub expires_in: Option<Duration>,
}

/// Shared, network-visible key-value store holding throttle state.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Reads a key. Expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Writes a key subject to `precondition`.
    async fn put(
        &self,
        key: &str,
        value: Value,
        ttl: Ttl,
        precondition: Precondition,
    ) -> Result<PutResult, StoreError>;

    /// Removes a key. Succeeds if the key does not exist.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    version: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, Entry>,
    last_version: u64,
}

/// In-process [`StateStore`].
///
/// Shared between tasks of one process via `Arc`. Expiry follows
/// `tokio::time`, so tests running with paused time see entries expire as
/// the clock is advanced.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: RwLock<Entries>,
    unavailable: AtomicBool,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail with
    /// [`StoreError::Unavailable`] until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let entries = self.entries.read().map_err(|_| StoreError::Poisoned)?;

        Ok(entries
            .map
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| Versioned {
                value: entry.value.clone(),
                version: entry.version,
                expires_in: entry.expires_at.map(|at| at.saturating_duration_since(now)),
            }))
    }

    async fn put(
        &self,
        key: &str,
        value: Value,
        ttl: Ttl,
        precondition: Precondition,
    ) -> Result<PutResult, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.write().map_err(|_| StoreError::Poisoned)?;

        let current = entries.map.get(key).filter(|entry| entry.is_live(now));
        let current_version = current.map(|entry| entry.version);

        let satisfied = match precondition {
            Precondition::DoesNotExist => current.is_none(),
            Precondition::MatchesVersion(expected) => current_version == Some(expected),
            Precondition::None => true,
        };
        if !satisfied {
            return Ok(PutResult::PreconditionFailed { current_version });
        }

        let expires_at = match ttl {
            Ttl::Keep => current.and_then(|entry| entry.expires_at),
            Ttl::Expire(after) => Some(now + after),
            Ttl::Never => None,
        };

        entries.last_version += 1;
        let version = entries.last_version;
        entries.map.insert(
            key.to_string(),
            Entry {
                value,
                version,
                expires_at,
            },
        );
        drop(entries);

        Ok(PutResult::Success { version })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.entries
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .map
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn put_and_get_roundtrip() {
        let store = MemoryStateStore::new();
        let result = store
            .put("k", json!(1), Ttl::Never, Precondition::None)
            .await
            .unwrap();
        assert!(matches!(result, PutResult::Success { .. }));

        let stored = store.get("k").await.unwrap().unwrap();
        assert_eq!(stored.value, json!(1));
        assert_eq!(stored.expires_in, None);
    }

    #[tokio::test]
    async fn does_not_exist_precondition() {
        let store = MemoryStateStore::new();
        let first = store
            .put("k", json!("a"), Ttl::Never, Precondition::DoesNotExist)
            .await
            .unwrap();
        assert!(matches!(first, PutResult::Success { .. }));

        let second = store
            .put("k", json!("b"), Ttl::Never, Precondition::DoesNotExist)
            .await
            .unwrap();
        assert!(matches!(second, PutResult::PreconditionFailed { current_version: Some(_) }));
        assert_eq!(store.get("k").await.unwrap().unwrap().value, json!("a"));
    }

    #[tokio::test]
    async fn matches_version_detects_concurrent_write() {
        let store = MemoryStateStore::new();
        let PutResult::Success { version } = store
            .put("k", json!(1), Ttl::Never, Precondition::None)
            .await
            .unwrap()
        else {
            panic!("unconditional put failed");
        };

        store
            .put("k", json!(2), Ttl::Never, Precondition::None)
            .await
            .unwrap();

        let stale = store
            .put("k", json!(3), Ttl::Never, Precondition::MatchesVersion(version))
            .await
            .unwrap();
        assert!(matches!(stale, PutResult::PreconditionFailed { .. }));
        assert_eq!(store.get("k").await.unwrap().unwrap().value, json!(2));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_with_tokio_time() {
        let store = MemoryStateStore::new();
        store
            .put("k", json!(true), Ttl::Expire(Duration::from_secs(60)), Precondition::None)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        let stored = store.get("k").await.unwrap().unwrap();
        assert_eq!(stored.expires_in, Some(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(store.get("k").await.unwrap().is_none());

        let again = store
            .put("k", json!(false), Ttl::Never, Precondition::DoesNotExist)
            .await
            .unwrap();
        assert!(matches!(again, PutResult::Success { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn keep_ttl_preserves_expiry() {
        let store = MemoryStateStore::new();
        store
            .put("k", json!(1), Ttl::Expire(Duration::from_secs(10)), Precondition::None)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        store
            .put("k", json!(2), Ttl::Keep, Precondition::None)
            .await
            .unwrap();

        let stored = store.get("k").await.unwrap().unwrap();
        assert_eq!(stored.value, json!(2));
        assert_eq!(stored.expires_in, Some(Duration::from_secs(6)));
    }

    #[tokio::test]
    async fn unavailable_store_errors() {
        let store = MemoryStateStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.get("k").await, Err(StoreError::Unavailable(_))));
        store.set_unavailable(false);
        assert!(store.get("k").await.unwrap().is_none());
    }
}
