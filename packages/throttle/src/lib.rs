#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Per-destination adaptive throttle.
//!
//! Every outbound call to a destination goes through
//! [`AdaptiveThrottle::call`] (or the [`AdaptiveThrottle::admit`] /
//! [`AdaptiveThrottle::complete`] pair). The throttle:
//!
//! * admits calls under a fixed-window rate limit, overridable at runtime
//! * delays every call while the destination is recovering
//! * on distress (5xx, timeout), enters or extends recovery and halves the
//!   destination's batch size
//!
//! All state lives in a shared [`StateStore`] so every worker sees the same
//! picture. Reads and writes are not transactional across keys; two workers
//! may both observe a healthy destination and both record the same failure.
//! That race is accepted: the backoff is advisory. Single-key updates use
//! compare-and-swap so concurrent failures are never lost.
//!
//! Store errors are logged and the throttle fails open. It never returns an
//! error on the call path.

pub mod store;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use elementa_feed_models::DestinationKey;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use uuid::Uuid;

pub use elementa_throttle_models::{
    AdmissionOverride, CallOutcome, DistressSignal, ThrottleConfig, ThrottleState,
};
pub use store::{MemoryStateStore, StateStore, StoreError};

use store::{Precondition, PutResult, Ttl, Versioned};

/// Handle for one admitted call. Consumed by [`AdaptiveThrottle::complete`],
/// so a response is reported at most once.
#[derive(Debug)]
#[must_use = "an admitted call must be completed"]
pub struct RequestTicket {
    id: Uuid,
    destination: DestinationKey,
}

impl RequestTicket {
    /// Request id, for correlating log lines.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Destination the call targets.
    #[must_use]
    pub const fn destination(&self) -> &DestinationKey {
        &self.destination
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct BatchEntry {
    batch_size: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RecoveryEntry {
    recovery_time_ms: u64,
}

impl RecoveryEntry {
    const fn recovery_time(self) -> Duration {
        Duration::from_millis(self.recovery_time_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct WindowEntry {
    count: u32,
}

fn key(destination: &DestinationKey, field: &str) -> String {
    format!("throttle:{destination}:{field}")
}

#[allow(clippy::cast_possible_truncation)]
const fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

/// Adaptive throttle over a shared [`StateStore`]. Cheap to clone.
#[derive(Clone)]
pub struct AdaptiveThrottle {
    store: Arc<dyn StateStore>,
    config: ThrottleConfig,
}

impl std::fmt::Debug for AdaptiveThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveThrottle")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AdaptiveThrottle {
    /// Creates a throttle over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, config: ThrottleConfig) -> Self {
        Self { store, config }
    }

    /// Creates a throttle over a fresh [`MemoryStateStore`] with default
    /// configuration.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStateStore::new()), ThrottleConfig::default())
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Runs `f` as one admitted call to `destination` and reports its
    /// outcome.
    ///
    /// # Errors
    ///
    /// * Whatever `f` returns; the throttle adds no errors of its own
    pub async fn call<T, E, F, Fut>(&self, destination: &DestinationKey, f: F) -> Result<T, E>
    where
        E: DistressSignal,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let ticket = self.admit(destination).await;
        let result = f().await;
        self.complete(ticket, CallOutcome::of(&result)).await;
        result
    }

    /// Waits until a call to `destination` may proceed.
    ///
    /// Blocks for the admission window when the rate limit is exhausted,
    /// and for the full recovery time when the destination is recovering.
    pub async fn admit(&self, destination: &DestinationKey) -> RequestTicket {
        self.wait_for_admission(destination).await;

        if let Some(delay) = self.recovery_delay(destination).await {
            log::warn!(
                "{destination}: recovering, delaying call by {}s",
                delay.as_secs_f64()
            );
            tokio::time::sleep(delay).await;
        }

        let ticket = RequestTicket {
            id: Uuid::new_v4(),
            destination: destination.clone(),
        };
        log::trace!("{destination}: admitted request {}", ticket.id);
        ticket
    }

    /// Reports how an admitted call ended. Distress triggers
    /// [`Self::record_failure`]; success changes nothing, since recovery
    /// only ends when its window expires.
    pub async fn complete(&self, ticket: RequestTicket, outcome: CallOutcome) {
        match outcome {
            CallOutcome::Distress => {
                log::warn!(
                    "{}: request {} hit destination distress",
                    ticket.destination,
                    ticket.id
                );
                self.record_failure(&ticket.destination).await;
            }
            CallOutcome::Failure => {
                log::debug!("{}: request {} failed", ticket.destination, ticket.id);
            }
            CallOutcome::Success => {
                log::trace!("{}: request {} succeeded", ticket.destination, ticket.id);
            }
        }
    }

    /// Records one distress signal for `destination`.
    ///
    /// Enters recovery at the default window, or grows the window if the
    /// destination failed recently, then shrinks the batch size.
    pub async fn record_failure(&self, destination: &DestinationKey) {
        let default = RecoveryEntry {
            recovery_time_ms: millis(self.config.default_recovery_time()),
        };
        let recovery = self
            .update(
                &key(destination, "recovery"),
                |current: Option<RecoveryEntry>| {
                    let next = current.map_or(default, |entry| RecoveryEntry {
                        recovery_time_ms: millis(
                            self.config.next_recovery_time(entry.recovery_time()),
                        ),
                    });
                    let ttl = Ttl::Expire(self.config.recovery_memory(next.recovery_time()));
                    (next, ttl)
                },
            )
            .await
            .unwrap_or(default);
        let recovery_time = recovery.recovery_time();

        if let Err(e) = self
            .store
            .put(
                &key(destination, "recovering"),
                Value::Bool(true),
                Ttl::Expire(recovery_time),
                Precondition::None,
            )
            .await
        {
            log::error!("{destination}: failed to persist recovery flag: {e}");
        }

        let default_batch = self.config.default_batch_size;
        let batch = self
            .update(&key(destination, "batch"), |current: Option<BatchEntry>| {
                let current = current.map_or(default_batch, |entry| entry.batch_size);
                (
                    BatchEntry {
                        batch_size: self.config.next_batch_size(current),
                    },
                    Ttl::Never,
                )
            })
            .await;

        log::warn!(
            "{destination}: recovering for {}s, batch size now {}",
            recovery_time.as_secs_f64(),
            batch.map_or_else(|| "unknown".to_string(), |b| b.batch_size.to_string())
        );
    }

    /// Batch size the chunking layer should use for `destination`.
    pub async fn batch_size(&self, destination: &DestinationKey) -> u32 {
        self.read::<BatchEntry>(&key(destination, "batch"))
            .await
            .map_or(self.config.default_batch_size, |(entry, _)| entry.batch_size)
    }

    /// Snapshot of `destination`'s throttle state.
    ///
    /// # Errors
    ///
    /// * If the state store fails or holds malformed values
    pub async fn state(&self, destination: &DestinationKey) -> Result<ThrottleState, StoreError> {
        let recovering = self
            .store
            .get(&key(destination, "recovering"))
            .await?
            .is_some();
        let recovery_time = self
            .try_read::<RecoveryEntry>(&key(destination, "recovery"))
            .await?
            .map_or(self.config.default_recovery_time(), |(entry, _)| {
                entry.recovery_time()
            });
        let batch_size = self
            .try_read::<BatchEntry>(&key(destination, "batch"))
            .await?
            .map_or(self.config.default_batch_size, |(entry, _)| entry.batch_size);
        let (admission_limit, admission_window) = self
            .try_read::<AdmissionOverride>(&key(destination, "admission"))
            .await?
            .map_or(
                (self.config.admission_limit, self.config.admission_window()),
                |(o, _)| (o.limit, o.window()),
            );

        Ok(ThrottleState {
            destination: destination.clone(),
            recovering,
            recovery_time,
            batch_size,
            admission_limit,
            admission_window,
        })
    }

    /// Clears recovery, recovery time, batch size, and the current
    /// admission window for `destination`. Admission overrides are kept.
    ///
    /// # Errors
    ///
    /// * If the state store fails
    pub async fn reset(&self, destination: &DestinationKey) -> Result<(), StoreError> {
        for field in ["recovering", "recovery", "batch", "window"] {
            self.store.delete(&key(destination, field)).await?;
        }
        log::info!("{destination}: throttle state reset");
        Ok(())
    }

    /// Overrides the admission rate for `destination`, optionally for a
    /// limited time. `None` removes any override.
    ///
    /// # Errors
    ///
    /// * If the state store fails
    pub async fn set_admission_override(
        &self,
        destination: &DestinationKey,
        admission: Option<AdmissionOverride>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let key = key(destination, "admission");
        let Some(admission) = admission else {
            self.store.delete(&key).await?;
            log::info!("{destination}: admission override cleared");
            return Ok(());
        };

        let ttl = ttl.map_or(Ttl::Never, Ttl::Expire);
        self.store
            .put(&key, serde_json::to_value(admission)?, ttl, Precondition::None)
            .await?;
        log::info!(
            "{destination}: admission override {} per {}ms",
            admission.limit,
            admission.window_ms
        );
        Ok(())
    }

    async fn recovery_delay(&self, destination: &DestinationKey) -> Option<Duration> {
        match self.store.get(&key(destination, "recovering")).await {
            Ok(Some(_)) => {}
            Ok(None) => return None,
            Err(e) => {
                log::warn!("{destination}: could not read recovery flag, admitting: {e}");
                return None;
            }
        }

        Some(
            self.read::<RecoveryEntry>(&key(destination, "recovery"))
                .await
                .map_or(self.config.default_recovery_time(), |(entry, _)| {
                    entry.recovery_time()
                }),
        )
    }

    async fn admission(&self, destination: &DestinationKey) -> (u32, Duration) {
        self.read::<AdmissionOverride>(&key(destination, "admission"))
            .await
            .map_or(
                (self.config.admission_limit, self.config.admission_window()),
                |(o, _)| (o.limit, o.window()),
            )
    }

    /// Takes one slot in the current admission window, waiting for the
    /// window to roll over when it is full.
    async fn wait_for_admission(&self, destination: &DestinationKey) {
        let key = key(destination, "window");
        let mut conflicts = 0;

        loop {
            let (limit, window) = self.admission(destination).await;
            if limit == 0 {
                log::warn!("{destination}: admission limit is zero, admitting anyway");
                return;
            }

            let current = match self.store.get(&key).await {
                Ok(current) => current,
                Err(e) => {
                    log::warn!("{destination}: admission check failed, admitting: {e}");
                    return;
                }
            };

            let (count, precondition, ttl, expires_in) = match current {
                None => (0, Precondition::DoesNotExist, Ttl::Expire(window), None),
                Some(Versioned {
                    value,
                    version,
                    expires_in,
                }) => {
                    let count = serde_json::from_value::<WindowEntry>(value)
                        .map_or(0, |entry| entry.count);
                    (
                        count,
                        Precondition::MatchesVersion(version),
                        Ttl::Keep,
                        expires_in,
                    )
                }
            };

            if count >= limit {
                let wait = expires_in.unwrap_or(window).max(Duration::from_millis(1));
                log::debug!(
                    "{destination}: admission window full ({count}/{limit}), waiting {}ms",
                    wait.as_millis()
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            let entry = WindowEntry { count: count + 1 };
            let value = match serde_json::to_value(entry) {
                Ok(value) => value,
                Err(e) => {
                    log::error!("{destination}: could not encode admission window: {e}");
                    return;
                }
            };

            match self.store.put(&key, value, ttl, precondition).await {
                Ok(PutResult::Success { .. }) => return,
                Ok(PutResult::PreconditionFailed { .. }) => {
                    conflicts += 1;
                    if conflicts >= self.config.cas_retries {
                        log::debug!("{destination}: admission contention, admitting");
                        return;
                    }
                }
                Err(e) => {
                    log::warn!("{destination}: admission update failed, admitting: {e}");
                    return;
                }
            }
        }
    }

    /// Reads and decodes `key`, logging and discarding store errors.
    async fn read<T: DeserializeOwned>(&self, key: &str) -> Option<(T, Versioned)> {
        match self.try_read(key).await {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Throttle state read of {key} failed: {e}");
                None
            }
        }
    }

    async fn try_read<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<(T, Versioned)>, StoreError> {
        let Some(stored) = self.store.get(key).await? else {
            return Ok(None);
        };
        let value = serde_json::from_value(stored.value.clone())?;
        Ok(Some((value, stored)))
    }

    /// Read-modify-write of one key with compare-and-swap, falling back to
    /// an unconditional write once the retry budget is spent. Returns the
    /// value written, or `None` if the store failed.
    async fn update<T, F>(&self, key: &str, f: F) -> Option<T>
    where
        T: Serialize + DeserializeOwned + Copy,
        F: Fn(Option<T>) -> (T, Ttl),
    {
        let mut attempts = 0;
        loop {
            let current = match self.store.get(key).await {
                Ok(current) => current,
                Err(e) => {
                    log::error!("Throttle state read of {key} failed: {e}");
                    return None;
                }
            };

            let (decoded, precondition) = match &current {
                Some(stored) => (
                    serde_json::from_value::<T>(stored.value.clone()).ok(),
                    Precondition::MatchesVersion(stored.version),
                ),
                None => (None, Precondition::DoesNotExist),
            };

            attempts += 1;
            let precondition = if attempts > self.config.cas_retries {
                log::debug!("Throttle state {key} contended, writing last-write-wins");
                Precondition::None
            } else {
                precondition
            };

            let (next, ttl) = f(decoded);
            let value = match serde_json::to_value(next) {
                Ok(value) => value,
                Err(e) => {
                    log::error!("Could not encode throttle state {key}: {e}");
                    return None;
                }
            };

            match self.store.put(key, value, ttl, precondition).await {
                Ok(PutResult::Success { .. }) => return Some(next),
                Ok(PutResult::PreconditionFailed { .. }) => {}
                Err(e) => {
                    log::error!("Throttle state write of {key} failed: {e}");
                    return None;
                }
            }
        }
    }
}
