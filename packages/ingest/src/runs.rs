//! Persistence contract for import and cleanup runs.
//!
//! The pipeline writes run status and counters through [`RunStore`];
//! storing and querying them is the embedding application's job.
//! [`MemoryRunStore`] keeps runs in process memory.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use elementa_feed_models::{ConnectionId, FeedId};
use elementa_ingest_models::{CleanupRun, CleanupScope, CleanupTrigger, ImportRun};

use crate::IngestError;

/// Parameters for a new cleanup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupRequest {
    /// Connection to clean up.
    pub connection_id: ConnectionId,
    /// Feed the cleanup was requested for, if any.
    pub feed_id: Option<FeedId>,
    /// Why.
    pub trigger: CleanupTrigger,
    /// Which products.
    pub scope: CleanupScope,
    /// Count only.
    pub dry_run: bool,
}

/// Storage for run records.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Creates a pending import run.
    ///
    /// # Errors
    ///
    /// * If the store fails
    async fn create_import(
        &self,
        connection_id: ConnectionId,
        feed_id: FeedId,
    ) -> Result<ImportRun, IngestError>;

    /// Persists an import run's current state.
    ///
    /// # Errors
    ///
    /// * If the run does not exist or the store fails
    async fn save_import(&self, run: &ImportRun) -> Result<(), IngestError>;

    /// Loads an import run.
    ///
    /// # Errors
    ///
    /// * If the store fails
    async fn import_run(&self, id: u64) -> Result<Option<ImportRun>, IngestError>;

    /// Creates a pending cleanup run, unless the connection already has a
    /// non-terminal one. The check and the insert are atomic.
    ///
    /// # Errors
    ///
    /// * [`IngestError::CleanupActive`] if a non-terminal run exists
    /// * If the store fails
    async fn create_cleanup(&self, request: CleanupRequest) -> Result<CleanupRun, IngestError>;

    /// Persists a cleanup run's current state. A cancellation request
    /// already recorded for the run is never cleared by a save.
    ///
    /// # Errors
    ///
    /// * If the run does not exist or the store fails
    async fn save_cleanup(&self, run: &CleanupRun) -> Result<(), IngestError>;

    /// Loads a cleanup run.
    ///
    /// # Errors
    ///
    /// * If the store fails
    async fn cleanup_run(&self, id: u64) -> Result<Option<CleanupRun>, IngestError>;

    /// The connection's non-terminal cleanup run, if any.
    ///
    /// # Errors
    ///
    /// * If the store fails
    async fn active_cleanup(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Option<CleanupRun>, IngestError>;

    /// Flags a cleanup run for cancellation and returns it.
    ///
    /// # Errors
    ///
    /// * [`IngestError::RunNotFound`] if the run does not exist
    /// * If the store fails
    async fn request_cancel(&self, id: u64) -> Result<CleanupRun, IngestError>;

    /// Whether cancellation has been requested for a cleanup run.
    ///
    /// # Errors
    ///
    /// * [`IngestError::RunNotFound`] if the run does not exist
    /// * If the store fails
    async fn is_cancel_requested(&self, id: u64) -> Result<bool, IngestError>;
}

#[derive(Debug, Default)]
struct Runs {
    imports: BTreeMap<u64, ImportRun>,
    cleanups: BTreeMap<u64, CleanupRun>,
    last_id: u64,
}

impl Runs {
    const fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }
}

/// In-process [`RunStore`].
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: Mutex<Runs>,
}

impl MemoryRunStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every cleanup run, by id.
    ///
    /// # Errors
    ///
    /// * If the store lock is poisoned
    pub fn cleanup_runs(&self) -> Result<Vec<CleanupRun>, IngestError> {
        Ok(self.lock()?.cleanups.values().cloned().collect())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Runs>, IngestError> {
        self.runs
            .lock()
            .map_err(|_| IngestError::RunStore("run store lock poisoned".to_string()))
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_import(
        &self,
        connection_id: ConnectionId,
        feed_id: FeedId,
    ) -> Result<ImportRun, IngestError> {
        let mut runs = self.lock()?;
        let run = ImportRun::new(runs.next_id(), connection_id, feed_id);
        runs.imports.insert(run.id, run.clone());
        Ok(run)
    }

    async fn save_import(&self, run: &ImportRun) -> Result<(), IngestError> {
        let mut runs = self.lock()?;
        let stored = runs
            .imports
            .get_mut(&run.id)
            .ok_or(IngestError::RunNotFound(run.id))?;
        *stored = run.clone();
        Ok(())
    }

    async fn import_run(&self, id: u64) -> Result<Option<ImportRun>, IngestError> {
        Ok(self.lock()?.imports.get(&id).cloned())
    }

    async fn create_cleanup(&self, request: CleanupRequest) -> Result<CleanupRun, IngestError> {
        let mut runs = self.lock()?;

        if let Some(active) = runs
            .cleanups
            .values()
            .find(|r| r.connection_id == request.connection_id && !r.status.is_terminal())
        {
            return Err(IngestError::CleanupActive {
                connection_id: request.connection_id,
                run_id: active.id,
            });
        }

        let mut run = CleanupRun::new(
            runs.next_id(),
            request.connection_id,
            request.trigger,
            request.scope,
            request.dry_run,
        );
        if let Some(feed_id) = request.feed_id {
            run = run.with_feed(feed_id);
        }
        runs.cleanups.insert(run.id, run.clone());
        drop(runs);

        Ok(run)
    }

    async fn save_cleanup(&self, run: &CleanupRun) -> Result<(), IngestError> {
        let mut runs = self.lock()?;
        let stored = runs
            .cleanups
            .get_mut(&run.id)
            .ok_or(IngestError::RunNotFound(run.id))?;
        let cancel_requested = stored.cancel_requested || run.cancel_requested;
        *stored = run.clone();
        stored.cancel_requested = cancel_requested;
        Ok(())
    }

    async fn cleanup_run(&self, id: u64) -> Result<Option<CleanupRun>, IngestError> {
        Ok(self.lock()?.cleanups.get(&id).cloned())
    }

    async fn active_cleanup(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Option<CleanupRun>, IngestError> {
        Ok(self
            .lock()?
            .cleanups
            .values()
            .find(|r| r.connection_id == connection_id && !r.status.is_terminal())
            .cloned())
    }

    async fn request_cancel(&self, id: u64) -> Result<CleanupRun, IngestError> {
        let mut runs = self.lock()?;
        let stored = runs
            .cleanups
            .get_mut(&id)
            .ok_or(IngestError::RunNotFound(id))?;
        stored.cancel_requested = true;
        Ok(stored.clone())
    }

    async fn is_cancel_requested(&self, id: u64) -> Result<bool, IngestError> {
        self.lock()?
            .cleanups
            .get(&id)
            .map(|r| r.cancel_requested)
            .ok_or(IngestError::RunNotFound(id))
    }
}
