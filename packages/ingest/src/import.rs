//! Import orchestration for one connection.
//!
//! An import reads the connection's feed, runs every record through the
//! [`ChunkProcessor`] chunk by chunk, and keeps the [`ImportRun`] in the
//! run store up to date after each chunk. When stale reconciliation is
//! enabled, a completed import then removes products the feed no longer
//! carries.

use std::sync::Arc;

use elementa_destination::ApiClient;
use elementa_feed::progress::{ProgressCallback, null_progress};
use elementa_feed::reader::FeedReader;
use elementa_feed_models::{Connection, RawRecord};
use elementa_ingest_models::{CleanupScope, CleanupStatus, CleanupTrigger, ImportRun};
use elementa_throttle::AdaptiveThrottle;

use crate::IngestError;
use crate::chunk::ChunkProcessor;
use crate::cleanup::CleanupRunner;
use crate::config::IngestConfig;
use crate::runs::RunStore;
use crate::syndication::SyndicationService;

/// Runs imports and records them as [`ImportRun`]s.
#[derive(Clone)]
pub struct Importer {
    chunks: ChunkProcessor,
    cleanup: CleanupRunner,
    runs: Arc<dyn RunStore>,
    chunk_size: usize,
    reconcile_stale: bool,
    progress: Arc<dyn ProgressCallback>,
}

impl std::fmt::Debug for Importer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Importer")
            .field("chunks", &self.chunks)
            .field("cleanup", &self.cleanup)
            .field("chunk_size", &self.chunk_size)
            .field("reconcile_stale", &self.reconcile_stale)
            .finish_non_exhaustive()
    }
}

impl Importer {
    /// Creates an importer writing to `client` through `throttle`.
    #[must_use]
    pub fn new(
        client: Arc<dyn ApiClient>,
        throttle: AdaptiveThrottle,
        runs: Arc<dyn RunStore>,
        config: &IngestConfig,
    ) -> Self {
        let syndication = SyndicationService::new(client.clone(), throttle.clone());
        Self {
            chunks: ChunkProcessor::new(syndication, config),
            cleanup: CleanupRunner::new(client, throttle, runs.clone(), config),
            runs,
            chunk_size: config.chunk_size.max(1),
            reconcile_stale: config.reconcile_stale,
            progress: null_progress(),
        }
    }

    /// Reports one unit per processed record.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.chunks = self.chunks.with_progress(progress.clone());
        self.progress = progress;
        self
    }

    /// Turns stale reconciliation on or off.
    #[must_use]
    pub const fn with_reconcile_stale(mut self, reconcile_stale: bool) -> Self {
        self.reconcile_stale = reconcile_stale;
        self
    }

    /// Cleanup runner used for stale reconciliation.
    #[must_use]
    pub const fn cleanup(&self) -> &CleanupRunner {
        &self.cleanup
    }

    /// Reads `reader`'s feed and imports it for `connection`.
    ///
    /// A feed that cannot be read produces a failed run, not an error.
    ///
    /// # Errors
    ///
    /// * [`IngestError::InactiveConnection`] if the connection is inactive
    /// * If the run store fails
    pub async fn run_feed(
        &self,
        connection: &Connection,
        reader: &FeedReader,
    ) -> Result<ImportRun, IngestError> {
        if !connection.is_active {
            return Err(IngestError::InactiveConnection(connection.id));
        }

        match reader.read().await {
            Ok(records) => {
                log::info!(
                    "Connection {}: read {} records from {}",
                    connection.id,
                    records.len(),
                    reader.location()
                );
                self.run(connection, records).await
            }
            Err(e) => {
                log::error!(
                    "Connection {}: failed to read feed {}: {e}",
                    connection.id,
                    reader.location()
                );
                let mut run = self
                    .runs
                    .create_import(connection.id, connection.feed_id)
                    .await?;
                run.fail(format!("failed to read feed: {e}"))?;
                self.runs.save_import(&run).await?;
                Ok(run)
            }
        }
    }

    /// Imports `records` for `connection`.
    ///
    /// Per-record problems are recorded on the run. A run-level error marks
    /// the run failed before it is returned.
    ///
    /// # Errors
    ///
    /// * [`IngestError::InactiveConnection`] if the connection is inactive
    /// * If the run store fails
    pub async fn run(
        &self,
        connection: &Connection,
        records: Vec<RawRecord>,
    ) -> Result<ImportRun, IngestError> {
        if !connection.is_active {
            return Err(IngestError::InactiveConnection(connection.id));
        }

        let mut run = self
            .runs
            .create_import(connection.id, connection.feed_id)
            .await?;
        run.start()?;
        self.runs.save_import(&run).await?;
        log::info!(
            "{}: import run {} started for connection {} ({} records)",
            connection.destination,
            run.id,
            connection.id,
            records.len()
        );

        match self.process(connection, records, &mut run).await {
            Ok(()) => {
                run.complete()?;
                self.runs.save_import(&run).await?;
                let counters = &run.counters;
                log::info!(
                    "{}: import run {} completed: {} processed, {} created, {} updated, \
                     {} deleted, {} filtered, {} skipped, {} failed",
                    connection.destination,
                    run.id,
                    counters.processed,
                    counters.created,
                    counters.updated,
                    counters.deleted,
                    counters.filtered,
                    counters.skipped,
                    counters.failed
                );
                self.progress.finish(format!(
                    "{} created, {} updated, {} skipped",
                    counters.created, counters.updated, counters.skipped
                ));
                Ok(run)
            }
            Err(e) => {
                log::error!(
                    "{}: import run {} failed: {e}",
                    connection.destination,
                    run.id
                );
                if run.fail(e.to_string()).is_ok()
                    && let Err(save) = self.runs.save_import(&run).await
                {
                    log::error!("Import run {}: failed to record failure: {save}", run.id);
                }
                self.progress.finish_and_clear();
                Err(e)
            }
        }
    }

    async fn process(
        &self,
        connection: &Connection,
        records: Vec<RawRecord>,
        run: &mut ImportRun,
    ) -> Result<(), IngestError> {
        self.progress.set_total(records.len() as u64);
        self.progress.set_position(0);

        let mut records = records.into_iter();
        loop {
            let chunk: Vec<RawRecord> = records.by_ref().take(self.chunk_size).collect();
            if chunk.is_empty() {
                break;
            }
            self.chunks.process(connection, chunk).await.apply_to(run);
            self.runs.save_import(run).await?;
        }

        self.reconcile(connection, run).await
    }

    /// Deletes the connection's products that this run did not touch.
    async fn reconcile(&self, connection: &Connection, run: &mut ImportRun) -> Result<(), IngestError> {
        if !self.reconcile_stale {
            return Ok(());
        }
        if run.counters.processed == 0 {
            log::warn!(
                "{}: import run {} processed no records, skipping stale reconciliation",
                connection.destination,
                run.id
            );
            return Ok(());
        }
        if run.counters.failed > 0 {
            log::warn!(
                "{}: import run {} had {} failed records, skipping stale reconciliation",
                connection.destination,
                run.id,
                run.counters.failed
            );
            return Ok(());
        }
        let Some(cutoff) = run.started_at else {
            return Ok(());
        };

        let cleanup = match self
            .cleanup
            .run(
                connection,
                CleanupTrigger::StaleReconciliation,
                CleanupScope::StaleBefore { cutoff },
                false,
            )
            .await
        {
            Ok(cleanup) => cleanup,
            Err(IngestError::CleanupActive { run_id, .. }) => {
                log::warn!(
                    "{}: cleanup run {run_id} is active, skipping stale reconciliation",
                    connection.destination
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        run.counters.deleted += cleanup.products_processed;
        if cleanup.status != CleanupStatus::Completed {
            log::warn!(
                "{}: stale reconciliation run {} ended {}",
                connection.destination,
                cleanup.id,
                cleanup.status
            );
        }
        self.runs.save_import(run).await
    }
}
