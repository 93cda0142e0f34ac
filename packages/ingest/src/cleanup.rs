//! Bulk removal of a connection's products from its destination.
//!
//! Cleanups are requested explicitly by whoever deletes a connection or a
//! feed, by an operator, or by an import reconciling stale products. At
//! most one non-terminal run exists per connection. A run lists every
//! product tagged with the connection, then deletes the matches in batches
//! sized by the throttle. Cancellation is polled after every listing page
//! and every delete batch; a batch in flight always finishes.

use std::sync::Arc;

use elementa_destination::{ApiClient, ListQuery, ListedProduct};
use elementa_feed::progress::{ProgressCallback, null_progress};
use elementa_feed_models::{Connection, ConnectionId, FeedId};
use elementa_ingest_models::{CleanupRun, CleanupScope, CleanupStatus, CleanupTrigger};
use elementa_throttle::AdaptiveThrottle;

use crate::IngestError;
use crate::config::IngestConfig;
use crate::runs::{CleanupRequest, RunStore};

/// Creates and executes [`CleanupRun`]s.
#[derive(Clone)]
pub struct CleanupRunner {
    client: Arc<dyn ApiClient>,
    throttle: AdaptiveThrottle,
    runs: Arc<dyn RunStore>,
    page_size: u32,
    max_consecutive_failures: u32,
    progress: Arc<dyn ProgressCallback>,
}

impl std::fmt::Debug for CleanupRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRunner")
            .field("throttle", &self.throttle)
            .field("page_size", &self.page_size)
            .field("max_consecutive_failures", &self.max_consecutive_failures)
            .finish_non_exhaustive()
    }
}

impl CleanupRunner {
    /// Creates a runner.
    #[must_use]
    pub fn new(
        client: Arc<dyn ApiClient>,
        throttle: AdaptiveThrottle,
        runs: Arc<dyn RunStore>,
        config: &IngestConfig,
    ) -> Self {
        Self {
            client,
            throttle,
            runs,
            page_size: config.cleanup_page_size.max(1),
            max_consecutive_failures: config.cleanup_max_consecutive_failures,
            progress: null_progress(),
        }
    }

    /// Reports deletions as progress units.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Creates a pending cleanup for one connection.
    ///
    /// # Errors
    ///
    /// * [`IngestError::CleanupActive`] if the connection already has a
    ///   non-terminal cleanup
    /// * If the run store fails
    pub async fn request(
        &self,
        connection_id: ConnectionId,
        trigger: CleanupTrigger,
        scope: CleanupScope,
        dry_run: bool,
    ) -> Result<CleanupRun, IngestError> {
        let run = self
            .runs
            .create_cleanup(CleanupRequest {
                connection_id,
                feed_id: None,
                trigger,
                scope,
                dry_run,
            })
            .await?;
        log::info!(
            "Connection {connection_id}: cleanup run {} requested ({trigger}{})",
            run.id,
            if dry_run { ", dry run" } else { "" }
        );
        Ok(run)
    }

    /// Creates a pending cleanup for every connection reading `feed_id`.
    ///
    /// Connections that already have an active cleanup are skipped with a
    /// warning, since that run removes the same products.
    ///
    /// # Errors
    ///
    /// * If the run store fails
    pub async fn request_for_feed(
        &self,
        feed_id: FeedId,
        connections: &[Connection],
        dry_run: bool,
    ) -> Result<Vec<CleanupRun>, IngestError> {
        let mut created = Vec::new();

        for connection in connections.iter().filter(|c| c.feed_id == feed_id) {
            let request = CleanupRequest {
                connection_id: connection.id,
                feed_id: Some(feed_id),
                trigger: CleanupTrigger::FeedDeleted,
                scope: CleanupScope::All,
                dry_run,
            };
            match self.runs.create_cleanup(request).await {
                Ok(run) => {
                    log::info!(
                        "Connection {}: cleanup run {} requested for deleted feed {feed_id}",
                        connection.id,
                        run.id
                    );
                    created.push(run);
                }
                Err(IngestError::CleanupActive { run_id, .. }) => {
                    log::warn!(
                        "Connection {}: cleanup run {run_id} already active, not requesting another",
                        connection.id
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Ok(created)
    }

    /// Asks a cleanup to stop. A run that has not started is cancelled
    /// immediately; a running one stops after its current batch.
    ///
    /// # Errors
    ///
    /// * [`IngestError::RunNotFound`] if the run does not exist
    /// * If the run store fails
    pub async fn cancel(&self, run_id: u64) -> Result<CleanupRun, IngestError> {
        let mut run = self.runs.request_cancel(run_id).await?;
        if run.status.is_terminal() {
            log::debug!("Cleanup run {run_id} already {}", run.status);
            return Ok(run);
        }

        log::info!("Cleanup run {run_id}: cancellation requested");
        if run.status == CleanupStatus::Pending {
            run.cancel()?;
            self.runs.save_cleanup(&run).await?;
        }
        Ok(run)
    }

    /// Creates a cleanup for `connection` and executes it straight away.
    ///
    /// # Errors
    ///
    /// * See [`Self::request`] and [`Self::execute`]
    pub async fn run(
        &self,
        connection: &Connection,
        trigger: CleanupTrigger,
        scope: CleanupScope,
        dry_run: bool,
    ) -> Result<CleanupRun, IngestError> {
        let run = self.request(connection.id, trigger, scope, dry_run).await?;
        self.execute(connection, run.id).await
    }

    /// Executes a pending cleanup run against `connection`'s destination.
    ///
    /// Destination errors end the run as failed rather than returning an
    /// error; counters reached so far are kept.
    ///
    /// # Errors
    ///
    /// * [`IngestError::RunNotFound`] if the run does not exist
    /// * [`IngestError::Transition`] if the run is not pending
    /// * If the run store fails
    pub async fn execute(
        &self,
        connection: &Connection,
        run_id: u64,
    ) -> Result<CleanupRun, IngestError> {
        let mut run = self
            .runs
            .cleanup_run(run_id)
            .await?
            .ok_or(IngestError::RunNotFound(run_id))?;

        if run.connection_id != connection.id {
            log::warn!(
                "Cleanup run {run_id} belongs to connection {}, executing against connection {}",
                run.connection_id,
                connection.id
            );
        }

        if self.stop_if_cancelled(&mut run).await? {
            return Ok(run);
        }

        run.start()?;
        self.runs.save_cleanup(&run).await?;
        log::info!(
            "{}: cleanup run {run_id} started for connection {}",
            connection.destination,
            run.connection_id
        );

        let Some(ids) = self.list(connection, &mut run).await? else {
            return Ok(run);
        };

        if run.dry_run {
            log::info!(
                "{}: cleanup run {run_id} (dry run) would delete {} products",
                connection.destination,
                ids.len()
            );
            run.complete()?;
            self.runs.save_cleanup(&run).await?;
            self.progress.finish(format!("{} products found", ids.len()));
            return Ok(run);
        }

        if !self.delete(connection, &mut run, &ids).await? {
            return Ok(run);
        }

        run.complete()?;
        self.runs.save_cleanup(&run).await?;
        log::info!(
            "{}: cleanup run {run_id} completed, {} deleted, {} failed",
            connection.destination,
            run.products_processed,
            run.products_failed
        );
        self.progress
            .finish(format!("{} products deleted", run.products_processed));
        Ok(run)
    }

    /// Lists every product in scope. Returns `None` when the run ended
    /// during listing.
    async fn list(
        &self,
        connection: &Connection,
        run: &mut CleanupRun,
    ) -> Result<Option<Vec<u64>>, IngestError> {
        let destination = &connection.destination;
        let mut ids = Vec::new();
        let mut page = 1;

        loop {
            let query = ListQuery {
                connection_id: run.connection_id,
                page,
                per_page: self.page_size,
            };
            let products = match self
                .throttle
                .call(destination, || self.client.list_products(query))
                .await
            {
                Ok(products) => products,
                Err(e) => {
                    log::error!(
                        "{destination}: cleanup run {} failed listing page {page}: {e}",
                        run.id
                    );
                    run.fail(format!("listing page {page} failed: {e}"))?;
                    self.runs.save_cleanup(run).await?;
                    return Ok(None);
                }
            };

            let last_page = products.len() < self.page_size as usize;
            ids.extend(
                products
                    .iter()
                    .filter(|product| in_scope(run.scope, product))
                    .map(|product| product.id),
            );
            run.products_found = ids.len() as u64;
            self.runs.save_cleanup(run).await?;
            self.progress
                .set_message(format!("listed {} products", run.products_found));

            if self.stop_if_cancelled(run).await? {
                return Ok(None);
            }
            if last_page {
                return Ok(Some(ids));
            }
            page += 1;
        }
    }

    /// Deletes `ids` in throttle-sized batches. Returns `false` when the
    /// run ended before every batch was sent.
    async fn delete(
        &self,
        connection: &Connection,
        run: &mut CleanupRun,
        ids: &[u64],
    ) -> Result<bool, IngestError> {
        let destination = &connection.destination;
        let mut remaining = ids;
        let mut consecutive_failures = 0;

        self.progress.set_total(ids.len() as u64);
        self.progress.set_position(0);

        while !remaining.is_empty() {
            let size = usize::try_from(self.throttle.batch_size(destination).await)
                .unwrap_or(usize::MAX)
                .clamp(1, remaining.len());
            let (batch, rest) = remaining.split_at(size);
            remaining = rest;

            match self
                .throttle
                .call(destination, || self.client.delete_products(batch))
                .await
            {
                Ok(result) => {
                    consecutive_failures = 0;
                    run.products_processed += result.deleted.len() as u64;
                    if !result.failed.is_empty() {
                        log::warn!(
                            "{destination}: cleanup run {} could not delete {:?}",
                            run.id,
                            result.failed
                        );
                        run.products_failed += result.failed.len() as u64;
                        run.errors.push(format!(
                            "destination refused to delete {} products",
                            result.failed.len()
                        ));
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    log::error!(
                        "{destination}: cleanup run {} delete batch of {} failed: {e}",
                        run.id,
                        batch.len()
                    );
                    run.products_failed += batch.len() as u64;
                    run.errors.push(format!("delete batch failed: {e}"));

                    if consecutive_failures > self.max_consecutive_failures {
                        run.fail(format!(
                            "{consecutive_failures} consecutive delete batches failed"
                        ))?;
                        self.runs.save_cleanup(run).await?;
                        self.progress.finish_and_clear();
                        return Ok(false);
                    }
                }
            }

            self.progress.inc(batch.len() as u64);
            self.runs.save_cleanup(run).await?;

            if self.stop_if_cancelled(run).await? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    async fn stop_if_cancelled(&self, run: &mut CleanupRun) -> Result<bool, IngestError> {
        if !self.runs.is_cancel_requested(run.id).await? {
            return Ok(false);
        }

        run.cancel_requested = true;
        run.cancel()?;
        self.runs.save_cleanup(run).await?;
        log::info!(
            "Cleanup run {} cancelled after {} of {} products",
            run.id,
            run.products_processed,
            run.products_found
        );
        self.progress.finish_and_clear();
        Ok(true)
    }
}

fn in_scope(scope: CleanupScope, product: &ListedProduct) -> bool {
    match scope {
        CleanupScope::All => true,
        CleanupScope::StaleBefore { cutoff } => {
            product.last_seen.is_none_or(|seen| seen < cutoff)
        }
    }
}
