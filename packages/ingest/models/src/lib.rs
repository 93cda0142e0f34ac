#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Import and cleanup run records.
//!
//! An [`ImportRun`] moves `pending -> processing -> {completed, failed}`;
//! a [`CleanupRun`] moves `pending -> running -> {completed, failed,
//! cancelled}`. Terminal runs are never resurrected: every transition
//! method checks the current status and returns [`TransitionError`] on an
//! illegal move.

use chrono::{DateTime, Utc};
use elementa_feed_models::{ConnectionId, FeedId};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Rejected status change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("run {id} cannot move from {from} to {to}")]
pub struct TransitionError {
    /// Run id.
    pub id: u64,
    /// Status the run was in.
    pub from: String,
    /// Status that was requested.
    pub to: String,
}

/// Status of an [`ImportRun`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ImportStatus {
    /// Created, not yet started.
    Pending,
    /// Records are being processed.
    Processing,
    /// Finished normally.
    Completed,
    /// Aborted by a run-level error.
    Failed,
}

impl ImportStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// What happened to one record during an import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    /// Rejected by the connection's filter rules.
    Filtered,
    /// Not syndicated; carries the reason.
    Skipped {
        /// Why the record was skipped.
        reason: String,
    },
    /// Created at the destination.
    Created {
        /// Destination product id, when the destination reported one.
        product_id: Option<u64>,
    },
    /// Updated in place at the destination.
    Updated {
        /// Destination product id, when the destination reported one.
        product_id: Option<u64>,
    },
    /// The destination call failed.
    Failed {
        /// Error description.
        error: String,
    },
}

/// One entry of an import's ordered per-record log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLogEntry {
    /// Position of the record within the import, starting at 0.
    pub index: u64,
    /// Source identifier (SKU), when known.
    pub source_identifier: Option<String>,
    /// What happened.
    #[serde(flatten)]
    pub outcome: RecordOutcome,
}

/// Observability mapping of a syndicated record to its destination product.
///
/// Never consulted for deduplication; the destination's SKU lookup is
/// authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyndicationRecord {
    /// Connection that syndicated the record.
    pub connection_id: ConnectionId,
    /// Source identifier (SKU).
    pub source_identifier: String,
    /// Destination product id.
    pub destination_product_id: Option<u64>,
    /// Hex SHA-256 of the syndicated payload, excluding volatile metadata.
    pub content_hash: String,
}

/// Counters carried by an [`ImportRun`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportCounters {
    /// Records seen.
    pub processed: u64,
    /// Products created.
    pub created: u64,
    /// Products updated.
    pub updated: u64,
    /// Products deleted by stale reconciliation.
    pub deleted: u64,
    /// Records rejected by filter rules.
    pub filtered: u64,
    /// Records skipped (missing fields, no category, no SKU).
    pub skipped: u64,
    /// Records whose destination call failed.
    pub failed: u64,
}

/// One execution of the import pipeline for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRun {
    /// Run id, assigned by the run store.
    pub id: u64,
    /// Connection being imported.
    pub connection_id: ConnectionId,
    /// Feed being read.
    pub feed_id: FeedId,
    /// Current status.
    pub status: ImportStatus,
    /// Counters.
    pub counters: ImportCounters,
    /// Ordered per-record outcomes.
    pub log: Vec<RecordLogEntry>,
    /// Successful syndications, for observability.
    pub syndicated: Vec<SyndicationRecord>,
    /// Run-level error, set when the run failed.
    pub error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When processing started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
}

impl ImportRun {
    /// Creates a pending run.
    #[must_use]
    pub fn new(id: u64, connection_id: ConnectionId, feed_id: FeedId) -> Self {
        Self {
            id,
            connection_id,
            feed_id,
            status: ImportStatus::Pending,
            counters: ImportCounters::default(),
            log: Vec::new(),
            syndicated: Vec::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// `pending -> processing`.
    ///
    /// # Errors
    ///
    /// * If the run is not pending
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(ImportStatus::Processing, &[ImportStatus::Pending])?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// `processing -> completed`.
    ///
    /// # Errors
    ///
    /// * If the run is not processing
    pub fn complete(&mut self) -> Result<(), TransitionError> {
        self.transition(ImportStatus::Completed, &[ImportStatus::Processing])?;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// `{pending, processing} -> failed`, recording `error`.
    ///
    /// # Errors
    ///
    /// * If the run is already terminal
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(
            ImportStatus::Failed,
            &[ImportStatus::Pending, ImportStatus::Processing],
        )?;
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Appends a record outcome to the log and updates the counters.
    pub fn record(&mut self, source_identifier: Option<String>, outcome: RecordOutcome) {
        let counters = &mut self.counters;
        match &outcome {
            RecordOutcome::Filtered => counters.filtered += 1,
            RecordOutcome::Skipped { .. } => counters.skipped += 1,
            RecordOutcome::Created { .. } => counters.created += 1,
            RecordOutcome::Updated { .. } => counters.updated += 1,
            RecordOutcome::Failed { .. } => counters.failed += 1,
        }

        self.log.push(RecordLogEntry {
            index: counters.processed,
            source_identifier,
            outcome,
        });
        counters.processed += 1;
    }

    fn transition(
        &mut self,
        to: ImportStatus,
        allowed_from: &[ImportStatus],
    ) -> Result<(), TransitionError> {
        if !allowed_from.contains(&self.status) {
            return Err(TransitionError {
                id: self.id,
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }
}

/// Status of a [`CleanupRun`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CleanupStatus {
    /// Requested, not yet started.
    Pending,
    /// Listing or deleting.
    Running,
    /// Finished normally.
    Completed,
    /// Aborted by an unrecoverable error.
    Failed,
    /// Stopped by a cancellation request.
    Cancelled,
}

impl CleanupStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Why a cleanup was requested.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CleanupTrigger {
    /// The connection was deleted.
    ConnectionDeleted,
    /// The connection's feed was deleted.
    FeedDeleted,
    /// An operator asked for it.
    Manual,
    /// A completed import found products it no longer syndicates.
    StaleReconciliation,
}

/// Which of a connection's products a cleanup removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum CleanupScope {
    /// Every product tagged with the connection.
    All,
    /// Products whose last-seen timestamp predates the cutoff, or that
    /// carry none.
    StaleBefore {
        /// Cutoff timestamp.
        cutoff: DateTime<Utc>,
    },
}

/// One execution of bulk deletion for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupRun {
    /// Run id, assigned by the run store.
    pub id: u64,
    /// Connection whose products are removed.
    pub connection_id: ConnectionId,
    /// Feed of the connection, when the cleanup was triggered for a feed.
    pub feed_id: Option<FeedId>,
    /// Why the cleanup was requested.
    pub trigger: CleanupTrigger,
    /// Which products are removed.
    pub scope: CleanupScope,
    /// Count only; never delete.
    pub dry_run: bool,
    /// Current status.
    pub status: CleanupStatus,
    /// Products matched by the listing phase.
    pub products_found: u64,
    /// Products deleted.
    pub products_processed: u64,
    /// Products that could not be deleted.
    pub products_failed: u64,
    /// Individual error messages, in order.
    pub errors: Vec<String>,
    /// Aggregated error summary, set when the run failed.
    pub error_summary: Option<String>,
    /// Set externally to ask the run to stop at the next batch boundary.
    pub cancel_requested: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the run started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
}

impl CleanupRun {
    /// Creates a pending run.
    #[must_use]
    pub fn new(
        id: u64,
        connection_id: ConnectionId,
        trigger: CleanupTrigger,
        scope: CleanupScope,
        dry_run: bool,
    ) -> Self {
        Self {
            id,
            connection_id,
            feed_id: None,
            trigger,
            scope,
            dry_run,
            status: CleanupStatus::Pending,
            products_found: 0,
            products_processed: 0,
            products_failed: 0,
            errors: Vec::new(),
            error_summary: None,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Sets the feed the cleanup was requested for.
    #[must_use]
    pub const fn with_feed(mut self, feed_id: FeedId) -> Self {
        self.feed_id = Some(feed_id);
        self
    }

    /// `pending -> running`.
    ///
    /// # Errors
    ///
    /// * If the run is not pending
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(CleanupStatus::Running, &[CleanupStatus::Pending])?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// `running -> completed`.
    ///
    /// # Errors
    ///
    /// * If the run is not running
    pub fn complete(&mut self) -> Result<(), TransitionError> {
        self.transition(CleanupStatus::Completed, &[CleanupStatus::Running])?;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// `{pending, running} -> cancelled`.
    ///
    /// # Errors
    ///
    /// * If the run is already terminal
    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.transition(
            CleanupStatus::Cancelled,
            &[CleanupStatus::Pending, CleanupStatus::Running],
        )?;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// `{pending, running} -> failed`, aggregating the recorded errors and
    /// `error` into the summary. Counters are kept as they are.
    ///
    /// # Errors
    ///
    /// * If the run is already terminal
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(
            CleanupStatus::Failed,
            &[CleanupStatus::Pending, CleanupStatus::Running],
        )?;
        self.errors.push(error.into());
        self.error_summary = Some(summarize(&self.errors));
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    fn transition(
        &mut self,
        to: CleanupStatus,
        allowed_from: &[CleanupStatus],
    ) -> Result<(), TransitionError> {
        if !allowed_from.contains(&self.status) {
            return Err(TransitionError {
                id: self.id,
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }
}

/// Most errors repeat, so the summary lists each distinct message once
/// with its count, in first-seen order.
fn summarize(errors: &[String]) -> String {
    let mut distinct: Vec<(&str, usize)> = Vec::new();
    for error in errors {
        if let Some(entry) = distinct.iter_mut().find(|(e, _)| *e == error.as_str()) {
            entry.1 += 1;
        } else {
            distinct.push((error.as_str(), 1));
        }
    }

    distinct
        .into_iter()
        .map(|(error, count)| {
            if count > 1 {
                format!("{error} (x{count})")
            } else {
                error.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}
