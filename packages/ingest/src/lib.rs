#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Product feed syndication pipeline.
//!
//! Records flow through [`chunk::ChunkProcessor`]: filter, category
//! normalization, transformation, then one throttled upsert per record via
//! [`syndication::SyndicationService`]. [`import::Importer`] wraps a whole
//! feed in an `ImportRun`; [`cleanup::CleanupRunner`] removes a
//! connection's products from the destination in guarded, cancellable
//! `CleanupRun`s.
//!
//! Per-record problems are recorded on the run and never abort it. Only
//! run-level failures surface as [`IngestError`].

pub mod chunk;
pub mod cleanup;
pub mod config;
pub mod import;
pub mod runs;
pub mod syndication;

use elementa_feed::FeedError;
use elementa_feed_models::ConnectionId;
use elementa_ingest_models::TransitionError;

pub use chunk::{ChunkProcessor, ChunkReport};
pub use cleanup::CleanupRunner;
pub use config::IngestConfig;
pub use import::Importer;
pub use runs::{CleanupRequest, MemoryRunStore, RunStore};
pub use syndication::{SyndicationOutcome, SyndicationService};

/// Errors that end an import or cleanup, or prevent one from starting.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Feed could not be read or a connection failed to load
    #[error(transparent)]
    Feed(#[from] FeedError),
    /// A run was asked to make an illegal status change
    #[error(transparent)]
    Transition(#[from] TransitionError),
    /// Imports are never run for inactive connections
    #[error("connection {0} is inactive")]
    InactiveConnection(ConnectionId),
    /// A non-terminal cleanup already exists for the connection
    #[error("connection {connection_id} already has active cleanup run {run_id}")]
    CleanupActive {
        /// Connection the cleanup was requested for.
        connection_id: ConnectionId,
        /// The run that is still active.
        run_id: u64,
    },
    /// No run with this id exists
    #[error("run {0} not found")]
    RunNotFound(u64),
    /// The run store failed
    #[error("run store error: {0}")]
    RunStore(String),
    /// Configuration value out of range
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Configuration TOML could not be parsed
    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
    /// Configuration file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A run could not be serialized for output
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use elementa_feed::connection::load_connection;

    use super::*;

    fn load(path: &Path) -> Result<elementa_feed_models::Connection, IngestError> {
        Ok(load_connection(path)?)
    }

    #[test]
    fn feed_errors_convert() {
        let err = load(Path::new("/nonexistent/elementa/connection.toml")).unwrap_err();
        assert!(matches!(err, IngestError::Feed(FeedError::Io(_))));
    }

    #[test]
    fn config_errors_convert() {
        let err = IngestConfig::load(Path::new("/nonexistent/elementa/ingest.toml")).unwrap_err();
        assert!(matches!(err, IngestError::Io(_)));
        assert!(err.to_string().starts_with("I/O error"));
    }
}
