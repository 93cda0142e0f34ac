#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Product feed ingestion.
//!
//! Advertising networks publish product feeds as delimited text files (CSV,
//! TSV, pipe-separated), frequently gzip-compressed. [`reader::FeedReader`]
//! turns such a file, local or remote, into [`RawRecord`]s keyed by the
//! header row. [`connection`] loads and validates the TOML connection
//! definitions that tell the pipeline what to do with those records.

pub mod connection;
pub mod progress;
pub mod reader;
pub mod retry;

pub use elementa_feed_models::RawRecord;

/// Errors that can occur while reading feeds or loading connections.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The feed host answered with a non-success status.
    #[error("HTTP {status} fetching {url}")]
    Status {
        /// Response status code.
        status: u16,
        /// Requested URL.
        url: String,
    },

    /// I/O error (file read).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Delimited text could not be parsed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The feed has no usable header row.
    #[error("Feed has no header row")]
    MissingHeader,

    /// The configured delimiter is not a single byte.
    #[error("Unsupported delimiter: {0:?}")]
    UnsupportedDelimiter(String),

    /// A download header is malformed.
    #[error("Invalid header {0}")]
    InvalidHeader(String),

    /// A connection definition is malformed or fails validation.
    #[error("Invalid connection: {message}")]
    InvalidConnection {
        /// Description of what went wrong.
        message: String,
    },
}
