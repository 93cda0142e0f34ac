#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Destination storefront API contract.
//!
//! The pipeline talks to a storefront only through [`ApiClient`]. Real
//! REST clients are supplied by the embedding application;
//! [`memory::MemoryDestination`] is an in-process storefront used by tests
//! and the `simulate` command.

pub mod memory;
pub mod meta;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use elementa_feed_models::{ConnectionId, DestinationPayload};
use elementa_throttle_models::DistressSignal;
use serde::{Deserialize, Serialize};

pub use memory::MemoryDestination;

/// Errors returned by an [`ApiClient`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// The destination answered with a non-success HTTP status
    #[error("destination returned HTTP {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },
    /// The request did not complete in time
    #[error("request to destination timed out")]
    Timeout,
    /// The request could not be sent or the connection dropped
    #[error("transport error: {0}")]
    Transport(String),
    /// The destination answered with something that could not be understood
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Whether this error indicates destination distress: HTTP status >= 500
    /// or a timeout.
    #[must_use]
    pub const fn is_distress(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status >= 500,
            Self::Timeout => true,
            Self::Transport(_) | Self::InvalidResponse(_) => false,
        }
    }

    /// HTTP status, if the destination answered at all.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl DistressSignal for ApiError {
    fn is_distress(&self) -> bool {
        Self::is_distress(self)
    }
}

/// Outcome of a batch upsert.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpsertResult {
    /// Whether every product in the batch was accepted.
    pub success: bool,
    /// Products created.
    pub total_created: u64,
    /// Products updated in place (matched by SKU).
    pub total_updated: u64,
    /// Payloads the destination rejected.
    #[serde(default)]
    pub failed: Vec<DestinationPayload>,
    /// SKU -> destination product id, for accepted products.
    #[serde(default)]
    pub product_ids: BTreeMap<String, u64>,
}

/// Page request for [`ApiClient::list_products`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListQuery {
    /// Only products tagged with this connection.
    pub connection_id: ConnectionId,
    /// 1-based page number.
    pub page: u32,
    /// Page size.
    pub per_page: u32,
}

/// A product as returned by a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedProduct {
    /// Destination product id.
    pub id: u64,
    /// Product SKU, if it has one.
    pub sku: Option<String>,
    /// When the pipeline last syndicated this product.
    pub last_seen: Option<DateTime<Utc>>,
}

/// Outcome of a batch delete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResult {
    /// Ids removed.
    pub deleted: Vec<u64>,
    /// Ids the destination refused or did not know.
    pub failed: Vec<u64>,
}

/// A destination storefront's product API.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Creates or updates products, matching existing ones by SKU.
    ///
    /// # Errors
    ///
    /// * If the request fails as a whole
    async fn upsert_products(
        &self,
        products: &[DestinationPayload],
    ) -> Result<UpsertResult, ApiError>;

    /// Lists one page of products tagged with a connection's metadata.
    /// A page shorter than `per_page` is the last one.
    ///
    /// # Errors
    ///
    /// * If the request fails
    async fn list_products(&self, query: ListQuery) -> Result<Vec<ListedProduct>, ApiError>;

    /// Deletes products by id.
    ///
    /// # Errors
    ///
    /// * If the request fails as a whole
    async fn delete_products(&self, ids: &[u64]) -> Result<DeleteResult, ApiError>;
}
