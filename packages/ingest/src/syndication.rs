//! Stateless upsert of one transformed payload.
//!
//! The destination's own metadata is the record of what has been
//! syndicated: every payload is tagged with its connection, source
//! identifier and last-seen time, and the destination matches existing
//! products by SKU. Nothing is tracked locally for deduplication.

use std::slice;
use std::sync::Arc;

use chrono::Utc;
use elementa_destination::{ApiClient, meta};
use elementa_feed_models::{Connection, DestinationPayload, field_text};
use elementa_ingest_models::{RecordOutcome, SyndicationRecord};
use elementa_throttle::AdaptiveThrottle;
use elementa_transform::SkipReason;
use elementa_transform::transform::normalize_images;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

/// What happened to one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyndicationOutcome {
    /// The destination created a new product.
    Created(SyndicationRecord),
    /// The destination updated an existing product matched by SKU.
    Updated(SyndicationRecord),
    /// No call was made.
    Skipped(SkipReason),
    /// The destination call failed or rejected the product.
    Failed(String),
}

impl SyndicationOutcome {
    /// The outcome as recorded on an import run.
    #[must_use]
    pub fn record_outcome(&self) -> RecordOutcome {
        match self {
            Self::Created(record) => RecordOutcome::Created {
                product_id: record.destination_product_id,
            },
            Self::Updated(record) => RecordOutcome::Updated {
                product_id: record.destination_product_id,
            },
            Self::Skipped(SkipReason::Filtered) => RecordOutcome::Filtered,
            Self::Skipped(reason) => RecordOutcome::Skipped {
                reason: reason.to_string(),
            },
            Self::Failed(error) => RecordOutcome::Failed {
                error: error.clone(),
            },
        }
    }

    /// The syndication record, for successful outcomes.
    #[must_use]
    pub const fn record(&self) -> Option<&SyndicationRecord> {
        match self {
            Self::Created(record) | Self::Updated(record) => Some(record),
            Self::Skipped(_) | Self::Failed(_) => None,
        }
    }
}

/// Sends payloads to a destination through its adaptive throttle.
#[derive(Clone)]
pub struct SyndicationService {
    client: Arc<dyn ApiClient>,
    throttle: AdaptiveThrottle,
}

impl std::fmt::Debug for SyndicationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyndicationService")
            .field("throttle", &self.throttle)
            .finish_non_exhaustive()
    }
}

impl SyndicationService {
    /// Creates a service over `client`, gated by `throttle`.
    #[must_use]
    pub fn new(client: Arc<dyn ApiClient>, throttle: AdaptiveThrottle) -> Self {
        Self { client, throttle }
    }

    /// Throttle in use.
    #[must_use]
    pub const fn throttle(&self) -> &AdaptiveThrottle {
        &self.throttle
    }

    /// Upserts `payload` for `connection`.
    ///
    /// Never fails: a missing SKU is a skip, and a destination error is
    /// logged and reported as [`SyndicationOutcome::Failed`].
    pub async fn syndicate(
        &self,
        mut payload: DestinationPayload,
        connection: &Connection,
    ) -> SyndicationOutcome {
        let destination = &connection.destination;

        if field_text(&payload, "product_url").is_some_and(|url| !url.trim().is_empty()) {
            payload.insert("type".to_string(), json!("external"));
        }
        normalize_images(&mut payload);

        let Some(sku) = field_text(&payload, "sku")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
        else {
            log::info!(
                "{destination}: connection {} skipping {:?}: missing sku",
                connection.id,
                field_text(&payload, "name")
            );
            return SyndicationOutcome::Skipped(SkipReason::MissingSku);
        };

        meta::set(
            &mut payload,
            meta::LAST_SEEN,
            Value::String(Utc::now().to_rfc3339()),
        );
        meta::set(&mut payload, meta::CONNECTION_ID, json!(connection.id.0));
        meta::set(&mut payload, meta::SOURCE_IDENTIFIER, json!(sku));

        let result = self
            .throttle
            .call(destination, || {
                self.client.upsert_products(slice::from_ref(&payload))
            })
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                if e.is_distress() {
                    log::warn!("{destination}: upsert of {sku} hit destination distress: {e}");
                } else {
                    log::error!("{destination}: upsert of {sku} failed: {e}");
                }
                return SyndicationOutcome::Failed(e.to_string());
            }
        };

        if !response.success || !response.failed.is_empty() {
            log::error!("{destination}: destination rejected {sku}");
            return SyndicationOutcome::Failed(format!("destination rejected product {sku}"));
        }

        let record = SyndicationRecord {
            connection_id: connection.id,
            destination_product_id: response.product_ids.get(&sku).copied(),
            content_hash: content_hash(&payload),
            source_identifier: sku,
        };

        if response.total_created > 0 {
            log::debug!(
                "{destination}: created {} as {:?}",
                record.source_identifier,
                record.destination_product_id
            );
            SyndicationOutcome::Created(record)
        } else {
            log::debug!(
                "{destination}: updated {} ({:?})",
                record.source_identifier,
                record.destination_product_id
            );
            SyndicationOutcome::Updated(record)
        }
    }
}

/// Hex SHA-256 of `payload` without its last-seen timestamp, so re-sending
/// unchanged content yields the same hash.
#[must_use]
pub fn content_hash(payload: &DestinationPayload) -> String {
    let mut stable = payload.clone();
    meta::remove(&mut stable, meta::LAST_SEEN);
    let bytes = serde_json::to_vec(&stable).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

#[cfg(test)]
mod tests {
    use elementa_destination::{ApiError, MemoryDestination};
    use elementa_feed_models::{ConnectionId, DestinationKey, FeedId};

    use super::*;

    fn connection() -> Connection {
        Connection {
            id: ConnectionId(7),
            feed_id: FeedId(1),
            destination: DestinationKey::new("shop.example.com"),
            field_mappings: elementa_feed_models::FieldMappings::new(),
            category_mappings: elementa_feed_models::CategoryMap::new(),
            category_field: None,
            category_delimiter: None,
            filter_rules: Vec::new(),
            schedule: None,
            is_active: true,
        }
    }

    fn payload(value: &Value) -> DestinationPayload {
        value.as_object().cloned().unwrap()
    }

    fn service(destination: &Arc<MemoryDestination>) -> SyndicationService {
        SyndicationService::new(destination.clone(), AdaptiveThrottle::in_memory())
    }

    #[tokio::test]
    async fn creates_then_updates_with_metadata() {
        let destination = Arc::new(MemoryDestination::new());
        let service = service(&destination);
        let product = payload(&json!({
            "name": "Shoe",
            "sku": "S1",
            "product_url": "https://example.com/s1",
            "images": "https://example.com/a.jpg, https://example.com/b.jpg",
        }));

        let first = service.syndicate(product.clone(), &connection()).await;
        let SyndicationOutcome::Created(record) = &first else {
            panic!("expected created, got {first:?}");
        };
        assert_eq!(record.source_identifier, "S1");
        assert_eq!(record.content_hash.len(), 64);

        let stored = destination.product_by_sku("S1").unwrap();
        assert_eq!(stored["type"], json!("external"));
        assert_eq!(
            stored["images"],
            json!([{ "src": "https://example.com/a.jpg" }, { "src": "https://example.com/b.jpg" }])
        );
        assert!(meta::belongs_to(&stored, ConnectionId(7)));
        assert_eq!(meta::get(&stored, meta::SOURCE_IDENTIFIER), Some(&json!("S1")));
        assert!(meta::last_seen(&stored).is_some());

        let second = service.syndicate(product, &connection()).await;
        let SyndicationOutcome::Updated(again) = &second else {
            panic!("expected updated, got {second:?}");
        };
        assert_eq!(again.destination_product_id, record.destination_product_id);
        assert_eq!(again.content_hash, record.content_hash);
        assert_eq!(destination.products().len(), 1);
    }

    #[tokio::test]
    async fn missing_sku_skips_without_calling() {
        let destination = Arc::new(MemoryDestination::new());
        let outcome = service(&destination)
            .syndicate(payload(&json!({ "name": "Shoe", "sku": "  " })), &connection())
            .await;

        assert_eq!(outcome, SyndicationOutcome::Skipped(SkipReason::MissingSku));
        assert_eq!(destination.upsert_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn destination_errors_do_not_propagate() {
        let destination = Arc::new(MemoryDestination::new());
        destination.fail_next(ApiError::Status {
            status: 503,
            message: "unavailable".to_string(),
        });
        let service = service(&destination);

        let outcome = service
            .syndicate(payload(&json!({ "name": "Shoe", "sku": "S1" })), &connection())
            .await;

        assert!(matches!(outcome, SyndicationOutcome::Failed(ref e) if e.contains("503")));
        assert!(matches!(
            outcome.record_outcome(),
            RecordOutcome::Failed { .. }
        ));
        let state = service
            .throttle()
            .state(&connection().destination)
            .await
            .unwrap();
        assert!(state.recovering);
        assert_eq!(state.batch_size, 12);
    }

    #[test]
    fn hash_ignores_last_seen() {
        let mut a = payload(&json!({ "sku": "S1" }));
        let mut b = a.clone();
        meta::set(&mut a, meta::LAST_SEEN, json!("2024-01-01T00:00:00+00:00"));
        meta::set(&mut b, meta::LAST_SEEN, json!("2025-01-01T00:00:00+00:00"));
        assert_eq!(content_hash(&a), content_hash(&b));

        meta::set(&mut b, meta::SOURCE_IDENTIFIER, json!("S1"));
        assert_ne!(content_hash(&a), content_hash(&b));
    }
}
