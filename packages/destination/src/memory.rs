//! In-process storefront.
//!
//! Behaves like a destination's product API: SKU-keyed upsert, listing by
//! reconciliation metadata, delete by id. Failures and latency can be
//! injected to exercise the throttle and cleanup paths.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use elementa_feed_models::{DestinationPayload, field_text};

use crate::{ApiClient, ApiError, DeleteResult, ListQuery, ListedProduct, UpsertResult, meta};

#[derive(Debug, Default)]
struct Inner {
    products: BTreeMap<u64, DestinationPayload>,
    next_id: u64,
    failures: VecDeque<ApiError>,
    upsert_calls: u64,
    list_calls: u64,
    delete_calls: u64,
}

impl Inner {
    fn find_by_sku(&self, sku: &str) -> Option<u64> {
        self.products
            .iter()
            .find(|(_, p)| field_text(p, "sku").as_deref() == Some(sku))
            .map(|(id, _)| *id)
    }
}

/// In-memory [`ApiClient`].
#[derive(Debug, Default)]
pub struct MemoryDestination {
    inner: Mutex<Inner>,
    latency: Option<Duration>,
}

impl MemoryDestination {
    /// Creates an empty storefront.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a fixed delay to every call.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Makes the next call (of any kind) fail with `error`. Queued errors
    /// are consumed in order.
    pub fn fail_next(&self, error: ApiError) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failures.push_back(error);
        }
    }

    /// Stores `payload` directly, bypassing the API. Returns its id.
    pub fn seed(&self, payload: DestinationPayload) -> u64 {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        inner.next_id += 1;
        let id = inner.next_id;
        inner.products.insert(id, payload);
        id
    }

    /// Snapshot of every stored product, by id.
    #[must_use]
    pub fn products(&self) -> BTreeMap<u64, DestinationPayload> {
        self.inner
            .lock()
            .map(|inner| inner.products.clone())
            .unwrap_or_default()
    }

    /// Stored product with the given SKU.
    #[must_use]
    pub fn product_by_sku(&self, sku: &str) -> Option<DestinationPayload> {
        let inner = self.inner.lock().ok()?;
        let id = inner.find_by_sku(sku)?;
        inner.products.get(&id).cloned()
    }

    /// Number of upsert calls received.
    #[must_use]
    pub fn upsert_calls(&self) -> u64 {
        self.inner.lock().map_or(0, |inner| inner.upsert_calls)
    }

    /// Number of list calls received.
    #[must_use]
    pub fn list_calls(&self) -> u64 {
        self.inner.lock().map_or(0, |inner| inner.list_calls)
    }

    /// Number of delete calls received.
    #[must_use]
    pub fn delete_calls(&self) -> u64 {
        self.inner.lock().map_or(0, |inner| inner.delete_calls)
    }

    async fn begin(&self) -> Result<MutexGuard<'_, Inner>, ApiError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self
            .inner
            .lock()
            .map_err(|_| ApiError::Transport("storefront lock poisoned".to_string()))?;
        if let Some(error) = inner.failures.pop_front() {
            log::debug!("Injected storefront failure: {error}");
            return Err(error);
        }
        Ok(inner)
    }
}

#[async_trait]
impl ApiClient for MemoryDestination {
    async fn upsert_products(
        &self,
        products: &[DestinationPayload],
    ) -> Result<UpsertResult, ApiError> {
        let mut inner = self.begin().await?;
        inner.upsert_calls += 1;

        let mut result = UpsertResult::default();
        for payload in products {
            let Some(sku) = field_text(payload, "sku").map(|s| s.into_owned()) else {
                result.failed.push(payload.clone());
                continue;
            };

            let id = if let Some(id) = inner.find_by_sku(&sku) {
                result.total_updated += 1;
                id
            } else {
                inner.next_id += 1;
                result.total_created += 1;
                inner.next_id
            };
            inner.products.insert(id, payload.clone());
            result.product_ids.insert(sku, id);
        }
        drop(inner);

        result.success = result.failed.is_empty();
        Ok(result)
    }

    async fn list_products(&self, query: ListQuery) -> Result<Vec<ListedProduct>, ApiError> {
        let mut inner = self.begin().await?;
        inner.list_calls += 1;

        let per_page = query.per_page.max(1) as usize;
        let skip = query.page.saturating_sub(1) as usize * per_page;

        Ok(inner
            .products
            .iter()
            .filter(|(_, p)| meta::belongs_to(p, query.connection_id))
            .skip(skip)
            .take(per_page)
            .map(|(id, p)| ListedProduct {
                id: *id,
                sku: field_text(p, "sku").map(|s| s.into_owned()),
                last_seen: meta::last_seen(p),
            })
            .collect())
    }

    async fn delete_products(&self, ids: &[u64]) -> Result<DeleteResult, ApiError> {
        let mut inner = self.begin().await?;
        inner.delete_calls += 1;

        let mut result = DeleteResult::default();
        for id in ids {
            if inner.products.remove(id).is_some() {
                result.deleted.push(*id);
            } else {
                result.failed.push(*id);
            }
        }
        drop(inner);

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use elementa_feed_models::ConnectionId;
    use serde_json::json;

    use super::*;

    fn product(sku: &str, connection: u64) -> DestinationPayload {
        let mut payload = json!({ "sku": sku, "name": sku }).as_object().cloned().unwrap();
        meta::set(&mut payload, meta::CONNECTION_ID, json!(connection));
        payload
    }

    #[tokio::test]
    async fn upsert_creates_then_updates_by_sku() {
        let store = MemoryDestination::new();

        let first = store.upsert_products(&[product("A", 1)]).await.unwrap();
        assert_eq!((first.total_created, first.total_updated), (1, 0));

        let second = store
            .upsert_products(&[product("A", 1), product("B", 1)])
            .await
            .unwrap();
        assert_eq!((second.total_created, second.total_updated), (1, 1));
        assert!(second.success);
        assert_eq!(second.product_ids["A"], first.product_ids["A"]);
        assert_eq!(store.products().len(), 2);
    }

    #[tokio::test]
    async fn upsert_rejects_missing_sku() {
        let store = MemoryDestination::new();
        let payload = json!({ "name": "no sku" }).as_object().cloned().unwrap();

        let result = store.upsert_products(&[payload]).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.failed.len(), 1);
    }

    #[tokio::test]
    async fn lists_only_tagged_products_in_pages() {
        let store = MemoryDestination::new();
        for sku in ["A", "B", "C"] {
            store.seed(product(sku, 1));
        }
        store.seed(product("X", 2));

        let query = |page| ListQuery {
            connection_id: ConnectionId(1),
            page,
            per_page: 2,
        };
        assert_eq!(store.list_products(query(1)).await.unwrap().len(), 2);
        let last = store.list_products(query(2)).await.unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].sku.as_deref(), Some("C"));
        assert!(store.list_products(query(3)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let store = MemoryDestination::new();
        store.fail_next(ApiError::Timeout);

        assert_eq!(
            store.upsert_products(&[product("A", 1)]).await,
            Err(ApiError::Timeout)
        );
        assert!(store.upsert_products(&[product("A", 1)]).await.is_ok());
        assert_eq!(store.upsert_calls(), 1);
    }

    #[tokio::test]
    async fn delete_reports_unknown_ids() {
        let store = MemoryDestination::new();
        let id = store.seed(product("A", 1));

        let result = store.delete_products(&[id, 999]).await.unwrap();
        assert_eq!(result.deleted, vec![id]);
        assert_eq!(result.failed, vec![999]);
        assert_eq!(store.delete_calls(), 1);
    }
}
