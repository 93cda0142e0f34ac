//! Processing of one bounded list of feed records.
//!
//! Each record is filtered, categorized and transformed locally, then
//! syndicated through the destination's throttle. Records are sent in
//! sub-batches no larger than the destination's adaptive batch size, which
//! is re-read before every sub-batch so a degrading destination sees
//! smaller batches straight away.

use std::sync::Arc;

use elementa_feed::progress::{ProgressCallback, null_progress};
use elementa_feed_models::{Connection, DestinationKey, DestinationPayload, RawRecord, field_text};
use elementa_ingest_models::{ImportCounters, ImportRun, RecordOutcome, SyndicationRecord};
use elementa_transform::transform::transform;
use elementa_transform::{CategoryInput, SkipReason, category, filter};
use futures::StreamExt as _;

use crate::config::IngestConfig;
use crate::syndication::{SyndicationOutcome, SyndicationService};

/// Outcome of one record within a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkEntry {
    /// SKU of the record, when it has one.
    pub source_identifier: Option<String>,
    /// What happened.
    pub outcome: RecordOutcome,
}

/// Per-record outcomes of a chunk, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkReport {
    /// One entry per input record.
    pub entries: Vec<ChunkEntry>,
    /// Successful syndications.
    pub syndicated: Vec<SyndicationRecord>,
}

impl ChunkReport {
    /// Counters for this chunk alone.
    #[must_use]
    pub fn counters(&self) -> ImportCounters {
        let mut counters = ImportCounters::default();
        for entry in &self.entries {
            counters.processed += 1;
            match entry.outcome {
                RecordOutcome::Filtered => counters.filtered += 1,
                RecordOutcome::Skipped { .. } => counters.skipped += 1,
                RecordOutcome::Created { .. } => counters.created += 1,
                RecordOutcome::Updated { .. } => counters.updated += 1,
                RecordOutcome::Failed { .. } => counters.failed += 1,
            }
        }
        counters
    }

    /// Appends this chunk's outcomes to `run`.
    pub fn apply_to(self, run: &mut ImportRun) {
        for entry in self.entries {
            run.record(entry.source_identifier, entry.outcome);
        }
        run.syndicated.extend(self.syndicated);
    }

    fn push(&mut self, source_identifier: Option<String>, outcome: &SyndicationOutcome) {
        if let Some(record) = outcome.record() {
            self.syndicated.push(record.clone());
        }
        self.entries.push(ChunkEntry {
            source_identifier,
            outcome: outcome.record_outcome(),
        });
    }
}

/// Runs filter, transform and syndication over chunks of records.
#[derive(Clone)]
pub struct ChunkProcessor {
    syndication: SyndicationService,
    chunk_size: usize,
    max_concurrent: usize,
    progress: Arc<dyn ProgressCallback>,
}

impl std::fmt::Debug for ChunkProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkProcessor")
            .field("syndication", &self.syndication)
            .field("chunk_size", &self.chunk_size)
            .field("max_concurrent", &self.max_concurrent)
            .finish_non_exhaustive()
    }
}

impl ChunkProcessor {
    /// Creates a processor sized by `config`.
    #[must_use]
    pub fn new(syndication: SyndicationService, config: &IngestConfig) -> Self {
        Self {
            syndication,
            chunk_size: config.chunk_size.max(1),
            max_concurrent: config.max_concurrent_imports.max(1),
            progress: null_progress(),
        }
    }

    /// Reports one unit of progress per processed record.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Syndication service in use.
    #[must_use]
    pub const fn syndication(&self) -> &SyndicationService {
        &self.syndication
    }

    /// Records per sub-batch for `destination`: the configured chunk size,
    /// clamped to the throttle's current batch size.
    pub async fn effective_chunk_size(&self, destination: &DestinationKey) -> usize {
        let batch_size = self.syndication.throttle().batch_size(destination).await;
        self.chunk_size
            .min(usize::try_from(batch_size).unwrap_or(usize::MAX))
            .max(1)
    }

    /// Processes `records` for `connection`.
    ///
    /// Per-record problems become entries in the report; nothing here
    /// fails the chunk.
    pub async fn process(&self, connection: &Connection, records: Vec<RawRecord>) -> ChunkReport {
        let mut report = ChunkReport::default();
        let mut records = records.into_iter();

        loop {
            let size = self.effective_chunk_size(&connection.destination).await;
            let batch: Vec<RawRecord> = records.by_ref().take(size).collect();
            if batch.is_empty() {
                break;
            }
            log::debug!(
                "{}: connection {} sending {} records",
                connection.destination,
                connection.id,
                batch.len()
            );

            let count = batch.len() as u64;
            let syndication = &self.syndication;
            let outcomes: Vec<(Option<String>, SyndicationOutcome)> =
                futures::stream::iter(batch.into_iter().map(|record| async move {
                    let source_identifier = source_identifier(connection, &record);
                    let outcome = match prepare(connection, &record) {
                        Ok(payload) => syndication.syndicate(payload, connection).await,
                        Err(reason) => SyndicationOutcome::Skipped(reason),
                    };
                    (source_identifier, outcome)
                }))
                .buffered(self.max_concurrent)
                .collect()
                .await;

            for (source_identifier, outcome) in &outcomes {
                report.push(source_identifier.clone(), outcome);
            }
            self.progress.inc(count);
        }

        report
    }
}

/// Filters, categorizes and transforms one record without touching the
/// destination.
///
/// # Errors
///
/// * [`SkipReason::Filtered`] if no filter rule accepts the record
/// * Any [`SkipReason`] returned by the transformation
pub fn prepare(connection: &Connection, record: &RawRecord) -> Result<DestinationPayload, SkipReason> {
    if !filter::passes(record, &connection.filter_rules) {
        log::debug!(
            "{}: connection {} filtered out {:?}",
            connection.destination,
            connection.id,
            source_identifier(connection, record)
        );
        return Err(SkipReason::Filtered);
    }

    let token = connection.category_token(record);
    let resolved = token.as_deref().and_then(|token| {
        category::normalize(
            token,
            connection.category_delimiter.as_deref(),
            &connection.category_mappings,
        )
    });
    let category = CategoryInput {
        resolved,
        token: token.as_deref(),
    };

    transform(
        record,
        &connection.field_mappings,
        &connection.category_mappings,
        category,
    )
    .inspect_err(|reason| {
        log::info!(
            "{}: connection {} skipping {:?}: {reason}",
            connection.destination,
            connection.id,
            source_identifier(connection, record)
        );
    })
}

fn source_identifier(connection: &Connection, record: &RawRecord) -> Option<String> {
    connection
        .field_mappings
        .get("sku")
        .and_then(|column| field_text(record, column))
        .or_else(|| field_text(record, "sku"))
        .map(|sku| sku.trim().to_string())
        .filter(|sku| !sku.is_empty())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use elementa_destination::{ApiError, MemoryDestination};
    use elementa_feed_models::{
        CategoryMap, ConnectionId, FeedId, FieldMappings, FilterOperator, FilterRule,
    };
    use elementa_throttle::AdaptiveThrottle;
    use serde_json::json;

    use super::*;

    fn connection() -> Connection {
        let field_mappings: FieldMappings = [
            ("name", "Title"),
            ("regular_price", "Price"),
            ("sku", "SKU"),
            ("external_url", "Link"),
        ]
        .into_iter()
        .map(|(d, s)| (d.to_string(), s.to_string()))
        .collect();
        let category_mappings: CategoryMap = [("Running".to_string(), 42)].into_iter().collect();

        Connection {
            id: ConnectionId(3),
            feed_id: FeedId(9),
            destination: DestinationKey::new("shop.example.com"),
            field_mappings,
            category_mappings,
            category_field: Some("Cat".to_string()),
            category_delimiter: None,
            filter_rules: Vec::new(),
            schedule: None,
            is_active: true,
        }
    }

    fn record(sku: &str, category: &str) -> RawRecord {
        json!({
            "Title": format!("Product {sku}"),
            "Price": "$19.99",
            "SKU": sku,
            "Cat": category,
            "Link": format!("https://merchant.example.com/{sku}"),
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn processor(destination: &Arc<MemoryDestination>, config: &IngestConfig) -> ChunkProcessor {
        let syndication = SyndicationService::new(destination.clone(), AdaptiveThrottle::in_memory());
        ChunkProcessor::new(syndication, config)
    }

    #[tokio::test(start_paused = true)]
    async fn records_each_outcome_in_order() {
        let destination = Arc::new(MemoryDestination::new());
        let processor = processor(&destination, &IngestConfig::default());
        let mut no_sku = record("", "Shoes > Running");
        no_sku.remove("SKU");

        let report = processor
            .process(
                &connection(),
                vec![
                    record("S1", "Shoes > Running"),
                    record("S2", "Shoes > Hiking"),
                    no_sku,
                    record("S1", "Shoes > Running"),
                ],
            )
            .await;

        let outcomes: Vec<&RecordOutcome> = report.entries.iter().map(|e| &e.outcome).collect();
        assert!(matches!(outcomes[0], RecordOutcome::Created { .. }));
        assert!(
            matches!(outcomes[1], RecordOutcome::Skipped { reason } if reason.contains("no category"))
        );
        assert!(matches!(outcomes[2], RecordOutcome::Skipped { reason } if reason == "missing sku"));
        assert!(matches!(outcomes[3], RecordOutcome::Updated { .. }));
        assert_eq!(report.entries[1].source_identifier.as_deref(), Some("S2"));
        assert_eq!(report.entries[2].source_identifier, None);

        let counters = report.counters();
        assert_eq!(counters.processed, 4);
        assert_eq!((counters.created, counters.updated, counters.skipped), (1, 1, 2));
        assert_eq!(report.syndicated.len(), 2);

        let stored = destination.product_by_sku("S1").unwrap();
        assert_eq!(stored["regular_price"], json!("19.99"));
        assert_eq!(stored["categories"], json!([{ "id": 42 }]));
        assert_eq!(stored["status"], json!("draft"));
    }

    #[tokio::test(start_paused = true)]
    async fn filtered_records_never_reach_destination() {
        let destination = Arc::new(MemoryDestination::new());
        let processor = processor(&destination, &IngestConfig::default());
        let mut connection = connection();
        connection.filter_rules = vec![FilterRule::new("Title", FilterOperator::Contains, "S2")];

        let report = processor
            .process(
                &connection,
                vec![record("S1", "Running"), record("S2", "Running")],
            )
            .await;

        assert_eq!(report.entries[0].outcome, RecordOutcome::Filtered);
        assert!(matches!(
            report.entries[1].outcome,
            RecordOutcome::Created { .. }
        ));
        assert_eq!(report.counters().filtered, 1);
        assert_eq!(destination.upsert_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_sends_keep_input_order() {
        let destination = Arc::new(MemoryDestination::new().with_latency(Duration::from_millis(50)));
        let config = IngestConfig {
            max_concurrent_imports: 8,
            ..IngestConfig::default()
        };
        let processor = processor(&destination, &config);
        let records: Vec<RawRecord> = (0..30)
            .map(|i| record(&format!("S{i:02}"), "Running"))
            .collect();

        let report = processor.process(&connection(), records).await;

        let skus: Vec<String> = report
            .entries
            .iter()
            .filter_map(|e| e.source_identifier.clone())
            .collect();
        let expected: Vec<String> = (0..30).map(|i| format!("S{i:02}")).collect();
        assert_eq!(skus, expected);
        assert_eq!(report.counters().created, 30);
        assert_eq!(destination.products().len(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn chunk_size_follows_degraded_batch_size() {
        let destination = Arc::new(MemoryDestination::new());
        let processor = processor(&destination, &IngestConfig::default());
        let key = connection().destination;

        assert_eq!(processor.effective_chunk_size(&key).await, 25);

        destination.fail_next(ApiError::Status {
            status: 502,
            message: "bad gateway".to_string(),
        });
        let report = processor
            .process(&connection(), vec![record("S1", "Running")])
            .await;

        assert!(matches!(
            report.entries[0].outcome,
            RecordOutcome::Failed { .. }
        ));
        assert_eq!(report.counters().failed, 1);
        assert_eq!(processor.effective_chunk_size(&key).await, 12);
    }

    #[tokio::test]
    async fn configured_chunk_size_caps_batch_size() {
        let destination = Arc::new(MemoryDestination::new());
        let config = IngestConfig {
            chunk_size: 10,
            ..IngestConfig::default()
        };
        let processor = processor(&destination, &config);

        assert_eq!(
            processor
                .effective_chunk_size(&connection().destination)
                .await,
            10
        );
    }
}
