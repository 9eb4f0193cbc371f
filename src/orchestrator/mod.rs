//! Batch orchestration.
//!
//! [`BatchOrchestrator::run`] takes a list of documents and drives each one
//! through the item pipeline:
//!
//! 1. Queue every document as pending
//! 2. Skip documents the [`ProcessedLookup`] already knows, with one bulk call
//! 3. Admit the rest in queue order through a [`ConcurrencyLimiter`]
//! 4. Each admitted item fetches, extracts, summarizes (through the retry
//!    executor), aggregates, prices and uploads its artifact
//! 5. Build a [`BatchSummary`] from the final item states
//!
//! Item failures never escape `run`; they end up in the summary. Pause and
//! stop are cooperative through [`RunControl`].

mod control;
mod pipeline;

pub use control::{Checkpoint, RunControl, RunStatus};
pub use pipeline::{
    PROGRESS_CONNECTIONS, PROGRESS_EXTRACT, PROGRESS_FETCH, PROGRESS_OVERALL, PROGRESS_SAVE,
    SKIP_REASON_TOO_SHORT,
};

use crate::metrics::BatchMetrics;
use crate::models::{
    BatchConfig, BatchSummary, ConfigError, ItemId, ItemStatus, NewQueueItem, QueueOrder,
};
use crate::services::collaborators::{
    AiClient, ArtifactStore, BatchCallbacks, CostModel, DocumentSource, ProcessedLookup,
};
use crate::services::limiter::{ConcurrencyLimiter, LimiterError};
use crate::state::QueueStateManager;
use chrono::Utc;
use pipeline::ItemPipeline;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio::time::Instant;
use thiserror::Error;

/// Skip reason recorded for documents that already have an artifact
pub const SKIP_REASON_ALREADY_PROCESSED: &str = "already processed";

/// Run-level misuse. Item failures are never reported this way.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("a batch run is already in progress")]
    AlreadyRunning,

    #[error("invalid batch configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error(transparent)]
    Limiter(#[from] LimiterError),
}

/// The external services a run talks to
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn DocumentSource>,
    pub ai: Arc<dyn AiClient>,
    pub lookup: Arc<dyn ProcessedLookup>,
    pub store: Arc<dyn ArtifactStore>,
    pub cost: Arc<dyn CostModel>,
    pub callbacks: Arc<dyn BatchCallbacks>,
}

/// Apply queue ordering and the per-run document cap
pub fn order_items(
    mut items: Vec<NewQueueItem>,
    order: QueueOrder,
    max_files: usize,
) -> Vec<NewQueueItem> {
    if order == QueueOrder::Random {
        items.shuffle(&mut rand::thread_rng());
    }
    if max_files > 0 && items.len() > max_files {
        tracing::info!("Limiting run to {} of {} documents", max_files, items.len());
        items.truncate(max_files);
    }
    items
}

/// Resets the processing flag on every exit path of `run`
struct RunGuard<'a>(&'a RunControl);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Drives batch runs over one queue.
///
/// Each orchestrator owns its queue state and run flags, so separate
/// orchestrators can run side by side without coordinating.
pub struct BatchOrchestrator {
    collaborators: Collaborators,
    state: QueueStateManager,
    control: RunControl,
    metrics: Arc<BatchMetrics>,
}

impl BatchOrchestrator {
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            collaborators,
            state: QueueStateManager::new(),
            control: RunControl::new(),
            metrics: Arc::new(BatchMetrics::new()),
        }
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    pub fn state(&self) -> &QueueStateManager {
        &self.state
    }

    pub fn metrics(&self) -> Arc<BatchMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Process `items` and report the outcome of every one of them.
    ///
    /// Only returns an error when the run cannot start at all.
    pub async fn run(
        &self,
        items: Vec<NewQueueItem>,
        config: &BatchConfig,
    ) -> Result<BatchSummary, BatchError> {
        config.validate()?;
        let limiter = ConcurrencyLimiter::new(config.concurrency)?;

        if !self.control.begin() {
            return Err(BatchError::AlreadyRunning);
        }
        let _guard = RunGuard(&self.control);

        let started = Instant::now();
        let started_at = Utc::now();

        let items = order_items(items, config.order, config.max_files);
        let ids = self.state.add_items(items);
        tracing::info!(
            "Starting batch of {} items ({} mode, concurrency {})",
            ids.len(),
            config.processing_mode.as_str(),
            config.concurrency
        );

        if config.skip_processed {
            self.skip_already_processed(&ids).await;
        }

        let pending: Vec<ItemId> = self
            .state
            .items(&ids)
            .into_iter()
            .filter(|item| item.status == ItemStatus::Pending)
            .map(|item| item.id)
            .collect();

        let config = Arc::new(config.clone());
        let mut tasks = Vec::with_capacity(pending.len());

        for id in pending {
            // Acquire before spawning so admission follows queue order
            let slot = tokio::select! {
                biased;
                _ = self.control.stopped() => {
                    tracing::info!("Stop requested, no further items will be started");
                    break;
                }
                slot = limiter.acquire() => slot?,
            };

            let pipeline = ItemPipeline {
                collaborators: self.collaborators.clone(),
                state: self.state.clone(),
                control: self.control.clone(),
                metrics: Arc::clone(&self.metrics),
                config: Arc::clone(&config),
            };

            tasks.push((
                id,
                tokio::spawn(async move {
                    let _slot = slot;
                    pipeline.run(id).await;
                }),
            ));
        }

        for (id, task) in tasks {
            if let Err(e) = task.await {
                tracing::error!("Task for item {} ended abnormally: {}", id, e);
                // A panicking pipeline leaves its item processing
                if let Ok(failed) = self.state.fail(id, format!("worker task failed: {e}")) {
                    self.metrics.record_item_failed();
                    self.collaborators
                        .callbacks
                        .on_item_error(&failed, failed.error.as_deref().unwrap_or_default());
                }
            }
        }

        let summary = BatchSummary::from_items(
            &self.state.items(&ids),
            started_at,
            started.elapsed(),
            self.control.should_stop(),
        );

        tracing::info!(
            "Batch complete: {} succeeded, {} failed, {} skipped, {} pending, ${:.5} / ¥{:.5}",
            summary.success_count,
            summary.failed_count,
            summary.skipped_count,
            summary.pending_count,
            summary.total_cost_usd,
            summary.total_cost_rmb
        );
        self.collaborators.callbacks.on_queue_complete(&summary);

        Ok(summary)
    }

    /// One bulk lookup; hits go straight from pending to skipped.
    /// A failing lookup only costs the skip, the run continues.
    async fn skip_already_processed(&self, ids: &[ItemId]) {
        let items = self.state.items(ids);
        let names: Vec<String> = items.iter().map(|i| i.source_name.clone()).collect();

        let processed = match self.collaborators.lookup.bulk_check(&names).await {
            Ok(processed) => processed,
            Err(e) => {
                tracing::warn!("Already-processed lookup failed, processing everything: {:#}", e);
                return;
            }
        };

        let mut skipped_count = 0;
        for item in items.iter().filter(|i| processed.contains(&i.source_name)) {
            match self.state.skip(item.id, SKIP_REASON_ALREADY_PROCESSED) {
                Ok(skipped) => {
                    skipped_count += 1;
                    self.metrics.record_item_skipped();
                    self.collaborators
                        .callbacks
                        .on_item_skip(&skipped, SKIP_REASON_ALREADY_PROCESSED);
                }
                Err(e) => tracing::warn!("Could not skip {}: {}", item.source_name, e),
            }
        }
        tracing::info!("{} of {} items already processed", skipped_count, items.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProcessingMode;
    use crate::services::collaborators::{
        AiResponse, Cost, MockAiClient, MockArtifactStore, MockCostModel, MockDocumentSource,
        MockProcessedLookup, NoopCallbacks, Subsection,
    };
    use crate::services::retry::AiError;
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn test_config() -> BatchConfig {
        BatchConfig {
            processing_mode: ProcessingMode::ChapterMap,
            base_retry_delay_ms: 10,
            inter_call_delay_ms: 0,
            pause_poll_interval_ms: 10,
            ..BatchConfig::default()
        }
    }

    fn items(names: &[&str]) -> Vec<NewQueueItem> {
        names
            .iter()
            .map(|name| NewQueueItem::new(*name, format!("/library/{name}")))
            .collect()
    }

    fn one_chapter_source() -> MockDocumentSource {
        let mut source = MockDocumentSource::new();
        source.expect_fetch().returning(|_| Ok(b"raw".to_vec()));
        source
            .expect_extract_subsections()
            .returning(|_, _| Ok(vec![Subsection::new("1", "Chapter 1", "x".repeat(200))]));
        source
    }

    fn empty_lookup() -> MockProcessedLookup {
        let mut lookup = MockProcessedLookup::new();
        lookup.expect_bulk_check().returning(|_| Ok(HashSet::new()));
        lookup
    }

    fn fixed_cost() -> MockCostModel {
        let mut cost = MockCostModel::new();
        cost.expect_cost().returning(|_, _, _| Cost { usd: 0.5, rmb: 3.5 });
        cost
    }

    fn summarizing_ai() -> MockAiClient {
        let mut ai = MockAiClient::new();
        ai.expect_model().returning(|| "test-model".to_string());
        ai.expect_summarize()
            .returning(|_, _, _, _| Ok(AiResponse::new("chapter summary", 10, 5)));
        ai.expect_analyze_connections()
            .returning(|_, _| Ok(AiResponse::new("linked", 3, 1)));
        ai
    }

    fn recording_store(uploads: Arc<Mutex<Vec<(String, String)>>>) -> MockArtifactStore {
        let mut store = MockArtifactStore::new();
        store.expect_upload().returning(move |path, content| {
            uploads
                .lock()
                .unwrap()
                .push((path.to_string(), content.to_string()));
            Ok(())
        });
        store
    }

    fn orchestrator(
        source: MockDocumentSource,
        ai: MockAiClient,
        lookup: MockProcessedLookup,
        store: MockArtifactStore,
        cost: MockCostModel,
    ) -> BatchOrchestrator {
        BatchOrchestrator::new(Collaborators {
            source: Arc::new(source),
            ai: Arc::new(ai),
            lookup: Arc::new(lookup),
            store: Arc::new(store),
            cost: Arc::new(cost),
            callbacks: Arc::new(NoopCallbacks),
        })
    }

    #[test]
    fn test_order_items_caps_files() {
        let items: Vec<_> = (0..5)
            .map(|i| NewQueueItem::new(format!("{i}.txt"), format!("/{i}.txt")))
            .collect();

        let sequential = order_items(items.clone(), QueueOrder::Sequential, 2);
        assert_eq!(sequential, items[..2].to_vec());

        let random = order_items(items.clone(), QueueOrder::Random, 0);
        assert_eq!(random.len(), 5);
        for item in &items {
            assert!(random.contains(item));
        }
    }

    #[tokio::test]
    async fn test_already_processed_items_make_no_calls() {
        let mut source = MockDocumentSource::new();
        source.expect_fetch().never();
        source.expect_extract_subsections().never();
        let mut ai = MockAiClient::new();
        ai.expect_summarize().never();
        let mut store = MockArtifactStore::new();
        store.expect_upload().never();
        let mut lookup = MockProcessedLookup::new();
        lookup
            .expect_bulk_check()
            .times(1)
            .returning(|_| Ok(HashSet::from(["book.epub".to_string()])));

        let orch = orchestrator(source, ai, lookup, store, MockCostModel::new());
        let summary = orch.run(items(&["book.epub"]), &test_config()).await.unwrap();

        assert_eq!(summary.total_items, 1);
        assert_eq!(summary.skipped_count, 1);
        assert_eq!(summary.success_count, 0);
        assert_eq!(
            summary.results[0].skip_reason.as_deref(),
            Some(SKIP_REASON_ALREADY_PROCESSED)
        );
    }

    #[tokio::test]
    async fn test_only_unprocessed_items_are_fetched() {
        let mut source = MockDocumentSource::new();
        source.expect_fetch().times(1).returning(|_| Ok(b"raw".to_vec()));
        source
            .expect_extract_subsections()
            .returning(|_, _| Ok(vec![Subsection::new("1", "Chapter 1", "x".repeat(200))]));
        let mut lookup = MockProcessedLookup::new();
        lookup
            .expect_bulk_check()
            .returning(|_| Ok(HashSet::from(["done.txt".to_string()])));
        let uploads = Arc::new(Mutex::new(Vec::new()));

        let orch = orchestrator(
            source,
            summarizing_ai(),
            lookup,
            recording_store(uploads.clone()),
            fixed_cost(),
        );
        let summary = orch
            .run(items(&["done.txt", "new.txt"]), &test_config())
            .await
            .unwrap();

        assert_eq!(summary.skipped_count, 1);
        assert_eq!(summary.success_count, 1);
        let uploads = uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "new-summary.md");
    }

    #[tokio::test]
    async fn test_skip_processed_disabled_ignores_lookup() {
        let mut lookup = MockProcessedLookup::new();
        lookup.expect_bulk_check().never();
        let uploads = Arc::new(Mutex::new(Vec::new()));

        let orch = orchestrator(
            one_chapter_source(),
            summarizing_ai(),
            lookup,
            recording_store(uploads.clone()),
            fixed_cost(),
        );
        let config = BatchConfig {
            skip_processed: false,
            ..test_config()
        };
        let summary = orch.run(items(&["a.txt"]), &config).await.unwrap();

        assert_eq!(summary.success_count, 1);
    }

    #[tokio::test]
    async fn test_every_item_failing_still_returns_summary() {
        let mut source = MockDocumentSource::new();
        source
            .expect_fetch()
            .times(3)
            .returning(|_| Err(anyhow::anyhow!("disk on fire")));
        let mut ai = MockAiClient::new();
        ai.expect_summarize().never();
        let mut store = MockArtifactStore::new();
        store.expect_upload().never();

        let orch = orchestrator(source, ai, empty_lookup(), store, MockCostModel::new());
        let summary = orch
            .run(items(&["a.txt", "b.txt", "c.txt"]), &test_config())
            .await
            .unwrap();

        assert_eq!(summary.failed_count, 3);
        assert_eq!(summary.success_count, 0);
        for result in &summary.results {
            assert_eq!(result.status, ItemStatus::Failed);
            assert!(result.error.as_deref().unwrap().contains("disk on fire"));
        }
        assert!(!orch.control().is_processing());
    }

    #[tokio::test]
    async fn test_costs_sum_over_completed_items() {
        let uploads = Arc::new(Mutex::new(Vec::new()));
        let orch = orchestrator(
            one_chapter_source(),
            summarizing_ai(),
            empty_lookup(),
            recording_store(uploads.clone()),
            fixed_cost(),
        );

        let summary = orch
            .run(items(&["a.txt", "b.txt"]), &test_config())
            .await
            .unwrap();

        assert_eq!(summary.success_count, 2);
        assert_eq!(summary.total_cost_usd, 1.0);
        assert_eq!(summary.total_cost_rmb, 7.0);
        assert_eq!(orch.state().stats().completed, 2);
    }

    #[tokio::test]
    async fn test_content_filter_becomes_skip_marker() {
        let mut ai = MockAiClient::new();
        ai.expect_model().returning(|| "test-model".to_string());
        ai.expect_summarize()
            .times(1)
            .returning(|_, _, _, _| Err(AiError::ContentFiltered("blocked".to_string())));
        ai.expect_analyze_connections()
            .times(1)
            .returning(|_, _| Ok(AiResponse::new("linked", 3, 1)));
        let uploads = Arc::new(Mutex::new(Vec::new()));

        let orch = orchestrator(
            one_chapter_source(),
            ai,
            empty_lookup(),
            recording_store(uploads.clone()),
            fixed_cost(),
        );
        let config = BatchConfig {
            retry_content_filter: false,
            ..test_config()
        };
        let summary = orch.run(items(&["a.txt"]), &config).await.unwrap();

        // Every subsection downgraded, the item still completes
        assert_eq!(summary.success_count, 1);
        assert_eq!(summary.results[0].status, ItemStatus::Completed);
        assert_eq!(summary.results[0].skipped_subsections, 1);
        let snapshot = orch.state().snapshot();
        assert_eq!(snapshot.items[0].metadata.processed_count, 0);
        assert_eq!(snapshot.items[0].metadata.subsection_count, 1);
        let uploads = uploads.lock().unwrap();
        assert!(uploads[0].1.contains("[SKIPPED]"));
    }

    #[tokio::test]
    async fn test_summary_mode_synthesizes_without_connections() {
        let mut ai = MockAiClient::new();
        ai.expect_model().returning(|| "test-model".to_string());
        ai.expect_summarize()
            .times(1)
            .returning(|_, _, _, _| Ok(AiResponse::new("chapter summary", 10, 5)));
        ai.expect_analyze_connections().never();
        ai.expect_synthesize_overall()
            .times(1)
            .withf(|_, _, connections, _| connections.is_empty())
            .returning(|_, _, _, _| Ok(AiResponse::new("the gist", 4, 2)));
        let uploads = Arc::new(Mutex::new(Vec::new()));

        let orch = orchestrator(
            one_chapter_source(),
            ai,
            empty_lookup(),
            recording_store(uploads.clone()),
            fixed_cost(),
        );
        let config = BatchConfig {
            processing_mode: ProcessingMode::Summary,
            ..test_config()
        };
        let summary = orch.run(items(&["a.txt"]), &config).await.unwrap();

        assert_eq!(summary.success_count, 1);
        let uploads = uploads.lock().unwrap();
        assert!(uploads[0].1.contains("## Overview"));
        assert!(!uploads[0].1.contains("## Connections"));
    }

    #[tokio::test]
    async fn test_combined_map_feeds_connections_into_overall() {
        let mut ai = MockAiClient::new();
        ai.expect_model().returning(|| "test-model".to_string());
        ai.expect_summarize()
            .times(1)
            .returning(|_, _, _, _| Ok(AiResponse::new("chapter summary", 10, 5)));
        ai.expect_analyze_connections()
            .times(1)
            .returning(|_, _| Ok(AiResponse::new("linked", 3, 1)));
        ai.expect_synthesize_overall()
            .times(1)
            .withf(|_, _, connections, _| connections == "linked")
            .returning(|_, _, _, _| Ok(AiResponse::new("the gist", 4, 2)));
        let uploads = Arc::new(Mutex::new(Vec::new()));

        let orch = orchestrator(
            one_chapter_source(),
            ai,
            empty_lookup(),
            recording_store(uploads.clone()),
            fixed_cost(),
        );
        let config = BatchConfig {
            processing_mode: ProcessingMode::CombinedMap,
            ..test_config()
        };
        let summary = orch.run(items(&["a.txt"]), &config).await.unwrap();

        assert_eq!(summary.success_count, 1);
        let snapshot = orch.state().snapshot();
        let item = &snapshot.items[0];
        assert_eq!(item.metadata.input_tokens, 17);
        assert_eq!(item.metadata.output_tokens, 8);
        let uploads = uploads.lock().unwrap();
        assert!(uploads[0].1.contains("## Overview"));
        assert!(uploads[0].1.contains("## Connections"));
    }

    #[tokio::test]
    async fn test_lookup_failure_processes_everything() {
        let mut lookup = MockProcessedLookup::new();
        lookup
            .expect_bulk_check()
            .returning(|_| Err(anyhow::anyhow!("storage offline")));
        let uploads = Arc::new(Mutex::new(Vec::new()));

        let orch = orchestrator(
            one_chapter_source(),
            summarizing_ai(),
            lookup,
            recording_store(uploads.clone()),
            fixed_cost(),
        );
        let summary = orch
            .run(items(&["a.txt", "b.txt"]), &test_config())
            .await
            .unwrap();

        assert_eq!(summary.success_count, 2);
        assert_eq!(uploads.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rejects_concurrent_run() {
        let orch = orchestrator(
            MockDocumentSource::new(),
            MockAiClient::new(),
            MockProcessedLookup::new(),
            MockArtifactStore::new(),
            MockCostModel::new(),
        );

        assert!(orch.control().begin());
        let result = orch.run(items(&["a.txt"]), &test_config()).await;
        assert!(matches!(result, Err(BatchError::AlreadyRunning)));
        assert!(orch.state().snapshot().items.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_zero_concurrency() {
        let orch = orchestrator(
            MockDocumentSource::new(),
            MockAiClient::new(),
            MockProcessedLookup::new(),
            MockArtifactStore::new(),
            MockCostModel::new(),
        );
        let config = BatchConfig {
            concurrency: 0,
            ..test_config()
        };

        let result = orch.run(items(&["a.txt"]), &config).await;
        assert!(matches!(
            result,
            Err(BatchError::InvalidConfig(ConfigError::ZeroConcurrency))
        ));
        assert!(!orch.control().is_processing());
    }
}
