// External collaborators of a batch run
//
// The orchestrator only talks to the outside world through these traits, so every
// adapter (local files, HTTP providers, test doubles) can be swapped freely.

use crate::models::{BatchSummary, BookType, ChapterDetectionMode, ItemId, QueueItem};
use crate::services::retry::AiError;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A titled text unit extracted from a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subsection {
    pub id: String,
    pub title: String,
    pub text: String,
}

impl Subsection {
    pub fn new(id: impl Into<String>, title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            text: text.into(),
        }
    }
}

/// Hints passed along with the raw bytes when splitting a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionHints {
    pub source_name: String,
    pub detection_mode: ChapterDetectionMode,
}

/// Text returned by the provider with its token usage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AiResponse {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl AiResponse {
    pub fn new(text: impl Into<String>, input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            text: text.into(),
            input_tokens,
            output_tokens,
        }
    }
}

/// Result of the subsection pass, fed to the aggregate calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsectionSummary {
    pub title: String,
    pub summary: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Cost {
    pub usd: f64,
    pub rmb: f64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>>;

    /// Split a document into ordered subsections
    async fn extract_subsections(
        &self,
        bytes: &[u8],
        hints: &ExtractionHints,
    ) -> Result<Vec<Subsection>>;
}

/// Remote summarizer. Errors come back pre-classified for retrying.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AiClient: Send + Sync {
    /// Model name used for cost accounting and artifact metadata
    fn model(&self) -> String;

    async fn summarize(
        &self,
        title: &str,
        text: &str,
        book_type: BookType,
        language: &str,
    ) -> Result<AiResponse, AiError>;

    async fn analyze_connections(
        &self,
        summaries: &[SubsectionSummary],
        language: &str,
    ) -> Result<AiResponse, AiError>;

    async fn synthesize_overall(
        &self,
        title: &str,
        summaries: &[SubsectionSummary],
        connections: &str,
        language: &str,
    ) -> Result<AiResponse, AiError>;
}

/// Reports which sources already have an artifact. Called once per run.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessedLookup: Send + Sync {
    async fn bulk_check(&self, names: &[String]) -> Result<HashSet<String>>;
}

/// Durable artifact storage. Writes are keyed by path and idempotent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn upload(&self, path: &str, content: &str) -> Result<()>;
    async fn download(&self, path: &str) -> Result<Vec<u8>>;
}

#[cfg_attr(test, mockall::automock)]
pub trait CostModel: Send + Sync {
    fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> Cost;
}

/// Fire-and-forget notifications for the host. Every method defaults to a no-op.
pub trait BatchCallbacks: Send + Sync {
    fn on_item_start(&self, _item: &QueueItem) {}
    fn on_item_progress(&self, _id: ItemId, _percent: u8, _message: &str) {}
    fn on_item_complete(&self, _item: &QueueItem) {}
    fn on_item_error(&self, _item: &QueueItem, _message: &str) {}
    fn on_item_skip(&self, _item: &QueueItem, _reason: &str) {}
    fn on_queue_complete(&self, _summary: &BatchSummary) {}
}

/// Callbacks that ignore everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCallbacks;

impl BatchCallbacks for NoopCallbacks {}

/// Callbacks that write every notification to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingCallbacks;

impl BatchCallbacks for LoggingCallbacks {
    fn on_item_start(&self, item: &QueueItem) {
        tracing::info!("[{}] Started {}", item.id, item.source_name);
    }

    fn on_item_progress(&self, id: ItemId, percent: u8, message: &str) {
        tracing::debug!("[{}] {:>3}% {}", id, percent, message);
    }

    fn on_item_complete(&self, item: &QueueItem) {
        tracing::info!(
            "[{}] Completed {} ({} subsections, {} skipped, ${:.5})",
            item.id,
            item.source_name,
            item.metadata.subsection_count,
            item.metadata.skipped_count,
            item.metadata.cost_usd
        );
    }

    fn on_item_error(&self, item: &QueueItem, message: &str) {
        tracing::error!("[{}] Failed {}: {}", item.id, item.source_name, message);
    }

    fn on_item_skip(&self, item: &QueueItem, reason: &str) {
        tracing::info!("[{}] Skipped {}: {}", item.id, item.source_name, reason);
    }

    fn on_queue_complete(&self, summary: &BatchSummary) {
        tracing::info!(
            "Batch finished: {} succeeded, {} failed, {} skipped, {} pending in {:.1}s",
            summary.success_count,
            summary.failed_count,
            summary.skipped_count,
            summary.pending_count,
            summary.duration.as_secs_f64()
        );
    }
}
