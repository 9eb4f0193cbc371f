use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identifier assigned to an item when it enters the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a queued document.
///
/// `Pending` is initial, `Completed`, `Failed` and `Skipped` are terminal.
/// The only way back to `Pending` is an explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemStatus::Completed | ItemStatus::Failed | ItemStatus::Skipped
        )
    }

    /// Forward edges of the item state machine
    pub fn can_transition_to(self, next: ItemStatus) -> bool {
        use ItemStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Skipped)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Skipped)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
            ItemStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A document submitted to a batch run, before it has an id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewQueueItem {
    pub source_name: String,
    pub source_location: String,
    /// 1-based subsection indices, `None` selects everything
    pub selected_subsections: Option<Vec<usize>>,
}

impl NewQueueItem {
    pub fn new(source_name: impl Into<String>, source_location: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            source_location: source_location.into(),
            selected_subsections: None,
        }
    }

    /// Restrict processing to the 1-based `indices`; an empty list selects everything
    pub fn with_selection(mut self, indices: Vec<usize>) -> Self {
        self.selected_subsections = (!indices.is_empty()).then_some(indices);
        self
    }
}

/// Counters, timings and cost attached to an item when it completes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub subsection_count: usize,
    pub processed_count: usize,
    pub skipped_count: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub cost_usd: f64,
    pub cost_rmb: f64,
    pub output_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ItemId,
    pub source_name: String,
    pub source_location: String,
    pub status: ItemStatus,
    pub progress: u8,
    pub error: Option<String>,
    pub skip_reason: Option<String>,
    pub selected_subsections: Option<Vec<usize>>,
    pub metadata: ItemMetadata,
}

impl QueueItem {
    pub(crate) fn from_new(id: ItemId, item: NewQueueItem) -> Self {
        Self {
            id,
            source_name: item.source_name,
            source_location: item.source_location,
            status: ItemStatus::Pending,
            progress: 0,
            error: None,
            skip_reason: None,
            selected_subsections: item.selected_subsections,
            metadata: ItemMetadata::default(),
        }
    }
}

/// Aggregate counters kept in lock-step with item statuses
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_cost_usd: f64,
    pub total_cost_rmb: f64,
}

impl BatchStats {
    /// Items that reached a terminal status
    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.skipped
    }

    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.finished())
    }
}

/// Outcome of one item in a run, as reported in the summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub id: ItemId,
    pub source_name: String,
    pub status: ItemStatus,
    pub output_path: Option<String>,
    pub error: Option<String>,
    pub skip_reason: Option<String>,
    pub subsection_count: usize,
    pub skipped_subsections: usize,
    pub cost_usd: f64,
    pub cost_rmb: f64,
}

impl From<&QueueItem> for ItemResult {
    fn from(item: &QueueItem) -> Self {
        Self {
            id: item.id,
            source_name: item.source_name.clone(),
            status: item.status,
            output_path: item.metadata.output_path.clone(),
            error: item.error.clone(),
            skip_reason: item.skip_reason.clone(),
            subsection_count: item.metadata.subsection_count,
            skipped_subsections: item.metadata.skipped_count,
            cost_usd: item.metadata.cost_usd,
            cost_rmb: item.metadata.cost_rmb,
        }
    }
}

/// Result of a batch run, produced even when every item failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_items: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    /// Items left pending because the run was stopped
    pub pending_count: usize,
    pub total_cost_usd: f64,
    pub total_cost_rmb: f64,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub stopped: bool,
    pub results: Vec<ItemResult>,
}

impl BatchSummary {
    pub fn from_items(
        items: &[QueueItem],
        started_at: DateTime<Utc>,
        duration: Duration,
        stopped: bool,
    ) -> Self {
        let count = |status: ItemStatus| items.iter().filter(|i| i.status == status).count();
        let completed = || items.iter().filter(|i| i.status == ItemStatus::Completed);

        Self {
            total_items: items.len(),
            success_count: count(ItemStatus::Completed),
            failed_count: count(ItemStatus::Failed),
            skipped_count: count(ItemStatus::Skipped),
            pending_count: count(ItemStatus::Pending) + count(ItemStatus::Processing),
            total_cost_usd: completed().map(|i| i.metadata.cost_usd).sum(),
            total_cost_rmb: completed().map(|i| i.metadata.cost_rmb).sum(),
            started_at,
            duration,
            stopped,
            results: items.iter().map(ItemResult::from).collect(),
        }
    }
}
