//! Data models for fastreader.
//!
//! - [`BatchConfig`]: options recognized by a batch run
//! - [`AppConfig`]: the full `fastreader.yaml` document (batch, AI, storage and logging settings)
//! - [`QueueItem`]: a queued document and its status, progress and metadata
//! - [`BatchStats`] and [`BatchSummary`]: aggregate counters and the per-run result
//!
//! Items are never mutated directly; every status change goes through
//! [`QueueStateManager`](crate::state::QueueStateManager).

pub mod config;
pub mod queue;

pub use config::{
    AiSettings, AppConfig, BatchConfig, BookType, ChapterDetectionMode, ConfigError,
    LoggingSettings, ProcessingMode, QueueOrder, StorageSettings,
};
pub use queue::{
    BatchStats, BatchSummary, ItemId, ItemMetadata, ItemResult, ItemStatus, NewQueueItem,
    QueueItem,
};
