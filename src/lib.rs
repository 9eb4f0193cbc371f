// fastReader - Unattended batch summarization of documents
//
// This is the library crate containing the batch orchestrator, its building blocks
// and the bundled adapters. The binary crate (main.rs) runs one batch over a local library.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod state;

// Re-export commonly used types for convenience
pub use config::ConfigManager;
pub use metrics::BatchMetrics;
pub use models::{AppConfig, BatchConfig, BatchSummary, ItemStatus, NewQueueItem, QueueItem};
pub use orchestrator::{BatchError, BatchOrchestrator, Collaborators, RunControl};
pub use state::{QueueEvent, QueueStateManager, TransitionError};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
