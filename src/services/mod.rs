//! Services module - building blocks and adapters used by a batch run.
//!
//! Nothing in here knows about queues or item states; the orchestrator wires these
//! pieces together. Everything is usable on its own and testable without a runtime
//! beyond tokio.
//!
//! # Components
//!
//! - [`ConcurrencyLimiter`]: FIFO counting gate that caps in-flight work. Hands out
//!   RAII [`ConcurrencySlot`]s that release on drop, including on error, panic and
//!   task cancellation.
//!
//! - [`RetryExecutor`]: Runs a provider call under a [`RetryPolicy`]:
//!   - Rate limits wait `max(base_delay, retry_after)`, the hint defaulting to 10s
//!   - Content-filter rejections optionally retry, then downgrade to a [`SkipMarker`]
//!   - Every other error is returned at once
//!
//! - [`collaborators`]: The traits a run talks through ([`DocumentSource`],
//!   [`AiClient`], [`ProcessedLookup`], [`ArtifactStore`], [`CostModel`],
//!   [`BatchCallbacks`]).
//!
//! - Adapters:
//!   - [`LocalLibrary`] / [`LocalStore`]: plain-text documents and Markdown
//!     artifacts on disk
//!   - [`OpenAiClient`]: any OpenAI-compatible chat completion endpoint
//!   - [`PricingTable`]: per-model token prices with a USD to RMB rate
//!
//! - [`artifact`]: Artifact naming and Markdown rendering.
//!
//! # Usage Example
//!
//! ```ignore
//! use fastreader::services::{RetryExecutor, RetryPolicy};
//!
//! let executor = RetryExecutor::new(RetryPolicy::default());
//! let outcome = executor
//!     .execute_or_skip(|| client.summarize(title, text, book_type, "en"), |_| {})
//!     .await?;
//! ```

pub mod artifact;
pub mod collaborators;
pub mod cost;
pub mod limiter;
pub mod local;
pub mod openai;
pub mod retry;

pub use artifact::{ARTIFACT_SUFFIX, ArtifactMetadata, artifact_file_name, render_batch_report};
pub use collaborators::{
    AiClient, AiResponse, ArtifactStore, BatchCallbacks, Cost, CostModel, DocumentSource,
    ExtractionHints, LoggingCallbacks, NoopCallbacks, ProcessedLookup, Subsection,
    SubsectionSummary,
};
pub use cost::{ModelPrice, PricingTable};
pub use limiter::{ConcurrencyLimiter, ConcurrencySlot, LimiterError};
pub use local::{LocalLibrary, LocalStore};
pub use openai::OpenAiClient;
pub use retry::{
    AiError, Attempt, CallOutcome, ErrorClass, RetryExecutor, RetryPolicy, SkipMarker,
};
