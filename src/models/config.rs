use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// What a batch run produces for every document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessingMode {
    /// Subsection summaries and an overall synthesis
    #[default]
    Summary,
    /// One concept map per subsection plus the cross-subsection connections
    ChapterMap,
    /// Subsection maps, connections and an overall synthesis fed by them
    CombinedMap,
}

impl ProcessingMode {
    /// Whether the relationship-analysis call runs after the subsection pass
    pub fn needs_connections(self) -> bool {
        matches!(self, ProcessingMode::ChapterMap | ProcessingMode::CombinedMap)
    }

    /// Whether the overall-synthesis call runs after the subsection pass
    pub fn needs_overall(self) -> bool {
        matches!(self, ProcessingMode::Summary | ProcessingMode::CombinedMap)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingMode::Summary => "summary",
            ProcessingMode::ChapterMap => "chapter-map",
            ProcessingMode::CombinedMap => "combined-map",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BookType {
    Fiction,
    #[default]
    NonFiction,
}

impl BookType {
    pub fn as_str(self) -> &'static str {
        match self {
            BookType::Fiction => "fiction",
            BookType::NonFiction => "non-fiction",
        }
    }
}

/// Order in which queued documents are admitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueOrder {
    #[default]
    Sequential,
    Random,
}

/// Hint handed to the document source when splitting a document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChapterDetectionMode {
    #[default]
    Normal,
    Smart,
    EpubToc,
}

impl ChapterDetectionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ChapterDetectionMode::Normal => "normal",
            ChapterDetectionMode::Smart => "smart",
            ChapterDetectionMode::EpubToc => "epub-toc",
        }
    }
}

/// Errors reported by configuration validation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("pause poll interval must be greater than zero")]
    ZeroPollInterval,

    #[error("AI model name must not be empty")]
    EmptyModel,

    #[error("exchange rate must be a positive number, got {0}")]
    InvalidExchangeRate(f64),
}

/// Options recognized by a batch run.
///
/// Every field has a default so partial YAML files and environment
/// overrides deserialize cleanly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub processing_mode: ProcessingMode,
    pub book_type: BookType,
    pub skip_processed: bool,
    pub order: QueueOrder,
    pub output_language: String,
    pub chapter_detection_mode: ChapterDetectionMode,

    /// Maximum number of documents per run, 0 means all
    pub max_files: usize,

    /// Item pipelines allowed to run at the same time
    pub concurrency: usize,

    pub max_retries: u32,
    pub base_retry_delay_ms: u64,

    /// Retry content-filtered subsection summaries before downgrading them
    pub retry_content_filter: bool,

    pub inter_call_delay_ms: u64,
    pub pause_poll_interval_ms: u64,

    /// Subsections shorter than this are skipped without an AI call
    pub min_subsection_chars: usize,
    /// Subsection text is truncated to this many characters
    pub max_subsection_chars: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            processing_mode: ProcessingMode::default(),
            book_type: BookType::default(),
            skip_processed: true,
            order: QueueOrder::default(),
            output_language: "en".to_string(),
            chapter_detection_mode: ChapterDetectionMode::default(),
            max_files: 0,
            concurrency: 2,
            max_retries: 3,
            base_retry_delay_ms: 60_000,
            retry_content_filter: true,
            inter_call_delay_ms: 100,
            pause_poll_interval_ms: 1_000,
            min_subsection_chars: 100,
            max_subsection_chars: 50_000,
        }
    }
}

impl BatchConfig {
    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    pub fn inter_call_delay(&self) -> Duration {
        Duration::from_millis(self.inter_call_delay_ms)
    }

    pub fn pause_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pause_poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.pause_poll_interval_ms == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        Ok(())
    }
}

/// Connection settings for the OpenAI-compatible provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiSettings {
    pub provider: String,
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub request_timeout_secs: u64,

    /// USD to RMB conversion used by the cost model
    pub exchange_rate: f64,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            api_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            request_timeout_secs: 120,
            exchange_rate: 7.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory scanned for source documents
    pub source_dir: String,
    /// Directory that receives the rendered artifacts
    pub output_dir: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            source_dir: "library".to_string(),
            output_dir: "summaries".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub dir: String,
    pub debug: bool,
    pub console: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            dir: "logs".to_string(),
            debug: false,
            console: true,
        }
    }
}

/// Complete application configuration stored in `fastreader.yaml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub batch: BatchConfig,
    pub ai: AiSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.batch.validate()?;
        if self.ai.model.trim().is_empty() {
            return Err(ConfigError::EmptyModel);
        }
        if !(self.ai.exchange_rate.is_finite() && self.ai.exchange_rate > 0.0) {
            return Err(ConfigError::InvalidExchangeRate(self.ai.exchange_rate));
        }
        Ok(())
    }
}
