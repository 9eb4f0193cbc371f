//! fastReader - Unattended batch summarization of documents
//!
//! Main entry point for the command line runner.
//!
//! # Execution Flow
//!
//! 1. Load `fastreader.yaml` from the config directory (first argument, default
//!    `fastReader Data/`) with `FASTREADER_*` environment overrides
//! 2. Initialize logging → `<logging.dir>/fastreader.<date>`
//! 3. Create the tokio runtime with 4 worker threads
//! 4. Discover documents in `storage.source_dir`
//! 5. Run one batch against the configured OpenAI-compatible provider, writing
//!    `<name>-summary.md` artifacts into `storage.output_dir`
//! 6. Ctrl+C requests a cooperative stop; unfinished items stay pending
//! 7. Write a Markdown batch report next to the logs
//! 8. Shutdown the tokio runtime with 5s timeout

use anyhow::{Context, Result};
use fastreader::config::DEFAULT_CONFIG_DIR;
use fastreader::services::{
    LocalLibrary, LocalStore, LoggingCallbacks, OpenAiClient, PricingTable, render_batch_report,
};
use fastreader::{APP_NAME, BatchOrchestrator, Collaborators, ConfigManager, VERSION};
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<()> {
    let config_dir = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_DIR.to_string());

    let config_manager = ConfigManager::new(config_dir.as_str())?;
    let config = config_manager.load_layered()?;
    config.validate().context("Invalid configuration")?;

    let _log_guard = fastreader::logging::setup_logging(&config.logging, "fastreader")?;
    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(4)
        .thread_name("fastreader-worker")
        .build()?;

    tracing::info!("Tokio runtime initialized with {} worker threads", 4);

    let result = runtime.block_on(async {
        let library = LocalLibrary::new(config.storage.source_dir.as_str())?;
        let store = Arc::new(LocalStore::new(config.storage.output_dir.as_str())?);
        let items = library.discover()?;

        let collaborators = Collaborators {
            source: Arc::new(library),
            ai: Arc::new(OpenAiClient::new(&config.ai)?),
            lookup: store.clone(),
            store,
            cost: Arc::new(PricingTable::new(config.ai.exchange_rate)),
            callbacks: Arc::new(LoggingCallbacks),
        };
        let orchestrator = BatchOrchestrator::new(collaborators);

        let control = orchestrator.control().clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received - stopping after in-flight work");
                control.stop();
            }
        });

        let summary = orchestrator.run(items, &config.batch).await?;
        orchestrator.metrics().log_summary();

        let report_path = camino::Utf8PathBuf::from(&config.logging.dir).join(format!(
            "batch_report_{}.md",
            summary.started_at.format("%Y%m%d_%H%M%S")
        ));
        tokio::fs::write(&report_path, render_batch_report(&summary))
            .await
            .with_context(|| format!("Failed to write batch report: {}", report_path))?;
        tracing::info!("Batch report written to {}", report_path);

        anyhow::Ok(summary)
    });

    runtime.shutdown_timeout(Duration::from_secs(5));

    let summary = result.inspect_err(|e| tracing::error!("Batch run failed: {:#}", e))?;
    tracing::info!(
        "Application shutdown complete ({} of {} items completed)",
        summary.success_count,
        summary.total_items
    );

    Ok(())
}
