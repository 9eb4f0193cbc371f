// Per-item pipeline
//
// Runs inside one concurrency slot: fetch -> extract -> subsection summaries ->
// connections -> overall synthesis -> cost -> artifact upload. Poll points sit before
// every provider call and before the upload, so a stop never leaves a partial artifact.

use super::control::{Checkpoint, RunControl};
use super::Collaborators;
use crate::metrics::BatchMetrics;
use crate::models::{BatchConfig, ItemId, ItemMetadata, QueueItem};
use crate::services::artifact::{
    ArtifactMetadata, RenderedSection, artifact_file_name, book_title, render_document,
};
use crate::services::collaborators::{AiResponse, ExtractionHints, Subsection, SubsectionSummary};
use crate::services::retry::{Attempt, CallOutcome, RetryExecutor, RetryPolicy, SkipMarker};
use crate::state::QueueStateManager;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::time::Instant;

pub const PROGRESS_FETCH: u8 = 5;
pub const PROGRESS_EXTRACT: u8 = 10;
pub const PROGRESS_SUBSECTIONS_SPAN: usize = 60;
pub const PROGRESS_CONNECTIONS: u8 = 75;
pub const PROGRESS_OVERALL: u8 = 85;
pub const PROGRESS_SAVE: u8 = 95;

pub const SKIP_REASON_TOO_SHORT: &str = "content too short";

#[derive(Debug, Default, Clone, Copy)]
struct TokenUsage {
    input: u64,
    output: u64,
}

impl TokenUsage {
    fn add(&mut self, response: &AiResponse) {
        self.input += response.input_tokens;
        self.output += response.output_tokens;
    }
}

/// Text of a call that may have been downgraded to a skip marker
enum CallText {
    Text(String),
    Skipped(String),
}

/// Everything one item needs, cloned out of the orchestrator per task
#[derive(Clone)]
pub(crate) struct ItemPipeline {
    pub collaborators: Collaborators,
    pub state: QueueStateManager,
    pub control: RunControl,
    pub metrics: Arc<BatchMetrics>,
    pub config: Arc<BatchConfig>,
}

impl ItemPipeline {
    fn summarize_executor(&self) -> RetryExecutor {
        RetryExecutor::new(
            RetryPolicy::new(self.config.max_retries, self.config.base_retry_delay())
                .with_content_filter_retries(self.config.retry_content_filter),
        )
    }

    /// Aggregate calls retry rate limits only; a filtered result is downgraded at once
    fn aggregate_executor(&self) -> RetryExecutor {
        RetryExecutor::new(RetryPolicy::new(
            self.config.max_retries,
            self.config.base_retry_delay(),
        ))
    }

    async fn checkpoint(&self) -> Checkpoint {
        self.control
            .checkpoint(self.config.pause_poll_interval())
            .await
    }

    fn progress(&self, id: ItemId, percent: u8, message: &str) {
        match self.state.update_progress(id, percent, message) {
            Ok(progress) => self
                .collaborators
                .callbacks
                .on_item_progress(id, progress, message),
            Err(e) => tracing::debug!("Progress update ignored: {}", e),
        }
    }

    fn retry_hook(&self, id: ItemId, what: &str) -> impl FnMut(&Attempt) + '_ {
        let what = what.to_string();
        move |attempt: &Attempt| {
            self.metrics.record_retry(attempt.last_error);
            let progress = self.state.item(id).map(|i| i.progress).unwrap_or(0);
            self.collaborators.callbacks.on_item_progress(
                id,
                progress,
                &format!(
                    "{}: {} (attempt {}/{}), retrying in {}s",
                    what,
                    attempt.last_error,
                    attempt.class_attempt,
                    attempt.max_attempts,
                    attempt.next_delay.as_secs()
                ),
            );
        }
    }

    /// Drive one item from pending to a final state
    pub async fn run(self, id: ItemId) {
        if self.checkpoint().await == Checkpoint::Stop {
            tracing::debug!("Item {} not started, stop requested", id);
            return;
        }

        let item = match self.state.claim(id) {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!("Could not claim item {}: {}", id, e);
                return;
            }
        };
        self.collaborators.callbacks.on_item_start(&item);
        tracing::info!("Processing {} ({})", item.source_name, id);

        let started = Instant::now();
        let start_time = Utc::now();

        match self.process(&item, start_time).await {
            Ok(Some(metadata)) => match self.state.complete(id, metadata) {
                Ok(done) => {
                    self.metrics.record_item_completed(started.elapsed());
                    self.collaborators.callbacks.on_item_complete(&done);
                }
                Err(e) => tracing::warn!("Could not complete item {}: {}", id, e),
            },
            Ok(None) => {
                tracing::info!("Stopped {} before completion, returning it to the queue", item.source_name);
                if let Err(e) = self.state.reset(id) {
                    tracing::warn!("Could not reset item {}: {}", id, e);
                }
            }
            Err(e) => {
                let message = format!("{e:#}");
                tracing::error!("Failed {}: {}", item.source_name, message);
                match self.state.fail(id, message.clone()) {
                    Ok(failed) => {
                        self.metrics.record_item_failed();
                        self.collaborators.callbacks.on_item_error(&failed, &message);
                    }
                    Err(e) => tracing::warn!("Could not fail item {}: {}", id, e),
                }
            }
        }
    }

    /// `Ok(None)` means a stop was observed and nothing was written
    async fn process(&self, item: &QueueItem, start_time: DateTime<Utc>) -> Result<Option<ItemMetadata>> {
        let c = &self.collaborators;
        let config = &self.config;
        let id = item.id;
        let title = book_title(&item.source_name).to_string();

        self.progress(id, PROGRESS_FETCH, "Downloading source");
        let bytes = c
            .source
            .fetch(&item.source_location)
            .await
            .with_context(|| format!("Failed to fetch {}", item.source_location))?;

        self.progress(id, PROGRESS_EXTRACT, "Extracting subsections");
        let hints = ExtractionHints {
            source_name: item.source_name.clone(),
            detection_mode: config.chapter_detection_mode,
        };
        let subsections = c
            .source
            .extract_subsections(&bytes, &hints)
            .await
            .with_context(|| format!("Failed to extract subsections from {}", item.source_name))?;
        drop(bytes);

        let original_chars: usize = subsections.iter().map(|s| s.text.chars().count()).sum();
        let selected = select_subsections(subsections, item.selected_subsections.as_deref())?;
        let processed_chars: usize = selected.iter().map(|s| s.text.chars().count()).sum();

        let mut usage = TokenUsage::default();
        let mut summaries = Vec::with_capacity(selected.len());
        let mut processed_count = 0;
        let mut skipped_count = 0;

        let summarize = self.summarize_executor();
        for (i, sub) in selected.iter().enumerate() {
            if self.checkpoint().await == Checkpoint::Stop {
                return Ok(None);
            }

            let percent = PROGRESS_EXTRACT + (i * PROGRESS_SUBSECTIONS_SPAN / selected.len()) as u8;
            self.progress(
                id,
                percent,
                &format!("Summarizing {}/{}: {}", i + 1, selected.len(), sub.title),
            );

            let summary = if sub.text.chars().count() < config.min_subsection_chars {
                tracing::debug!("Skipping short subsection '{}' of {}", sub.title, item.source_name);
                skipped_count += 1;
                self.metrics.record_subsection_skipped();
                SkipMarker::new(SKIP_REASON_TOO_SHORT).text()
            } else {
                let text = truncate_chars(&sub.text, config.max_subsection_chars);
                let outcome = summarize
                    .execute_or_skip(
                        || {
                            self.metrics.record_ai_call();
                            c.ai.summarize(&sub.title, &text, config.book_type, &config.output_language)
                        },
                        self.retry_hook(id, &sub.title),
                    )
                    .await
                    .with_context(|| format!("Summarizing '{}' failed", sub.title))?;

                match self.take_text(outcome, &mut usage) {
                    CallText::Text(text) => {
                        processed_count += 1;
                        text
                    }
                    CallText::Skipped(marker) => {
                        skipped_count += 1;
                        marker
                    }
                }
            };

            summaries.push(SubsectionSummary {
                title: sub.title.clone(),
                summary,
            });

            if i + 1 < selected.len() && config.inter_call_delay_ms > 0 {
                tokio::time::sleep(config.inter_call_delay()).await;
            }
        }

        let aggregate = self.aggregate_executor();

        let mut connections = String::new();
        if config.processing_mode.needs_connections() {
            if self.checkpoint().await == Checkpoint::Stop {
                return Ok(None);
            }
            self.progress(id, PROGRESS_CONNECTIONS, "Analyzing connections");
            let outcome = aggregate
                .execute_or_skip(
                    || {
                        self.metrics.record_ai_call();
                        c.ai.analyze_connections(&summaries, &config.output_language)
                    },
                    self.retry_hook(id, "connections"),
                )
                .await
                .context("Connection analysis failed")?;
            connections = match self.take_text(outcome, &mut usage) {
                CallText::Text(text) | CallText::Skipped(text) => text,
            };
        }

        let mut overall = None;
        if config.processing_mode.needs_overall() {
            if self.checkpoint().await == Checkpoint::Stop {
                return Ok(None);
            }
            self.progress(id, PROGRESS_OVERALL, "Writing overall summary");
            let outcome = aggregate
                .execute_or_skip(
                    || {
                        self.metrics.record_ai_call();
                        c.ai.synthesize_overall(&title, &summaries, &connections, &config.output_language)
                    },
                    self.retry_hook(id, "overall summary"),
                )
                .await
                .context("Overall synthesis failed")?;
            overall = Some(match self.take_text(outcome, &mut usage) {
                CallText::Text(text) | CallText::Skipped(text) => text,
            });
        }

        let model = c.ai.model();
        let cost = c.cost.cost(&model, usage.input, usage.output);

        if self.checkpoint().await == Checkpoint::Stop {
            return Ok(None);
        }

        self.progress(id, PROGRESS_SAVE, "Saving artifact");
        let file_name = artifact_file_name(&item.source_name);
        let artifact_meta = ArtifactMetadata {
            source: item.source_location.clone(),
            file_name: item.source_name.clone(),
            processed_at: Utc::now(),
            model,
            processing_mode: config.processing_mode.as_str().to_string(),
            detection_mode: config.chapter_detection_mode.as_str().to_string(),
            selected_subsections: item.selected_subsections.clone(),
            subsection_count: summaries.len(),
            original_chars,
            processed_chars,
            input_tokens: usage.input,
            output_tokens: usage.output,
            cost,
            skipped_subsections: skipped_count,
        };

        let mut sections: Vec<RenderedSection> = Vec::new();
        if let Some(overall) = overall {
            sections.push(RenderedSection::new("Overview", overall));
        }
        if !connections.is_empty() {
            sections.push(RenderedSection::new("Connections", connections));
        }
        sections.extend(
            summaries
                .into_iter()
                .map(|s| RenderedSection::new(s.title, s.summary)),
        );

        let document = render_document(&title, &artifact_meta, &sections);
        c.store
            .upload(&file_name, &document)
            .await
            .with_context(|| format!("Failed to upload {}", file_name))?;

        self.metrics.record_tokens(usage.input, usage.output);

        Ok(Some(ItemMetadata {
            subsection_count: artifact_meta.subsection_count,
            processed_count,
            skipped_count,
            input_tokens: usage.input,
            output_tokens: usage.output,
            start_time: Some(start_time),
            end_time: Some(Utc::now()),
            cost_usd: cost.usd,
            cost_rmb: cost.rmb,
            output_path: Some(file_name),
        }))
    }

    fn take_text(&self, outcome: CallOutcome<AiResponse>, usage: &mut TokenUsage) -> CallText {
        match outcome {
            CallOutcome::Value(response) => {
                usage.add(&response);
                CallText::Text(response.text)
            }
            CallOutcome::Skipped(marker) => {
                self.metrics.record_subsection_skipped();
                CallText::Skipped(marker.text())
            }
        }
    }
}

/// Keep the subsections named by 1-based `selection`, in document order.
/// No selection, or an empty one, keeps everything.
pub(crate) fn select_subsections(
    subsections: Vec<Subsection>,
    selection: Option<&[usize]>,
) -> Result<Vec<Subsection>> {
    if subsections.is_empty() {
        anyhow::bail!("No subsections could be extracted");
    }

    let selection = match selection {
        Some(selection) if !selection.is_empty() => selection,
        _ => return Ok(subsections),
    };

    let total = subsections.len();
    let selected: Vec<Subsection> = subsections
        .into_iter()
        .enumerate()
        .filter(|(i, _)| selection.contains(&(i + 1)))
        .map(|(_, s)| s)
        .collect();

    if selected.is_empty() {
        anyhow::bail!(
            "None of the selected subsections {:?} exist (document has {})",
            selection,
            total
        );
    }
    Ok(selected)
}

/// Cut `text` to `max_chars` characters, appending "..." when shortened
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => format!("{}...", &text[..byte_index]),
        None => text.to_string(),
    }
}
