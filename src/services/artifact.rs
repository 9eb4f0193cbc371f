use crate::models::{BatchSummary, ItemStatus};
use crate::services::collaborators::Cost;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::fmt::Write as _;
use std::sync::LazyLock;

/// Suffix of every rendered artifact; the processed lookup relies on it
pub const ARTIFACT_SUFFIX: &str = "-summary.md";

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Source name without its extension
pub fn book_title(source_name: &str) -> &str {
    match source_name.rfind('.') {
        Some(pos) if pos > 0 => &source_name[..pos],
        _ => source_name,
    }
}

/// File-system safe stem: extension dropped, `<>:"/\|?*` removed, whitespace collapsed
pub fn sanitize_stem(source_name: &str) -> String {
    let stripped: String = book_title(source_name)
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .collect();
    WHITESPACE.replace_all(stripped.trim(), " ").into_owned()
}

pub fn artifact_file_name(source_name: &str) -> String {
    format!("{}{}", sanitize_stem(source_name), ARTIFACT_SUFFIX)
}

/// Values written into the artifact header
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactMetadata {
    pub source: String,
    pub file_name: String,
    pub processed_at: DateTime<Utc>,
    pub model: String,
    pub processing_mode: String,
    pub detection_mode: String,
    pub selected_subsections: Option<Vec<usize>>,
    pub subsection_count: usize,
    pub original_chars: usize,
    pub processed_chars: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: Cost,
    pub skipped_subsections: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedSection {
    pub heading: String,
    pub body: String,
}

impl RenderedSection {
    pub fn new(heading: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            heading: heading.into(),
            body: body.into(),
        }
    }
}

fn render_header(meta: &ArtifactMetadata) -> String {
    let selected = match &meta.selected_subsections {
        Some(indices) => indices
            .iter()
            .map(usize::to_string)
            .collect::<Vec<_>>()
            .join(","),
        None => "all".to_string(),
    };

    let mut header = String::from("<!--\n");
    let mut line = |key: &str, value: &dyn std::fmt::Display| {
        let _ = writeln!(header, "{key}: {value}");
    };
    line("source", &meta.source);
    line("fileName", &meta.file_name);
    line("processedAt", &meta.processed_at.to_rfc3339());
    line("model", &meta.model);
    line("processingMode", &meta.processing_mode);
    line("chapterDetectionMode", &meta.detection_mode);
    line("selectedChapters", &selected);
    line("chapterCount", &meta.subsection_count);
    line("originalCharCount", &meta.original_chars);
    line("processedCharCount", &meta.processed_chars);
    line("inputTokens", &meta.input_tokens);
    line("outputTokens", &meta.output_tokens);
    line("costUSD", &format!("{:.5}", meta.cost.usd));
    line("costRMB", &format!("{:.5}", meta.cost.rmb));
    line("skippedChapters", &meta.skipped_subsections);
    header.push_str("-->\n");
    header
}

/// Markdown artifact: metadata comment, title, then sections split by rules
pub fn render_document(title: &str, meta: &ArtifactMetadata, sections: &[RenderedSection]) -> String {
    let mut doc = render_header(meta);
    let _ = writeln!(doc, "\n# {title}\n");

    for (i, section) in sections.iter().enumerate() {
        if i > 0 {
            doc.push_str("\n---\n\n");
        }
        let _ = writeln!(doc, "## {}\n", section.heading);
        doc.push_str(section.body.trim_end());
        doc.push('\n');
    }
    doc
}

/// Markdown report of a whole run
pub fn render_batch_report(summary: &BatchSummary) -> String {
    let mut report = String::from("# Batch Report\n\n");
    let _ = writeln!(report, "- Started: {}", summary.started_at.to_rfc3339());
    let _ = writeln!(report, "- Duration: {:.1}s", summary.duration.as_secs_f64());
    let _ = writeln!(report, "- Total: {}", summary.total_items);
    let _ = writeln!(report, "- Succeeded: {}", summary.success_count);
    let _ = writeln!(report, "- Failed: {}", summary.failed_count);
    let _ = writeln!(report, "- Skipped: {}", summary.skipped_count);
    if summary.pending_count > 0 {
        let _ = writeln!(report, "- Pending: {}", summary.pending_count);
    }
    let _ = writeln!(
        report,
        "- Cost: ${:.5} / ¥{:.5}",
        summary.total_cost_usd, summary.total_cost_rmb
    );
    if summary.stopped {
        report.push_str("- Stopped before completion\n");
    }

    report.push_str("\n| Source | Status | Detail | Cost (USD) |\n|---|---|---|---|\n");
    for result in &summary.results {
        let detail = match result.status {
            ItemStatus::Completed => result.output_path.clone().unwrap_or_default(),
            ItemStatus::Failed => result.error.clone().unwrap_or_default(),
            ItemStatus::Skipped => result.skip_reason.clone().unwrap_or_default(),
            ItemStatus::Pending | ItemStatus::Processing => String::new(),
        };
        let _ = writeln!(
            report,
            "| {} | {} | {} | {:.5} |",
            result.source_name,
            result.status,
            detail.replace('|', "\\|"),
            result.cost_usd
        );
    }
    report
}
