// Batch metrics module
//
// Lock-free counters shared by every item pipeline of a run

use crate::services::retry::ErrorClass;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Counters collected while a batch runs.
///
/// Updated with relaxed atomics from concurrent pipelines and logged once
/// the run is over.
#[derive(Debug)]
pub struct BatchMetrics {
    pub items_completed: AtomicUsize,
    pub items_failed: AtomicUsize,
    pub items_skipped: AtomicUsize,

    /// Total time spent inside completed item pipelines, in milliseconds
    pub processing_time_ms: AtomicU64,

    /// Provider calls issued, retries included
    pub ai_calls: AtomicU64,

    pub rate_limit_retries: AtomicU64,
    pub content_filter_retries: AtomicU64,

    /// Subsections replaced by a skip marker
    pub subsections_skipped: AtomicU64,

    pub input_tokens: AtomicU64,
    pub output_tokens: AtomicU64,

    start_time: Instant,
}

impl BatchMetrics {
    pub fn new() -> Self {
        Self {
            items_completed: AtomicUsize::new(0),
            items_failed: AtomicUsize::new(0),
            items_skipped: AtomicUsize::new(0),
            processing_time_ms: AtomicU64::new(0),
            ai_calls: AtomicU64::new(0),
            rate_limit_retries: AtomicU64::new(0),
            content_filter_retries: AtomicU64::new(0),
            subsections_skipped: AtomicU64::new(0),
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_item_completed(&self, elapsed: Duration) {
        self.items_completed.fetch_add(1, Ordering::Relaxed);
        self.processing_time_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_item_failed(&self) {
        self.items_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_item_skipped(&self) {
        self.items_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ai_call(&self) {
        self.ai_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self, class: ErrorClass) {
        match class {
            ErrorClass::RateLimited => self.rate_limit_retries.fetch_add(1, Ordering::Relaxed),
            ErrorClass::ContentFiltered => {
                self.content_filter_retries.fetch_add(1, Ordering::Relaxed)
            }
            ErrorClass::Other => 0,
        };
    }

    pub fn record_subsection_skipped(&self) {
        self.subsections_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tokens(&self, input: u64, output: u64) {
        self.input_tokens.fetch_add(input, Ordering::Relaxed);
        self.output_tokens.fetch_add(output, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average pipeline time per completed item in milliseconds
    pub fn avg_processing_time_ms(&self) -> f64 {
        let total = self.processing_time_ms.load(Ordering::Relaxed);
        let count = self.items_completed.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    pub fn log_summary(&self) {
        tracing::info!("=== Batch Metrics Summary ===");
        tracing::info!("Uptime: {:.2}s", self.uptime().as_secs_f64());
        tracing::info!(
            "Items: {} completed, {} failed, {} skipped (avg {:.0}ms per completed item)",
            self.items_completed.load(Ordering::Relaxed),
            self.items_failed.load(Ordering::Relaxed),
            self.items_skipped.load(Ordering::Relaxed),
            self.avg_processing_time_ms()
        );
        tracing::info!(
            "AI calls: {}, rate-limit retries: {}, content-filter retries: {}, skipped subsections: {}",
            self.ai_calls.load(Ordering::Relaxed),
            self.rate_limit_retries.load(Ordering::Relaxed),
            self.content_filter_retries.load(Ordering::Relaxed),
            self.subsections_skipped.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Tokens: {} in, {} out",
            self.input_tokens.load(Ordering::Relaxed),
            self.output_tokens.load(Ordering::Relaxed)
        );
    }
}

impl Default for BatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}
