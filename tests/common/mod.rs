//! Hand-written collaborators shared by the integration tests

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use fastreader::models::{BatchSummary, BookType, ItemId, QueueItem};
use fastreader::services::{
    AiClient, AiError, AiResponse, ArtifactStore, BatchCallbacks, Cost, CostModel,
    DocumentSource, ExtractionHints, ProcessedLookup, Subsection, SubsectionSummary,
    artifact_file_name,
};
use fastreader::{Collaborators, RunControl};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// Long enough to pass the short-subsection filter
pub fn chapter_text(n: usize) -> String {
    format!("Chapter {n} body. ").repeat(20)
}

/// Documents keyed by source name; unknown names fail to fetch
#[derive(Default)]
pub struct FakeLibrary {
    docs: HashMap<String, Vec<Subsection>>,
}

impl FakeLibrary {
    pub fn with_doc(mut self, name: &str, chapters: usize) -> Self {
        let subsections = (1..=chapters)
            .map(|i| Subsection::new(i.to_string(), format!("Chapter {i}"), chapter_text(i)))
            .collect();
        self.docs.insert(name.to_string(), subsections);
        self
    }
}

#[async_trait]
impl DocumentSource for FakeLibrary {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>> {
        let name = location.rsplit('/').next().unwrap_or(location);
        if !self.docs.contains_key(name) {
            anyhow::bail!("no such document: {name}");
        }
        Ok(name.as_bytes().to_vec())
    }

    async fn extract_subsections(
        &self,
        _bytes: &[u8],
        hints: &ExtractionHints,
    ) -> Result<Vec<Subsection>> {
        Ok(self.docs.get(&hints.source_name).cloned().unwrap_or_default())
    }
}

/// Summarizer that tracks how many calls overlap and can replay scripted errors
#[derive(Default)]
pub struct FakeAi {
    pub delay: Duration,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub peak: AtomicUsize,
    script: Mutex<VecDeque<AiError>>,
    pause_on_first_call: OnceLock<RunControl>,
    stop_on_call: OnceLock<(usize, RunControl)>,
}

impl FakeAi {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Errors returned, in order, before calls start succeeding
    pub fn with_errors(errors: Vec<AiError>) -> Self {
        Self {
            script: Mutex::new(errors.into()),
            ..Self::default()
        }
    }

    pub fn pause_on_first_call(&self, control: RunControl) {
        let _ = self.pause_on_first_call.set(control);
    }

    /// Request a stop while answering the 1-based `call`
    pub fn stop_on_call(&self, call: usize, control: RunControl) {
        let _ = self.stop_on_call.set((call, control));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn respond(&self, text: &str) -> Result<AiResponse, AiError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if call == 0 {
            if let Some(control) = self.pause_on_first_call.get() {
                control.pause();
            }
        }
        if let Some((at, control)) = self.stop_on_call.get() {
            if call + 1 == *at {
                control.stop();
            }
        }

        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(error) => Err(error),
            None => Ok(AiResponse::new(text, 100, 20)),
        }
    }
}

#[async_trait]
impl AiClient for FakeAi {
    fn model(&self) -> String {
        "fake-model".to_string()
    }

    async fn summarize(
        &self,
        title: &str,
        _text: &str,
        _book_type: BookType,
        _language: &str,
    ) -> Result<AiResponse, AiError> {
        self.respond(&format!("Summary of {title}")).await
    }

    async fn analyze_connections(
        &self,
        summaries: &[SubsectionSummary],
        _language: &str,
    ) -> Result<AiResponse, AiError> {
        self.respond(&format!("{} chapters connected", summaries.len()))
            .await
    }

    async fn synthesize_overall(
        &self,
        title: &str,
        _summaries: &[SubsectionSummary],
        _connections: &str,
        _language: &str,
    ) -> Result<AiResponse, AiError> {
        self.respond(&format!("Overall view of {title}")).await
    }
}

/// In-memory artifact store that doubles as the processed lookup
#[derive(Default)]
pub struct MemoryStore {
    pub files: Mutex<HashMap<String, String>>,
    stop_on_upload: OnceLock<RunControl>,
}

impl MemoryStore {
    pub fn stop_on_upload(&self, control: RunControl) {
        let _ = self.stop_on_upload.set(control);
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.files.lock().unwrap().len()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn upload(&self, path: &str, content: &str) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
        if let Some(control) = self.stop_on_upload.get() {
            control.stop();
        }
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        self.file(path)
            .map(String::into_bytes)
            .ok_or_else(|| anyhow::anyhow!("missing artifact {path}"))
    }
}

#[async_trait]
impl ProcessedLookup for MemoryStore {
    async fn bulk_check(&self, names: &[String]) -> Result<HashSet<String>> {
        let files = self.files.lock().unwrap();
        Ok(names
            .iter()
            .filter(|name| files.contains_key(&artifact_file_name(name)))
            .cloned()
            .collect())
    }
}

pub struct FlatCost;

impl CostModel for FlatCost {
    fn cost(&self, _model: &str, input_tokens: u64, output_tokens: u64) -> Cost {
        let usd = (input_tokens + output_tokens) as f64 / 1000.0;
        Cost { usd, rmb: usd * 7.0 }
    }
}

/// Records every callback as a short string
#[derive(Default)]
pub struct RecordingCallbacks {
    pub events: Mutex<Vec<String>>,
}

impl RecordingCallbacks {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl BatchCallbacks for RecordingCallbacks {
    fn on_item_start(&self, item: &QueueItem) {
        self.push(format!("start:{}", item.source_name));
    }

    fn on_item_progress(&self, _id: ItemId, _percent: u8, message: &str) {
        self.push(format!("progress:{message}"));
    }

    fn on_item_complete(&self, item: &QueueItem) {
        self.push(format!("complete:{}", item.source_name));
    }

    fn on_item_error(&self, item: &QueueItem, _message: &str) {
        self.push(format!("error:{}", item.source_name));
    }

    fn on_item_skip(&self, item: &QueueItem, reason: &str) {
        self.push(format!("skip:{}:{reason}", item.source_name));
    }

    fn on_queue_complete(&self, summary: &BatchSummary) {
        self.push(format!("queue_complete:{}", summary.total_items));
    }
}

pub fn collaborators(
    library: Arc<FakeLibrary>,
    ai: Arc<FakeAi>,
    store: Arc<MemoryStore>,
    callbacks: Arc<RecordingCallbacks>,
) -> Collaborators {
    Collaborators {
        source: library,
        ai,
        lookup: store.clone(),
        store,
        cost: Arc::new(FlatCost),
        callbacks,
    }
}
