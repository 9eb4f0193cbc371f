use crate::models::{ChapterDetectionMode, NewQueueItem};
use crate::services::artifact::{ARTIFACT_SUFFIX, artifact_file_name};
use crate::services::collaborators::{
    ArtifactStore, DocumentSource, ExtractionHints, ProcessedLookup, Subsection,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use std::collections::HashSet;
use std::fs;

/// File extensions the local library picks up
pub const SUPPORTED_EXTENSIONS: &[&str] = &["txt", "md", "markdown"];

/// Title used when a document has no recognizable headings
pub const FULL_TEXT_TITLE: &str = "Full Text";

/// A directory of plain-text documents
///
/// Subsections are split on Markdown headings (`#` to `###`). Smart
/// detection also recognizes "Chapter N" / "Part N" style lines and
/// CJK chapter headings.
#[derive(Debug, Clone)]
pub struct LocalLibrary {
    root: Utf8PathBuf,
    markdown_heading: Regex,
    chapter_heading: Regex,
}

impl LocalLibrary {
    pub fn new<P: AsRef<Utf8Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            anyhow::bail!("Source directory does not exist: {}", root);
        }

        Ok(Self {
            root,
            markdown_heading: Regex::new(r"^#{1,3}\s+(\S.*)$").context("Invalid heading regex")?,
            chapter_heading: Regex::new(
                r"(?i)^((?:chapter|part)\s+[0-9ivxlc]+\b.*|第[0-9一二三四五六七八九十百零]+[章节回].*)$",
            )
            .context("Invalid chapter regex")?,
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// List supported documents as queue items, sorted by file name
    pub fn discover(&self) -> Result<Vec<NewQueueItem>> {
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read source directory: {}", self.root))?;

        let mut items = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("Failed to read entry in {}", self.root))?;
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                tracing::warn!("Skipping non UTF-8 path: {:?}", entry.path());
                continue;
            };
            if !path.is_file() {
                continue;
            }
            let supported = path
                .extension()
                .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_lowercase().as_str()));
            if !supported {
                continue;
            }
            if let Some(name) = path.file_name() {
                items.push(NewQueueItem::new(name, path.as_str()));
            }
        }

        items.sort_by(|a, b| a.source_name.cmp(&b.source_name));
        tracing::info!("Discovered {} documents in {}", items.len(), self.root);
        Ok(items)
    }

    fn is_heading<'a>(&self, line: &'a str, mode: ChapterDetectionMode) -> Option<&'a str> {
        let line = line.trim();
        if let Some(caps) = self.markdown_heading.captures(line) {
            return caps.get(1).map(|m| m.as_str().trim());
        }
        match mode {
            ChapterDetectionMode::Normal => None,
            ChapterDetectionMode::Smart | ChapterDetectionMode::EpubToc => {
                self.chapter_heading.is_match(line).then_some(line)
            }
        }
    }

    /// Split text into titled subsections
    pub fn split(&self, text: &str, mode: ChapterDetectionMode) -> Vec<Subsection> {
        let mut sections: Vec<(String, String)> = Vec::new();
        let mut preface = String::new();

        for line in text.lines() {
            if let Some(title) = self.is_heading(line, mode) {
                sections.push((title.to_string(), String::new()));
                continue;
            }
            let body = match sections.last_mut() {
                Some((_, body)) => body,
                None => &mut preface,
            };
            body.push_str(line);
            body.push('\n');
        }

        if sections.is_empty() {
            if text.trim().is_empty() {
                return Vec::new();
            }
            return vec![Subsection::new("1", FULL_TEXT_TITLE, text.trim())];
        }

        let mut result = Vec::with_capacity(sections.len() + 1);
        if !preface.trim().is_empty() {
            sections.insert(0, ("Preface".to_string(), preface));
        }
        for (i, (title, body)) in sections.into_iter().enumerate() {
            result.push(Subsection::new((i + 1).to_string(), title, body.trim()));
        }
        result
    }
}

#[async_trait]
impl DocumentSource for LocalLibrary {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>> {
        tokio::fs::read(location)
            .await
            .with_context(|| format!("Failed to read document: {}", location))
    }

    async fn extract_subsections(
        &self,
        bytes: &[u8],
        hints: &ExtractionHints,
    ) -> Result<Vec<Subsection>> {
        if hints.detection_mode == ChapterDetectionMode::EpubToc {
            tracing::debug!(
                "{} has no table of contents, using heading detection",
                hints.source_name
            );
        }
        let text = String::from_utf8_lossy(bytes);
        Ok(self.split(&text, hints.detection_mode))
    }
}

/// Artifact directory on the local file system
#[derive(Debug, Clone)]
pub struct LocalStore {
    output_dir: Utf8PathBuf,
}

impl LocalStore {
    pub fn new<P: AsRef<Utf8Path>>(output_dir: P) -> Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        if !output_dir.exists() {
            fs::create_dir_all(&output_dir)
                .with_context(|| format!("Failed to create output directory: {}", output_dir))?;
        }
        Ok(Self { output_dir })
    }

    pub fn output_dir(&self) -> &Utf8Path {
        &self.output_dir
    }

    fn resolve(&self, path: &str) -> Result<Utf8PathBuf> {
        let relative = Utf8Path::new(path);
        if relative.is_absolute() || relative.components().any(|c| c.as_str() == "..") {
            anyhow::bail!("Artifact path escapes the output directory: {}", path);
        }
        Ok(self.output_dir.join(relative))
    }
}

#[async_trait]
impl ArtifactStore for LocalStore {
    async fn upload(&self, path: &str, content: &str) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent))?;
        }

        // Write then rename so readers never see a half-written artifact
        let partial = target.with_extension("md.partial");
        tokio::fs::write(&partial, content)
            .await
            .with_context(|| format!("Failed to write artifact: {}", partial))?;
        tokio::fs::rename(&partial, &target)
            .await
            .with_context(|| format!("Failed to move artifact into place: {}", target))?;

        tracing::debug!("Saved artifact {}", target);
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let target = self.resolve(path)?;
        tokio::fs::read(&target)
            .await
            .with_context(|| format!("Failed to read artifact: {}", target))
    }
}

#[async_trait]
impl ProcessedLookup for LocalStore {
    async fn bulk_check(&self, names: &[String]) -> Result<HashSet<String>> {
        let mut existing = HashSet::new();
        let mut entries = tokio::fs::read_dir(&self.output_dir)
            .await
            .with_context(|| format!("Failed to list output directory: {}", self.output_dir))?;

        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            match file_name.to_str() {
                Some(name) if name.ends_with(ARTIFACT_SUFFIX) => {
                    existing.insert(name.to_string());
                }
                _ => {}
            }
        }

        Ok(names
            .iter()
            .filter(|name| existing.contains(&artifact_file_name(name)))
            .cloned()
            .collect())
    }
}
