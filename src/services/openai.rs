use crate::models::{AiSettings, BookType};
use crate::services::collaborators::{AiClient, AiResponse, SubsectionSummary};
use crate::services::retry::AiError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

/// Chat-completions client for OpenAI-compatible endpoints
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl OpenAiClient {
    pub fn new(settings: &AiSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        if settings.api_key.is_empty() {
            tracing::warn!("No API key configured for provider '{}'", settings.provider);
        }

        Ok(Self {
            client,
            api_url: settings.api_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            temperature: settings.temperature,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_url)
    }

    fn build_request_body(&self, system: &str, prompt: &str) -> Value {
        json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": prompt },
            ],
        })
    }

    async fn complete(&self, system: &str, prompt: String) -> Result<AiResponse, AiError> {
        let body = self.build_request_body(system, &prompt);

        let response = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AiError::from_message(format!("Request failed: {e}")))?;

        let status = response.status().as_u16();
        let body_text = response
            .text()
            .await
            .map_err(|e| AiError::from_message(format!("Failed to read response: {e}")))?;

        if !(200..300).contains(&status) {
            return Err(AiError::from_http(status, &body_text));
        }

        parse_completion(&body_text)
    }
}

/// Pull the reply text and token usage out of a chat-completions response
pub fn parse_completion(body: &str) -> Result<AiResponse, AiError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| AiError::Other(format!("Failed to parse response: {e}")))?;

    // Some gateways answer 200 with an error object
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown provider error");
        return Err(AiError::from_message(message.to_string()));
    }

    let finish_reason = value
        .pointer("/choices/0/finish_reason")
        .and_then(Value::as_str);
    if finish_reason == Some("content_filter") {
        return Err(AiError::ContentFiltered(
            "response stopped by the provider's content filter".to_string(),
        ));
    }

    let text = value
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| AiError::Other("Response contained no message content".to_string()))?;

    let usage = |key: &str| {
        value
            .pointer(&format!("/usage/{key}"))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };

    Ok(AiResponse::new(
        text.trim(),
        usage("prompt_tokens"),
        usage("completion_tokens"),
    ))
}

fn summary_system_prompt(book_type: BookType, language: &str) -> String {
    let focus = match book_type {
        BookType::Fiction => "plot, characters, and themes",
        BookType::NonFiction => "arguments, evidence, and key takeaways",
    };
    format!(
        "You summarize book chapters. Focus on {focus}. Answer in Markdown, in the language with code '{language}'."
    )
}

fn joined_summaries(summaries: &[SubsectionSummary]) -> String {
    summaries
        .iter()
        .map(|s| format!("## {}\n{}", s.title, s.summary))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[async_trait]
impl AiClient for OpenAiClient {
    fn model(&self) -> String {
        self.model.clone()
    }

    async fn summarize(
        &self,
        title: &str,
        text: &str,
        book_type: BookType,
        language: &str,
    ) -> Result<AiResponse, AiError> {
        let system = summary_system_prompt(book_type, language);
        self.complete(&system, format!("Chapter: {title}\n\n{text}"))
            .await
    }

    async fn analyze_connections(
        &self,
        summaries: &[SubsectionSummary],
        language: &str,
    ) -> Result<AiResponse, AiError> {
        let system = format!(
            "You analyze how the chapters of a book relate to each other. Answer in Markdown, in the language with code '{language}'."
        );
        self.complete(&system, joined_summaries(summaries)).await
    }

    async fn synthesize_overall(
        &self,
        title: &str,
        summaries: &[SubsectionSummary],
        connections: &str,
        language: &str,
    ) -> Result<AiResponse, AiError> {
        let system = format!(
            "You write the overall summary of a book from its chapter summaries. Answer in Markdown, in the language with code '{language}'."
        );
        let mut prompt = format!("Book: {title}\n\n{}", joined_summaries(summaries));
        if !connections.is_empty() {
            prompt.push_str("\n\n# Connections\n");
            prompt.push_str(connections);
        }
        self.complete(&system, prompt).await
    }
}
