//! AI-assisted extraction of show candidates from one HTML chunk.
//!
//! The endpoint is treated as a fallible black box returning text that should
//! contain a JSON array. Output is repaired (code fences, surrounding prose)
//! before parsing; a chunk that still fails contributes nothing and the run
//! carries on with the next chunk.

use crate::config::ExtractionConfig;
use crate::domain::{CandidateFields, RawCandidate};
use crate::error::Result;
use crate::pipeline::chunker::Chunk;
use crate::pipeline::rate_limiter::RateLimiter;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExtractionError {
    #[error("extraction call timed out")]
    Timeout,
    #[error("extraction transport error: {0}")]
    Transport(String),
    #[error("extraction endpoint returned HTTP {0}")]
    HttpStatus(u16),
    #[error("malformed extraction response: {0}")]
    Malformed(String),
}

impl ExtractionError {
    /// Transport-level failures may succeed on another attempt; a bad answer won't.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExtractionError::Timeout | ExtractionError::Transport(_) => true,
            ExtractionError::HttpStatus(code) => *code == 429 || *code >= 500,
            ExtractionError::Malformed(_) => false,
        }
    }
}

impl From<reqwest::Error> for ExtractionError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ExtractionError::Timeout
        } else if let Some(status) = e.status() {
            ExtractionError::HttpStatus(status.as_u16())
        } else {
            ExtractionError::Transport(e.to_string())
        }
    }
}

/// The hosted text-extraction endpoint: prompt in, text out.
#[async_trait]
pub trait ExtractionClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> std::result::Result<String, ExtractionError>;
}

const SYSTEM_PROMPT: &str =
    "You extract trading card show listings from web page fragments and answer with JSON only.";

/// OpenAI-compatible chat completions client.
pub struct ChatCompletionsClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    limiter: RateLimiter,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

impl ChatCompletionsClient {
    pub fn new(api_key: impl Into<String>, config: &ExtractionConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            limiter: RateLimiter::new(config.requests_per_min),
        })
    }
}

#[async_trait]
impl ExtractionClient for ChatCompletionsClient {
    async fn complete(&self, prompt: &str) -> std::result::Result<String, ExtractionError> {
        self.limiter.acquire().await;
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.0,
        };

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ExtractionError::HttpStatus(status.as_u16()));
        }
        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| ExtractionError::Malformed(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ExtractionError::Malformed("response had no content".to_string()))
    }
}

/// Instruction prompt for one chunk.
pub fn build_prompt(chunk_text: &str, today: NaiveDate, source_url: &str) -> String {
    format!(
        r#"Today's date is {today}. The HTML fragment below comes from {source_url}.

Extract every upcoming trading card show (sports cards, Pokemon, TCG, memorabilia shows) listed in it.

Rules:
- Only extract rows that describe card show events. Ignore reviews, comments, ads and navigation.
- Skip any event whose date is before {today}.
- If an event's date is missing or ambiguous, skip it. Do not guess dates.
- Use null for any field you cannot find. Do not invent values.

Answer with a JSON array only, no prose and no code fences. Each element:
{{"name": string, "startDate": "YYYY-MM-DD", "endDate": "YYYY-MM-DD" or null,
  "venueName": string or null, "address": string or null, "city": string or null,
  "state": string or null, "entryFee": string or null, "description": string or null,
  "url": string or null, "contactInfo": string or null}}

If there are no qualifying events, answer [].

HTML fragment:
{chunk_text}"#
    )
}

/// Parse an extraction response into candidate field sets, repairing common
/// wrapping artifacts first.
pub fn parse_candidates(response: &str) -> std::result::Result<Vec<CandidateFields>, ExtractionError> {
    let trimmed = response.trim();
    let attempts = [
        Some(trimmed.to_string()),
        strip_code_fence(trimmed),
        bracket_span(trimmed),
    ];

    let mut last_err = String::from("empty response");
    for attempt in attempts.into_iter().flatten() {
        match serde_json::from_str::<serde_json::Value>(&attempt) {
            Ok(value) => match candidate_array(value) {
                Some(items) => return Ok(items_to_fields(items)),
                None => last_err = "JSON was not an array of candidates".to_string(),
            },
            Err(e) => last_err = e.to_string(),
        }
    }
    Err(ExtractionError::Malformed(last_err))
}

fn strip_code_fence(text: &str) -> Option<String> {
    let start = text.find("```")?;
    let after_fence = start + 3;
    // Skip a language tag such as "json"
    let content_start = text[after_fence..]
        .find('\n')
        .map(|i| after_fence + i + 1)
        .unwrap_or(after_fence);
    let end = text[content_start..].find("```")?;
    Some(text[content_start..content_start + end].trim().to_string())
}

/// Substring from the first `[` to the last `]`.
fn bracket_span(text: &str) -> Option<String> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (end > start).then(|| text[start..=end].to_string())
}

fn candidate_array(value: serde_json::Value) -> Option<Vec<serde_json::Value>> {
    match value {
        serde_json::Value::Array(items) => Some(items),
        serde_json::Value::Object(mut map) => ["shows", "events", "candidates"]
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(serde_json::Value::Array(items)) => Some(items),
                _ => None,
            }),
        _ => None,
    }
}

fn items_to_fields(items: Vec<serde_json::Value>) -> Vec<CandidateFields> {
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<CandidateFields>(item) {
            Ok(fields) => Some(fields),
            Err(e) => {
                debug!("Skipping unreadable candidate element: {}", e);
                None
            }
        })
        .collect()
}

/// What one chunk produced. `error` is set when the chunk contributed nothing
/// because extraction failed.
#[derive(Debug, Clone)]
pub struct ChunkExtraction {
    pub chunk_index: usize,
    pub candidates: Vec<RawCandidate>,
    pub attempts: u32,
    pub error: Option<ExtractionError>,
}

pub struct Extractor {
    client: Arc<dyn ExtractionClient>,
    timeout: Duration,
    max_retries: u32,
}

impl Extractor {
    pub fn new(client: Arc<dyn ExtractionClient>, config: &ExtractionConfig) -> Self {
        Self {
            client,
            timeout: config.timeout(),
            max_retries: config.max_retries,
        }
    }

    /// Extract candidates from one chunk. Never fails upward.
    pub async fn extract_chunk(&self, chunk: &Chunk, today: NaiveDate, source_url: &str) -> ChunkExtraction {
        let prompt = build_prompt(&chunk.text, today, source_url);
        let mut attempts = 0;

        let outcome = loop {
            attempts += 1;
            let call = tokio::time::timeout(self.timeout, self.client.complete(&prompt)).await;
            let result = match call {
                Ok(inner) => inner,
                Err(_) => Err(ExtractionError::Timeout),
            };
            match result {
                Err(e) if e.is_retryable() && attempts <= self.max_retries => {
                    warn!(
                        chunk = chunk.index,
                        attempt = attempts,
                        "Extraction attempt failed, retrying: {}",
                        e
                    );
                }
                Err(e) => break Err(e),
                Ok(text) => break parse_candidates(&text),
            }
        };

        match outcome {
            Ok(fields) => {
                let extracted_at = Utc::now();
                let candidates = fields
                    .into_iter()
                    .map(|fields| RawCandidate {
                        source_url: source_url.to_string(),
                        chunk_index: chunk.index,
                        fields,
                        extracted_at,
                    })
                    .collect::<Vec<_>>();
                debug!(chunk = chunk.index, "Extracted {} candidates", candidates.len());
                ChunkExtraction {
                    chunk_index: chunk.index,
                    candidates,
                    attempts,
                    error: None,
                }
            }
            Err(e) => {
                warn!(chunk = chunk.index, source = %source_url, "Chunk extraction failed: {}", e);
                ChunkExtraction {
                    chunk_index: chunk.index,
                    candidates: Vec::new(),
                    attempts,
                    error: Some(e),
                }
            }
        }
    }
}
