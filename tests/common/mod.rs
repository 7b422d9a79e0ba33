#![allow(dead_code)]

use async_trait::async_trait;
use card_show_scraper::config::Config;
use card_show_scraper::domain::ScrapingSource;
use card_show_scraper::pipeline::extractor::{ExtractionClient, ExtractionError};
use card_show_scraper::pipeline::fetcher::{FetchError, PageFetcher};
use card_show_scraper::pipeline::CancelFlag;
use card_show_scraper::storage::Storage;
use chrono::NaiveDate;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Serves canned HTML per url.
#[derive(Default)]
pub struct MockFetcher {
    pages: HashMap<String, Result<String, FetchError>>,
    panics: HashSet<String>,
    cancel_on_fetch: Mutex<Option<CancelFlag>>,
    pub calls: AtomicUsize,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: &str, html: &str) -> Self {
        self.pages.insert(url.to_string(), Ok(html.to_string()));
        self
    }

    pub fn failing(mut self, url: &str, err: FetchError) -> Self {
        self.pages.insert(url.to_string(), Err(err));
        self
    }

    /// Panic inside the worker that fetches this url.
    pub fn panicking(mut self, url: &str) -> Self {
        self.panics.insert(url.to_string());
        self
    }

    /// Cancel the run as soon as any source is fetched.
    pub fn cancel_on_fetch(&self, flag: CancelFlag) {
        *self.cancel_on_fetch.lock().unwrap() = Some(flag);
    }
}

#[async_trait]
impl PageFetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panics.contains(url) {
            panic!("fetcher crashed on {}", url);
        }
        if let Some(flag) = self.cancel_on_fetch.lock().unwrap().as_ref() {
            flag.cancel();
        }
        self.pages
            .get(url)
            .cloned()
            .unwrap_or(Err(FetchError::HttpStatus(404)))
    }
}

/// Answers extraction prompts by looking for marker text in the chunk.
/// Every marker present contributes its items; failure markers win.
#[derive(Default)]
pub struct MockExtractionClient {
    responses: Vec<(String, Vec<Value>)>,
    failures: Vec<(String, ExtractionError)>,
    raw: Vec<(String, String)>,
    pub calls: AtomicUsize,
}

impl MockExtractionClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, marker: &str, item: Value) -> Self {
        match self.responses.iter_mut().find(|(m, _)| m == marker) {
            Some((_, items)) => items.push(item),
            None => self.responses.push((marker.to_string(), vec![item])),
        }
        self
    }

    pub fn fail_on(mut self, marker: &str, err: ExtractionError) -> Self {
        self.failures.push((marker.to_string(), err));
        self
    }

    /// Reply with this exact text, e.g. prose-wrapped JSON
    pub fn raw_on(mut self, marker: &str, text: &str) -> Self {
        self.raw.push((marker.to_string(), text.to_string()));
        self
    }
}

#[async_trait]
impl ExtractionClient for MockExtractionClient {
    async fn complete(&self, prompt: &str) -> Result<String, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Only look at the fragment, not the instructions
        let fragment = prompt.split("HTML fragment:").nth(1).unwrap_or("");

        if let Some((_, err)) = self.failures.iter().find(|(m, _)| fragment.contains(m.as_str())) {
            return Err(err.clone());
        }
        if let Some((_, text)) = self.raw.iter().find(|(m, _)| fragment.contains(m.as_str())) {
            return Ok(text.clone());
        }
        let items: Vec<Value> = self
            .responses
            .iter()
            .filter(|(m, _)| fragment.contains(m.as_str()))
            .flat_map(|(_, items)| items.iter().cloned())
            .collect();
        Ok(Value::Array(items).to_string())
    }
}

pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
}

/// Small chunks and no retries so scenarios stay fast and predictable.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.chunking.max_chunk_bytes = 200;
    config.chunking.max_chunks = 10;
    config.extraction.max_retries = 0;
    config.extraction.timeout_ms = 2_000;
    config.pipeline.worker_pool_size = 2;
    config.pipeline.source_budget_secs = 30;
    config
}

pub async fn register(storage: &dyn Storage, urls: &[&str]) {
    for url in urls {
        storage.upsert_source(&ScrapingSource::new(*url)).await.unwrap();
    }
}
