use crate::error::{Result, ScraperError};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "card_shows.toml";

/// Runtime configuration, built once at startup and handed to each component.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_path: String,
    pub extraction: ExtractionConfig,
    pub fetch: FetchConfig,
    pub chunking: ChunkingConfig,
    pub pipeline: PipelineConfig,
    pub dedup: DedupConfig,
    pub feedback: FeedbackConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_ms: u64,
    pub requests_per_min: u64,
    /// Extra attempts per chunk on transport failures. Parse failures are never retried.
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_ms: u64,
    pub max_html_bytes: usize,
    pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_chunk_bytes: usize,
    pub max_chunks: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub worker_pool_size: usize,
    pub source_budget_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub window_days: i64,
    pub max_edit_distance: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub error_streak_threshold: u32,
    pub window_days: i64,
    pub low_confidence_threshold: u8,
}

/// Where a finished run sends its metrics snapshot. Without a Pushgateway
/// url the snapshot is only logged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub pushgateway_url: Option<String>,
    pub instance: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "data/card_shows.db".to_string(),
            extraction: ExtractionConfig::default(),
            fetch: FetchConfig::default(),
            chunking: ChunkingConfig::default(),
            pipeline: PipelineConfig::default(),
            dedup: DedupConfig::default(),
            feedback: FeedbackConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_ms: 15_000,
            requests_per_min: 60,
            max_retries: 1,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 15_000,
            max_html_bytes: 75_000,
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/114.0.0.0 Safari/537.36".to_string(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: 15_000,
            max_chunks: 5,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            source_budget_secs: 120,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_days: 3,
            max_edit_distance: 2,
        }
    }
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            error_streak_threshold: 5,
            window_days: 30,
            low_confidence_threshold: 70,
        }
    }
}

impl ExtractionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl PipelineConfig {
    pub fn source_budget(&self) -> Duration {
        Duration::from_secs(self.source_budget_secs)
    }
}

impl Config {
    /// Defaults, then the TOML file (if it exists), then environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let mut config = if path.exists() {
            let content = fs::read_to_string(path).map_err(|e| {
                ScraperError::Config(format!(
                    "Failed to read config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay values from an environment lookup. Taking the lookup as a closure
    /// keeps tests away from process-wide env state.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("EXTRACTION_API_KEY").filter(|v| !v.trim().is_empty()) {
            self.extraction.api_key = Some(v);
        }
        if let Some(v) = lookup("EXTRACTION_API_URL") {
            self.extraction.base_url = v;
        }
        if let Some(v) = lookup("EXTRACTION_MODEL") {
            self.extraction.model = v;
        }
        if let Some(v) = lookup("DATABASE_PATH") {
            self.database_path = v;
        }
        if let Some(v) = lookup("METRICS_PUSHGATEWAY_URL").filter(|v| !v.trim().is_empty()) {
            self.metrics.pushgateway_url = Some(v);
        }
        if let Some(v) = lookup("METRICS_INSTANCE").filter(|v| !v.trim().is_empty()) {
            self.metrics.instance = Some(v);
        }
        set_parsed(&lookup, "AI_TIMEOUT_MS", &mut self.extraction.timeout_ms)?;
        set_parsed(&lookup, "AI_REQUESTS_PER_MIN", &mut self.extraction.requests_per_min)?;
        set_parsed(&lookup, "EXTRACTION_RETRIES", &mut self.extraction.max_retries)?;
        set_parsed(&lookup, "FETCH_TIMEOUT_MS", &mut self.fetch.timeout_ms)?;
        set_parsed(&lookup, "MAX_HTML_SIZE", &mut self.fetch.max_html_bytes)?;
        set_parsed(&lookup, "MAX_CHUNK_BYTES", &mut self.chunking.max_chunk_bytes)?;
        set_parsed(&lookup, "MAX_CHUNKS", &mut self.chunking.max_chunks)?;
        set_parsed(&lookup, "WORKER_POOL_SIZE", &mut self.pipeline.worker_pool_size)?;
        set_parsed(&lookup, "SOURCE_BUDGET_SECS", &mut self.pipeline.source_budget_secs)?;
        set_parsed(&lookup, "ERROR_STREAK_THRESHOLD", &mut self.feedback.error_streak_threshold)?;
        set_parsed(&lookup, "FEEDBACK_WINDOW_DAYS", &mut self.feedback.window_days)?;
        set_parsed(&lookup, "DEDUP_WINDOW_DAYS", &mut self.dedup.window_days)?;
        Ok(())
    }

    /// Checks needed before a scrape run. Review and stats commands don't need an API key.
    pub fn validate_for_run(&self) -> Result<()> {
        if self.extraction.api_key.is_none() {
            return Err(ScraperError::Config(
                "EXTRACTION_API_KEY is not set".to_string(),
            ));
        }
        let zeroes = [
            ("AI_TIMEOUT_MS", self.extraction.timeout_ms as usize),
            ("FETCH_TIMEOUT_MS", self.fetch.timeout_ms as usize),
            ("MAX_CHUNK_BYTES", self.chunking.max_chunk_bytes),
            ("MAX_CHUNKS", self.chunking.max_chunks),
            ("WORKER_POOL_SIZE", self.pipeline.worker_pool_size),
        ];
        for (name, value) in zeroes {
            if value == 0 {
                return Err(ScraperError::Config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }
}

fn set_parsed<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| ScraperError::Config(format!("{} has invalid value '{}'", key, raw)))?;
    }
    Ok(())
}
