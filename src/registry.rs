//! Source registry: seed import, enable flags and fetch-health bookkeeping.

use crate::config::FeedbackConfig;
use crate::domain::ScrapingSource;
use crate::error::{Result, ScraperError};
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub use crate::domain::SourceSeed;

#[derive(Debug, Deserialize)]
struct SeedFile {
    #[serde(default)]
    sources: Vec<SourceSeed>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ImportSummary {
    pub added: usize,
    pub updated: usize,
}

#[derive(Clone)]
pub struct SourceRegistry {
    storage: Arc<dyn Storage>,
    error_streak_threshold: u32,
}

impl SourceRegistry {
    pub fn new(storage: Arc<dyn Storage>, config: &FeedbackConfig) -> Self {
        Self {
            storage,
            error_streak_threshold: config.error_streak_threshold.max(1),
        }
    }

    /// Read seeds from a `.toml`/`.json` file, or from every such file in a directory.
    pub fn load_seeds<P: AsRef<Path>>(path: P) -> Result<Vec<SourceSeed>> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ScraperError::Config(format!(
                "Source seed path does not exist: {}",
                path.display()
            )));
        }

        if path.is_dir() {
            let mut files: Vec<_> = fs::read_dir(path)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| matches!(extension(p).as_deref(), Some("json") | Some("toml")))
                .collect();
            files.sort();
            let mut seeds = Vec::new();
            for file in files {
                seeds.extend(Self::parse_seed_file(&file)?);
            }
            return Ok(seeds);
        }

        Self::parse_seed_file(path)
    }

    fn parse_seed_file(path: &Path) -> Result<Vec<SourceSeed>> {
        let content = fs::read_to_string(path)?;
        match extension(path).as_deref() {
            Some("toml") => Ok(toml::from_str::<SeedFile>(&content)?.sources),
            Some("json") => {
                // A bare array, a single source, or `{"sources": [...]}`
                let value: serde_json::Value = serde_json::from_str(&content)?;
                if value.is_array() {
                    Ok(serde_json::from_value(value)?)
                } else if value.get("sources").is_some() {
                    Ok(serde_json::from_value::<SeedFile>(value)?.sources)
                } else {
                    Ok(vec![serde_json::from_value(value)?])
                }
            }
            _ => Err(ScraperError::Config(format!(
                "Unsupported seed file type: {}",
                path.display()
            ))),
        }
    }

    /// Upsert seeds. Runtime counters of existing sources are preserved.
    pub async fn import(&self, seeds: Vec<SourceSeed>) -> Result<ImportSummary> {
        let mut summary = ImportSummary::default();
        for mut seed in seeds {
            seed.url = seed.url.trim().to_string();
            if seed.url.is_empty() {
                warn!("Skipping seed with empty url");
                continue;
            }
            if self.storage.import_source(&seed).await? {
                summary.added += 1;
            } else {
                summary.updated += 1;
            }
        }
        info!(
            "Imported sources: {} added, {} updated",
            summary.added, summary.updated
        );
        Ok(summary)
    }

    pub async fn list(&self) -> Result<Vec<ScrapingSource>> {
        self.storage.list_sources().await
    }

    pub async fn set_enabled(&self, url: &str, enabled: bool) -> Result<ScrapingSource> {
        self.storage.set_source_enabled(url, enabled).await?;
        info!("Source {} {}", url, if enabled { "enabled" } else { "disabled" });
        self.require(url).await
    }

    /// A successful fetch resets the error streak and re-enables an auto-disabled source.
    pub async fn record_fetch_success(&self, url: &str, at: DateTime<Utc>) -> Result<()> {
        if self
            .storage
            .record_source_success(url, at, self.error_streak_threshold)
            .await?
        {
            info!("Re-enabled source {} after successful fetch", url);
        }
        Ok(())
    }

    /// Returns true when this failure disabled the source.
    pub async fn record_fetch_failure(&self, url: &str, at: DateTime<Utc>) -> Result<bool> {
        let disabled = self
            .storage
            .record_source_failure(url, at, self.error_streak_threshold)
            .await?;
        if disabled {
            warn!(
                "Disabled source {} after {} consecutive fetch failures",
                url, self.error_streak_threshold
            );
        }
        Ok(disabled)
    }

    /// Sources to run, highest priority first. Ties go by url.
    pub async fn schedulable_sources(&self, include_disabled: bool) -> Result<Vec<ScrapingSource>> {
        let mut sources: Vec<ScrapingSource> = self
            .storage
            .list_sources()
            .await?
            .into_iter()
            .filter(|s| include_disabled || s.enabled)
            .collect();
        sources.sort_by(|a, b| {
            b.priority_score
                .total_cmp(&a.priority_score)
                .then_with(|| a.url.cmp(&b.url))
        });
        Ok(sources)
    }

    async fn require(&self, url: &str) -> Result<ScrapingSource> {
        self.storage
            .get_source(url)
            .await?
            .ok_or_else(|| ScraperError::NotFound(format!("source {}", url)))
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}
