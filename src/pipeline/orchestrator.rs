//! Batch run over the source registry.
//!
//! Sources are processed by a bounded worker pool. Each worker fetches,
//! chunks, extracts (chunks in order, under a wall-clock budget), normalizes
//! and scores one source, then hands its candidate set back. A single commit
//! stage applies dedup and writes candidates in completion order, so two
//! sources never race to insert the same show.

use crate::config::{Config, PipelineConfig};
use crate::domain::{NormalizedShow, ScrapingSource};
use crate::error::Result;
use crate::metrics::PipelineMetrics;
use crate::pipeline::chunker::Chunker;
use crate::pipeline::dedup::{CandidateOutcome, Deduplicator};
use crate::pipeline::extractor::{ExtractionClient, Extractor};
use crate::pipeline::fetcher::PageFetcher;
use crate::pipeline::{normalizer, scoring};
use crate::registry::SourceRegistry;
use crate::storage::Storage;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Cooperative cancellation, checked before each source starts.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Succeeded,
    /// The wall-clock budget ran out before every chunk was extracted
    PartiallyProcessed,
    Failed,
    /// Never started because the run was cancelled
    Cancelled,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Succeeded => "succeeded",
            SourceStatus::PartiallyProcessed => "partially_processed",
            SourceStatus::Failed => "failed",
            SourceStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub url: String,
    pub status: SourceStatus,
    pub error: Option<String>,
    pub chunks_total: usize,
    pub chunks_processed: usize,
    pub chunks_failed: usize,
    pub candidates_extracted: usize,
    pub dropped: usize,
    pub inserted: usize,
    pub merged: usize,
    pub already_decided: usize,
    pub elapsed_ms: u64,
}

impl SourceReport {
    fn new(url: &str, status: SourceStatus) -> Self {
        Self {
            url: url.to_string(),
            status,
            error: None,
            chunks_total: 0,
            chunks_processed: 0,
            chunks_failed: 0,
            candidates_extracted: 0,
            dropped: 0,
            inserted: 0,
            merged: 0,
            already_decided: 0,
            elapsed_ms: 0,
        }
    }

    fn failed(url: &str, error: String) -> Self {
        let mut report = Self::new(url, SourceStatus::Failed);
        report.error = Some(error);
        report
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub today: NaiveDate,
    pub cancelled: bool,
    pub sources: Vec<SourceReport>,
}

impl RunReport {
    pub fn inserted(&self) -> usize {
        self.sources.iter().map(|s| s.inserted).sum()
    }

    pub fn merged(&self) -> usize {
        self.sources.iter().map(|s| s.merged + s.already_decided).sum()
    }

    pub fn count(&self, status: SourceStatus) -> usize {
        self.sources.iter().filter(|s| s.status == status).count()
    }

    pub fn source(&self, url: &str) -> Option<&SourceReport> {
        self.sources.iter().find(|s| s.url == url)
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Also run auto-disabled sources so a success can re-enable them
    pub include_disabled: bool,
    /// Reference date for the recency filter
    pub today: NaiveDate,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            include_disabled: false,
            today: Utc::now().date_naive(),
        }
    }
}

/// A scored candidate ready for the commit stage.
#[derive(Debug, Clone)]
struct ScoredCandidate {
    show: NormalizedShow,
    confidence: u8,
}

struct SourceOutput {
    report: SourceReport,
    candidates: Vec<ScoredCandidate>,
}

/// Everything one worker needs; cheap to clone into a task.
#[derive(Clone)]
struct SourceWorker {
    fetcher: Arc<dyn PageFetcher>,
    extractor: Arc<Extractor>,
    chunker: Chunker,
    registry: SourceRegistry,
    config: PipelineConfig,
    cancel: CancelFlag,
}

pub struct Pipeline {
    storage: Arc<dyn Storage>,
    worker: SourceWorker,
    dedup: Deduplicator,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        storage: Arc<dyn Storage>,
        fetcher: Arc<dyn PageFetcher>,
        client: Arc<dyn ExtractionClient>,
    ) -> Self {
        let registry = SourceRegistry::new(storage.clone(), &config.feedback);
        Self {
            worker: SourceWorker {
                fetcher,
                extractor: Arc::new(Extractor::new(client, &config.extraction)),
                chunker: Chunker::new(&config.chunking),
                registry,
                config: config.pipeline.clone(),
                cancel: CancelFlag::new(),
            },
            storage,
            dedup: Deduplicator::new(config.dedup.clone()),
        }
    }

    /// Handle for cancelling a run from elsewhere (e.g. a ctrl-c handler).
    pub fn cancel_flag(&self) -> CancelFlag {
        self.worker.cancel.clone()
    }

    pub async fn run(&self, options: RunOptions) -> Result<RunReport> {
        let started_at = Utc::now();
        let sources = self
            .worker
            .registry
            .schedulable_sources(options.include_disabled)
            .await?;
        info!(
            "Starting batch run over {} sources (today = {})",
            sources.len(),
            options.today
        );

        let pool = Arc::new(Semaphore::new(self.worker.config.worker_pool_size.max(1)));
        let mut tasks = JoinSet::new();
        for source in sources {
            let worker = self.worker.clone();
            let pool = pool.clone();
            let today = options.today;
            let url = source.url.clone();
            let span = info_span!("source", url = %source.url);
            tasks.spawn(async move {
                let _slot = pool.acquire_owned().await.ok();
                // The inner task isolates a panicking worker so its source still gets a report
                match tokio::spawn(worker.process(source, today).instrument(span)).await {
                    Ok(output) => output,
                    Err(e) => {
                        error!(source = %url, "Source worker aborted: {}", e);
                        SourceOutput {
                            report: SourceReport::failed(&url, format!("worker aborted: {}", e)),
                            candidates: Vec::new(),
                        }
                    }
                }
            });
        }

        // Commit stage: one source at a time, in completion order
        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let output = match joined {
                Ok(output) => output,
                Err(e) => {
                    error!("Source task could not be joined: {}", e);
                    continue;
                }
            };
            let report = self.commit(output).await;
            PipelineMetrics::record_source(report.status.as_str(), report.elapsed_ms as f64 / 1000.0);
            reports.push(report);
        }

        let report = RunReport {
            started_at,
            finished_at: Utc::now(),
            today: options.today,
            cancelled: self.worker.cancel.is_cancelled(),
            sources: reports,
        };
        info!(
            "Batch run finished: {} succeeded, {} partial, {} failed, {} cancelled; {} inserted, {} duplicates",
            report.count(SourceStatus::Succeeded),
            report.count(SourceStatus::PartiallyProcessed),
            report.count(SourceStatus::Failed),
            report.count(SourceStatus::Cancelled),
            report.inserted(),
            report.merged()
        );
        Ok(report)
    }

    async fn commit(&self, output: SourceOutput) -> SourceReport {
        let SourceOutput { mut report, candidates } = output;
        for candidate in candidates {
            let outcome = self
                .dedup
                .commit_candidate(
                    self.storage.as_ref(),
                    &report.url,
                    candidate.show,
                    candidate.confidence,
                    Utc::now(),
                )
                .await;
            match outcome {
                Ok(CandidateOutcome::Inserted { id }) => {
                    debug!("Inserted pending show {}", id);
                    report.inserted += 1;
                    PipelineMetrics::record_inserted();
                }
                Ok(CandidateOutcome::Merged { .. }) => {
                    report.merged += 1;
                    PipelineMetrics::record_duplicate();
                }
                Ok(CandidateOutcome::DuplicateOfDecided { .. })
                | Ok(CandidateOutcome::DuplicateOfCanonical { .. }) => {
                    report.already_decided += 1;
                    PipelineMetrics::record_duplicate();
                }
                Err(e) => {
                    // A store failure loses this candidate only
                    warn!(source = %report.url, "Failed to commit candidate: {}", e);
                    report.error.get_or_insert_with(|| e.to_string());
                }
            }
        }
        report
    }
}

impl SourceWorker {
    async fn process(self, source: ScrapingSource, today: NaiveDate) -> SourceOutput {
        if self.cancel.is_cancelled() {
            info!("Run cancelled, skipping source");
            return SourceOutput {
                report: SourceReport::new(&source.url, SourceStatus::Cancelled),
                candidates: Vec::new(),
            };
        }

        let started = Instant::now();
        let deadline = started + self.config.source_budget();
        let mut report = SourceReport::new(&source.url, SourceStatus::Succeeded);
        let mut candidates = Vec::new();

        let html = match self.fetcher.fetch(&source.url).await {
            Ok(html) => {
                if let Err(e) = self.registry.record_fetch_success(&source.url, Utc::now()).await {
                    warn!("Failed to record fetch success: {}", e);
                }
                html
            }
            Err(e) => {
                warn!("Fetch failed: {}", e);
                if let Err(e) = self.registry.record_fetch_failure(&source.url, Utc::now()).await {
                    warn!("Failed to record fetch failure: {}", e);
                }
                report.status = SourceStatus::Failed;
                report.error = Some(e.to_string());
                report.elapsed_ms = started.elapsed().as_millis() as u64;
                return SourceOutput { report, candidates };
            }
        };

        let chunks = self.chunker.chunk(&html);
        report.chunks_total = chunks.len();
        debug!("Fetched {} bytes in {} chunks", html.len(), chunks.len());

        for chunk in &chunks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    "Source budget exhausted after {} of {} chunks",
                    report.chunks_processed, report.chunks_total
                );
                report.status = SourceStatus::PartiallyProcessed;
                break;
            }

            let extraction = match tokio::time::timeout(
                remaining,
                self.extractor.extract_chunk(chunk, today, &source.url),
            )
            .await
            {
                Ok(extraction) => extraction,
                Err(_) => {
                    warn!(chunk = chunk.index, "Source budget exhausted mid-chunk");
                    report.status = SourceStatus::PartiallyProcessed;
                    break;
                }
            };
            report.chunks_processed += 1;

            if extraction.error.is_some() {
                report.chunks_failed += 1;
                PipelineMetrics::record_chunk_failed();
                continue;
            }

            report.candidates_extracted += extraction.candidates.len();
            PipelineMetrics::record_extracted(extraction.candidates.len());

            for raw in &extraction.candidates {
                match normalizer::normalize(raw, today) {
                    Ok(show) => {
                        let confidence = scoring::score(&show);
                        candidates.push(ScoredCandidate { show, confidence });
                    }
                    Err(reason) => {
                        debug!(chunk = chunk.index, "Dropped candidate: {}", reason);
                        report.dropped += 1;
                        PipelineMetrics::record_dropped(reason.as_str());
                    }
                }
            }
        }

        if report.chunks_total > 0 && report.chunks_failed == report.chunks_total {
            report.status = SourceStatus::Failed;
            report.error = Some("extraction failed for every chunk".to_string());
        }
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            status = report.status.as_str(),
            "Source processed: {} candidates kept, {} dropped",
            candidates.len(),
            report.dropped
        );
        SourceOutput { report, candidates }
    }
}
