// Ingestion pipeline: fetch, chunk, extract, normalize, dedup, score, commit

pub mod chunker;
pub mod dedup;
pub mod extractor;
pub mod fetcher;
pub mod normalizer;
pub mod orchestrator;
pub mod rate_limiter;
pub mod scoring;

pub use orchestrator::{CancelFlag, Pipeline, RunOptions, RunReport, SourceReport, SourceStatus};
