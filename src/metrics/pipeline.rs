use crate::metrics::PhaseMetrics;

pub const SOURCES_PROCESSED: &str = "card_show_sources_processed_total";
pub const CHUNKS_FAILED: &str = "card_show_chunks_failed_total";
pub const CANDIDATES_EXTRACTED: &str = "card_show_candidates_extracted_total";
pub const CANDIDATES_DROPPED: &str = "card_show_candidates_dropped_total";
pub const PENDING_INSERTED: &str = "card_show_pending_inserted_total";
pub const DUPLICATES_MERGED: &str = "card_show_duplicates_merged_total";
pub const SOURCE_DURATION: &str = "card_show_source_duration_seconds";

/// Batch run metrics
pub struct PipelineMetrics;

impl PipelineMetrics {
    pub fn record_source(status: &'static str, duration_secs: f64) {
        metrics::counter!(SOURCES_PROCESSED, "status" => status).increment(1);
        metrics::histogram!(SOURCE_DURATION).record(duration_secs);
    }

    pub fn record_chunk_failed() {
        metrics::counter!(CHUNKS_FAILED).increment(1);
    }

    pub fn record_extracted(count: usize) {
        metrics::counter!(CANDIDATES_EXTRACTED).increment(count as u64);
    }

    pub fn record_dropped(reason: &'static str) {
        metrics::counter!(CANDIDATES_DROPPED, "reason" => reason).increment(1);
    }

    pub fn record_inserted() {
        metrics::counter!(PENDING_INSERTED).increment(1);
    }

    pub fn record_duplicate() {
        metrics::counter!(DUPLICATES_MERGED).increment(1);
    }
}

impl PhaseMetrics for PipelineMetrics {
    fn register_metrics() {
        let _ = metrics::counter!(CHUNKS_FAILED);
        let _ = metrics::counter!(CANDIDATES_EXTRACTED);
        let _ = metrics::counter!(PENDING_INSERTED);
        let _ = metrics::counter!(DUPLICATES_MERGED);
        let _ = metrics::histogram!(SOURCE_DURATION);
    }
}
