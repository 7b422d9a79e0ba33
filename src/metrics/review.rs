use crate::metrics::PhaseMetrics;

pub const DECISIONS: &str = "card_show_decisions_total";

/// Admin decision metrics
pub struct ReviewMetrics;

impl ReviewMetrics {
    /// `action` is a feedback action name, or "conflict" for a no-op on a decided row
    pub fn record_decision(action: &'static str) {
        metrics::counter!(DECISIONS, "action" => action).increment(1);
    }
}

impl PhaseMetrics for ReviewMetrics {
    fn register_metrics() {
        for action in ["approved", "approved_with_edits", "rejected", "conflict"] {
            let _ = metrics::counter!(DECISIONS, "action" => action);
        }
    }
}
