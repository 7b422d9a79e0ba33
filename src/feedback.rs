//! Feedback loop: per-source aggregation of review decisions and the
//! priority score derived from it. Only ever writes to the source registry.

use crate::config::FeedbackConfig;
use crate::domain::{FeedbackAction, FeedbackRecord};
use crate::error::Result;
use crate::storage::Storage;
use chrono::{Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStats {
    pub source_url: String,
    pub total: usize,
    pub approved: usize,
    pub approved_with_edits: usize,
    pub rejected: usize,
    pub approval_rate: f64,
    pub rejection_rate: f64,
    /// Mean confidence of approved rows; `None` when nothing was approved
    pub avg_confidence: Option<f64>,
    /// How often each field was corrected on approval
    pub field_corrections: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriorityUpdate {
    pub url: String,
    pub previous: f64,
    pub updated: f64,
}

/// Decreases with rejection rate, increases with volume; always within 0..=100.
pub fn priority_score(stats: &SourceStats) -> f64 {
    let volume_factor = ((1.0 + stats.total as f64).ln() / 101f64.ln()).min(1.0);
    let score = 100.0 * (1.0 - stats.rejection_rate) * (0.5 + 0.5 * volume_factor);
    (score.clamp(0.0, 100.0) * 100.0).round() / 100.0
}

pub fn aggregate(records: &[FeedbackRecord]) -> Vec<SourceStats> {
    let mut by_source: BTreeMap<&str, Vec<&FeedbackRecord>> = BTreeMap::new();
    for record in records {
        by_source.entry(record.source_url.as_str()).or_default().push(record);
    }

    by_source
        .into_iter()
        .map(|(url, records)| {
            let count = |action: FeedbackAction| records.iter().filter(|r| r.action == action).count();
            let approved = count(FeedbackAction::Approved);
            let approved_with_edits = count(FeedbackAction::ApprovedWithEdits);
            let rejected = count(FeedbackAction::Rejected);
            let total = records.len();

            let approved_scores: Vec<f64> = records
                .iter()
                .filter(|r| r.action != FeedbackAction::Rejected)
                .map(|r| r.confidence_score as f64)
                .collect();
            let avg_confidence = (!approved_scores.is_empty())
                .then(|| approved_scores.iter().sum::<f64>() / approved_scores.len() as f64);

            let mut field_corrections = BTreeMap::new();
            for record in &records {
                for field in record.field_corrections.keys() {
                    *field_corrections.entry(field.clone()).or_insert(0) += 1;
                }
            }

            SourceStats {
                source_url: url.to_string(),
                total,
                approved,
                approved_with_edits,
                rejected,
                approval_rate: (approved + approved_with_edits) as f64 / total as f64,
                rejection_rate: rejected as f64 / total as f64,
                avg_confidence,
                field_corrections,
            }
        })
        .collect()
}

#[derive(Clone)]
pub struct FeedbackLoop {
    storage: Arc<dyn Storage>,
    window_days: i64,
}

impl FeedbackLoop {
    pub fn new(storage: Arc<dyn Storage>, config: &FeedbackConfig) -> Self {
        Self {
            storage,
            window_days: config.window_days,
        }
    }

    /// Stats for sources with at least `min_count` decisions in the last `days_ago` days.
    pub async fn get_feedback_stats(&self, days_ago: i64, min_count: usize) -> Result<Vec<SourceStats>> {
        let since = Utc::now() - Duration::days(days_ago.max(0));
        let records = self.storage.feedback_since(since).await?;
        let mut stats: Vec<SourceStats> = aggregate(&records)
            .into_iter()
            .filter(|s| s.total >= min_count.max(1))
            .collect();
        stats.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.source_url.cmp(&b.source_url)));
        Ok(stats)
    }

    /// Recompute `priority_score` for every registered source with feedback in
    /// the trailing window. Sources without feedback keep their score.
    pub async fn recompute_priorities(&self) -> Result<Vec<PriorityUpdate>> {
        let stats = self.get_feedback_stats(self.window_days, 1).await?;
        let mut updates = Vec::new();

        for stat in stats {
            let Some(source) = self.storage.get_source(&stat.source_url).await? else {
                debug!("Feedback for unregistered source {}, skipping", stat.source_url);
                continue;
            };
            let updated = priority_score(&stat);
            if (updated - source.priority_score).abs() < f64::EPSILON {
                continue;
            }
            let previous = source.priority_score;
            self.storage.set_source_priority(&source.url, updated).await?;
            info!(
                "Source {} priority {:.2} -> {:.2} (rejection rate {:.2}, {} decisions)",
                source.url, previous, updated, stat.rejection_rate, stat.total
            );
            updates.push(PriorityUpdate {
                url: source.url,
                previous,
                updated,
            });
        }

        Ok(updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FieldCorrection, ScrapingSource};
    use crate::storage::InMemoryStorage;
    use uuid::Uuid;

    fn record(source: &str, action: FeedbackAction, confidence: u8, corrected: &[&str]) -> FeedbackRecord {
        FeedbackRecord {
            id: Uuid::new_v4(),
            source_url: source.to_string(),
            pending_id: Uuid::new_v4(),
            action,
            field_corrections: corrected
                .iter()
                .map(|f| {
                    (
                        f.to_string(),
                        FieldCorrection {
                            from: None,
                            to: Some("x".to_string()),
                        },
                    )
                })
                .collect(),
            confidence_score: confidence,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_aggregate_rates_and_corrections() {
        let records = vec![
            record("https://s1", FeedbackAction::Approved, 80, &[]),
            record("https://s1", FeedbackAction::ApprovedWithEdits, 60, &["state", "city"]),
            record("https://s1", FeedbackAction::Rejected, 30, &[]),
            record("https://s1", FeedbackAction::ApprovedWithEdits, 70, &["state"]),
        ];
        let stats = aggregate(&records);
        assert_eq!(stats.len(), 1);
        let s = &stats[0];
        assert_eq!(s.total, 4);
        assert_eq!(s.approval_rate, 0.75);
        assert_eq!(s.rejection_rate, 0.25);
        assert_eq!(s.avg_confidence, Some(70.0));
        assert_eq!(s.field_corrections["state"], 2);
        assert_eq!(s.field_corrections["city"], 1);
    }

    #[test]
    fn test_priority_monotonic_in_rejection_and_volume() {
        let stats = |total: usize, rejected: usize| SourceStats {
            source_url: "s".to_string(),
            total,
            approved: total - rejected,
            approved_with_edits: 0,
            rejected,
            approval_rate: (total - rejected) as f64 / total as f64,
            rejection_rate: rejected as f64 / total as f64,
            avg_confidence: None,
            field_corrections: BTreeMap::new(),
        };
        assert!(priority_score(&stats(10, 1)) > priority_score(&stats(10, 5)));
        assert!(priority_score(&stats(50, 0)) > priority_score(&stats(5, 0)));
        assert_eq!(priority_score(&stats(100, 0)), 100.0);
        assert_eq!(priority_score(&stats(10, 10)), 0.0);
    }

    #[tokio::test]
    async fn test_min_count_filters_sources() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.push_feedback(record("https://busy", FeedbackAction::Approved, 80, &[]));
        storage.push_feedback(record("https://busy", FeedbackAction::Rejected, 40, &[]));
        storage.push_feedback(record("https://quiet", FeedbackAction::Approved, 90, &[]));
        let feedback = FeedbackLoop::new(storage, &FeedbackConfig::default());

        let stats = feedback.get_feedback_stats(30, 2).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].source_url, "https://busy");
    }

    #[tokio::test]
    async fn test_recompute_only_touches_sources() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.upsert_source(&ScrapingSource::new("https://bad")).await.unwrap();
        storage.upsert_source(&ScrapingSource::new("https://idle")).await.unwrap();
        for _ in 0..4 {
            storage.push_feedback(record("https://bad", FeedbackAction::Rejected, 40, &[]));
        }
        storage.push_feedback(record("https://bad", FeedbackAction::Approved, 80, &[]));
        storage.push_feedback(record("https://gone", FeedbackAction::Approved, 80, &[]));

        let feedback = FeedbackLoop::new(storage.clone(), &FeedbackConfig::default());
        let updates = feedback.recompute_priorities().await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].url, "https://bad");
        assert!(updates[0].updated < 50.0);

        let idle = storage.get_source("https://idle").await.unwrap().unwrap();
        assert_eq!(idle.priority_score, 50.0);
        assert!(storage.list_pending(None).await.unwrap().is_empty());
    }
}
