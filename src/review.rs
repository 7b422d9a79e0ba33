//! Review decision handler: the admin-facing approve/reject state machine.
//!
//! `PENDING -> APPROVED` creates exactly one canonical show; `PENDING -> REJECTED`
//! creates none. Both append a feedback record. Decided rows are terminal: a
//! second decision is reported as a conflict and writes nothing.

use crate::domain::{
    field_diff, CanonicalShow, FeedbackAction, FeedbackRecord, PendingShow, ShowEdits, ShowStatus,
};
use crate::error::{Result, ScraperError};
use crate::metrics::ReviewMetrics;
use crate::pipeline::scoring::LOW_CONFIDENCE_THRESHOLD;
use crate::storage::Storage;
use chrono::Utc;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// A queue row with its triage flag.
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    #[serde(flatten)]
    pub show: PendingShow,
    pub low_confidence: bool,
}

/// Per-id outcome of a batch decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DecisionResult {
    Approved { id: Uuid, show_id: Uuid },
    Rejected { id: Uuid },
    AlreadyDecided { id: Uuid, status: String },
    NotFound { id: Uuid },
    Failed { id: Uuid, error: String },
}

impl DecisionResult {
    pub fn id(&self) -> Uuid {
        match self {
            DecisionResult::Approved { id, .. }
            | DecisionResult::Rejected { id }
            | DecisionResult::AlreadyDecided { id, .. }
            | DecisionResult::NotFound { id }
            | DecisionResult::Failed { id, .. } => *id,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, DecisionResult::Approved { .. } | DecisionResult::Rejected { .. })
    }

    fn from_error(id: Uuid, err: ScraperError) -> Self {
        match err {
            ScraperError::DecisionConflict { status, .. } => DecisionResult::AlreadyDecided { id, status },
            ScraperError::NotFound(_) => DecisionResult::NotFound { id },
            other => DecisionResult::Failed {
                id,
                error: other.to_string(),
            },
        }
    }
}

#[derive(Clone)]
pub struct ReviewService {
    storage: Arc<dyn Storage>,
    low_confidence_threshold: u8,
}

impl ReviewService {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            low_confidence_threshold: LOW_CONFIDENCE_THRESHOLD,
        }
    }

    pub fn with_low_confidence_threshold(mut self, threshold: u8) -> Self {
        self.low_confidence_threshold = threshold;
        self
    }

    /// PENDING rows awaiting review, highest confidence first, then oldest first.
    /// Rows linked to another via `duplicate_of` are hidden.
    pub async fn list_queue(&self) -> Result<Vec<QueueEntry>> {
        let mut rows: Vec<PendingShow> = self
            .storage
            .list_pending(Some(ShowStatus::Pending))
            .await?
            .into_iter()
            .filter(|row| row.duplicate_of.is_none())
            .collect();
        rows.sort_by_key(|row| (Reverse(row.confidence_score), row.created_at));
        Ok(rows
            .into_iter()
            .map(|show| QueueEntry {
                low_confidence: show.confidence_score < self.low_confidence_threshold,
                show,
            })
            .collect())
    }

    pub async fn get(&self, id: Uuid) -> Result<PendingShow> {
        self.storage
            .get_pending(id)
            .await?
            .ok_or_else(|| ScraperError::NotFound(format!("pending show {}", id)))
    }

    /// Approve a pending row, applying optional edits, and return the new canonical show.
    pub async fn approve(
        &self,
        id: Uuid,
        edits: Option<&ShowEdits>,
        admin_notes: Option<&str>,
    ) -> Result<CanonicalShow> {
        let pending = self.decidable(id).await?;

        let original = &pending.raw_payload;
        let approved = match edits {
            Some(edits) => edits.apply(original),
            None => original.clone(),
        };
        if approved.name.trim().is_empty() {
            return Err(ScraperError::InvalidEdit("name cannot be empty".to_string()));
        }
        if approved.end_date < approved.start_date {
            return Err(ScraperError::InvalidEdit(format!(
                "end date {} is before start date {}",
                approved.end_date, approved.start_date
            )));
        }

        let corrections = field_diff(original, &approved);
        let action = if corrections.is_empty() {
            FeedbackAction::Approved
        } else {
            FeedbackAction::ApprovedWithEdits
        };
        let now = Utc::now();
        let show = CanonicalShow::from_approved(&pending, &approved, now);
        let feedback = FeedbackRecord {
            id: Uuid::new_v4(),
            source_url: pending.source_url.clone(),
            pending_id: id,
            action,
            field_corrections: corrections,
            confidence_score: pending.confidence_score,
            created_at: now,
        };

        self.storage
            .commit_approval(id, &show, &feedback, admin_notes, now)
            .await
            .map_err(|e| self.note_conflict(e))?;
        ReviewMetrics::record_decision(action.as_str());
        info!("Approved pending show {} as show {} ({})", id, show.id, action.as_str());
        Ok(show)
    }

    pub async fn reject(&self, id: Uuid, admin_notes: Option<&str>) -> Result<()> {
        let pending = self.decidable(id).await?;
        let now = Utc::now();
        let feedback = FeedbackRecord {
            id: Uuid::new_v4(),
            source_url: pending.source_url.clone(),
            pending_id: id,
            action: FeedbackAction::Rejected,
            field_corrections: BTreeMap::new(),
            confidence_score: pending.confidence_score,
            created_at: now,
        };
        self.storage
            .commit_rejection(id, &feedback, admin_notes, now)
            .await
            .map_err(|e| self.note_conflict(e))?;
        ReviewMetrics::record_decision(FeedbackAction::Rejected.as_str());
        info!("Rejected pending show {}", id);
        Ok(())
    }

    /// Approve each id independently; one row's failure never affects the others.
    pub async fn approve_batch(&self, ids: &[Uuid], admin_notes: Option<&str>) -> Vec<DecisionResult> {
        let mut results = Vec::with_capacity(ids.len());
        for &id in ids {
            let result = match self.approve(id, None, admin_notes).await {
                Ok(show) => DecisionResult::Approved { id, show_id: show.id },
                Err(e) => DecisionResult::from_error(id, e),
            };
            results.push(result);
        }
        results
    }

    pub async fn reject_batch(&self, ids: &[Uuid], admin_notes: Option<&str>) -> Vec<DecisionResult> {
        let mut results = Vec::with_capacity(ids.len());
        for &id in ids {
            let result = match self.reject(id, admin_notes).await {
                Ok(()) => DecisionResult::Rejected { id },
                Err(e) => DecisionResult::from_error(id, e),
            };
            results.push(result);
        }
        results
    }

    async fn decidable(&self, id: Uuid) -> Result<PendingShow> {
        let pending = self.get(id).await?;
        if pending.status.is_decided() {
            return Err(self.note_conflict(ScraperError::DecisionConflict {
                id,
                status: pending.status.to_string(),
            }));
        }
        Ok(pending)
    }

    fn note_conflict(&self, err: ScraperError) -> ScraperError {
        if let ScraperError::DecisionConflict { id, status } = &err {
            warn!("Pending show {} already {}, decision ignored", id, status);
            ReviewMetrics::record_decision("conflict");
        }
        err
    }
}
