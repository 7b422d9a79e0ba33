use super::{range_touches, Storage};
use crate::domain::*;
use crate::error::{Result, ScraperError};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

/// In-memory storage implementation for development/testing
pub struct InMemoryStorage {
    sources: Arc<Mutex<HashMap<String, ScrapingSource>>>,
    pending: Arc<Mutex<HashMap<Uuid, PendingShow>>>,
    shows: Arc<Mutex<HashMap<Uuid, CanonicalShow>>>,
    feedback: Arc<Mutex<Vec<FeedbackRecord>>>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            sources: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            shows: Arc::new(Mutex::new(HashMap::new())),
            feedback: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Test/dry-run helper: every canonical show
    pub fn all_shows(&self) -> Vec<CanonicalShow> {
        lock(&self.shows).values().cloned().collect()
    }

    /// Test helper: append feedback directly, bypassing a decision
    pub fn push_feedback(&self, record: FeedbackRecord) {
        lock(&self.feedback).push(record);
    }
}

// A poisoned table is still structurally valid; keep serving it.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn source_mut<'a>(
    sources: &'a mut HashMap<String, ScrapingSource>,
    url: &str,
) -> Result<&'a mut ScrapingSource> {
    sources
        .get_mut(url)
        .ok_or_else(|| ScraperError::NotFound(format!("source {}", url)))
}

fn take_pending_for_decision(
    pending: &mut HashMap<Uuid, PendingShow>,
    id: Uuid,
) -> Result<&mut PendingShow> {
    let row = pending
        .get_mut(&id)
        .ok_or_else(|| ScraperError::NotFound(format!("pending show {}", id)))?;
    if row.status.is_decided() {
        return Err(ScraperError::DecisionConflict {
            id,
            status: row.status.to_string(),
        });
    }
    Ok(row)
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn upsert_source(&self, source: &ScrapingSource) -> Result<()> {
        lock(&self.sources).insert(source.url.clone(), source.clone());
        debug!("Upserted source {}", source.url);
        Ok(())
    }

    async fn get_source(&self, url: &str) -> Result<Option<ScrapingSource>> {
        Ok(lock(&self.sources).get(url).cloned())
    }

    async fn list_sources(&self) -> Result<Vec<ScrapingSource>> {
        let mut sources: Vec<ScrapingSource> = lock(&self.sources).values().cloned().collect();
        sources.sort_by(|a, b| a.url.cmp(&b.url));
        Ok(sources)
    }

    async fn import_source(&self, seed: &SourceSeed) -> Result<bool> {
        let mut sources = lock(&self.sources);
        match sources.get_mut(&seed.url) {
            Some(existing) => {
                existing.enabled = seed.enabled;
                if let Some(priority) = seed.priority_score {
                    existing.priority_score = priority;
                }
                if !seed.config.is_null() {
                    existing.config = seed.config.clone();
                }
                Ok(false)
            }
            None => {
                sources.insert(seed.url.clone(), seed.to_source());
                Ok(true)
            }
        }
    }

    async fn set_source_enabled(&self, url: &str, enabled: bool) -> Result<()> {
        let mut sources = lock(&self.sources);
        let source = source_mut(&mut sources, url)?;
        source.enabled = enabled;
        if enabled {
            source.error_streak = 0;
        }
        Ok(())
    }

    async fn set_source_priority(&self, url: &str, priority_score: f64) -> Result<()> {
        let mut sources = lock(&self.sources);
        source_mut(&mut sources, url)?.priority_score = priority_score;
        Ok(())
    }

    async fn record_source_success(
        &self,
        url: &str,
        at: DateTime<Utc>,
        reenable_at_streak: u32,
    ) -> Result<bool> {
        let mut sources = lock(&self.sources);
        let source = source_mut(&mut sources, url)?;
        let reenable = !source.enabled && source.error_streak >= reenable_at_streak;
        if reenable {
            source.enabled = true;
        }
        source.error_streak = 0;
        source.last_success_at = Some(at);
        Ok(reenable)
    }

    async fn record_source_failure(
        &self,
        url: &str,
        at: DateTime<Utc>,
        disable_at_streak: u32,
    ) -> Result<bool> {
        let mut sources = lock(&self.sources);
        let source = source_mut(&mut sources, url)?;
        source.error_streak += 1;
        source.last_error_at = Some(at);
        let disable = source.enabled && source.error_streak >= disable_at_streak;
        if disable {
            source.enabled = false;
        }
        Ok(disable)
    }

    async fn insert_pending(&self, show: &PendingShow) -> Result<()> {
        let mut pending = lock(&self.pending);
        if show.status == ShowStatus::Pending {
            if let Some(existing) = pending
                .values()
                .find(|p| p.status == ShowStatus::Pending && p.dedup_key == show.dedup_key)
            {
                return Err(ScraperError::StoreConflict {
                    existing_id: existing.id,
                });
            }
        }
        pending.insert(show.id, show.clone());
        debug!("Created pending show: {} with id {}", show.raw_payload.name, show.id);
        Ok(())
    }

    async fn get_pending(&self, id: Uuid) -> Result<Option<PendingShow>> {
        Ok(lock(&self.pending).get(&id).cloned())
    }

    async fn pending_in_window(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<PendingShow>> {
        let mut rows: Vec<PendingShow> = lock(&self.pending)
            .values()
            .filter(|p| range_touches(p.raw_payload.start_date, p.raw_payload.end_date, from, to))
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.created_at);
        Ok(rows)
    }

    async fn list_pending(&self, status: Option<ShowStatus>) -> Result<Vec<PendingShow>> {
        let mut rows: Vec<PendingShow> = lock(&self.pending)
            .values()
            .filter(|p| status.map_or(true, |s| p.status == s))
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.created_at);
        Ok(rows)
    }

    async fn update_pending_payload(
        &self,
        id: Uuid,
        payload: &NormalizedShow,
        confidence_score: u8,
    ) -> Result<bool> {
        let mut pending = lock(&self.pending);
        match pending.get_mut(&id) {
            Some(row) if row.status == ShowStatus::Pending => {
                row.raw_payload = payload.clone();
                row.confidence_score = confidence_score;
                debug!("Updated pending show payload {}", id);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(ScraperError::NotFound(format!("pending show {}", id))),
        }
    }

    async fn link_duplicate(&self, id: Uuid, duplicate_of: Uuid) -> Result<()> {
        let mut pending = lock(&self.pending);
        let row = pending
            .get_mut(&id)
            .ok_or_else(|| ScraperError::NotFound(format!("pending show {}", id)))?;
        row.duplicate_of = Some(duplicate_of);
        Ok(())
    }

    async fn get_show(&self, id: Uuid) -> Result<Option<CanonicalShow>> {
        Ok(lock(&self.shows).get(&id).cloned())
    }

    async fn shows_in_window(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<CanonicalShow>> {
        let mut shows: Vec<CanonicalShow> = lock(&self.shows)
            .values()
            .filter(|s| range_touches(s.start_date, s.end_date, from, to))
            .cloned()
            .collect();
        shows.sort_by_key(|s| s.created_at);
        Ok(shows)
    }

    async fn commit_approval(
        &self,
        pending_id: Uuid,
        show: &CanonicalShow,
        feedback: &FeedbackRecord,
        admin_notes: Option<&str>,
        decided_at: DateTime<Utc>,
    ) -> Result<()> {
        // Hold the pending table for the whole commit so the row transition,
        // canonical insert and feedback append land together.
        let mut pending = lock(&self.pending);
        let row = take_pending_for_decision(&mut pending, pending_id)?;
        row.status = ShowStatus::Approved;
        row.decided_at = Some(decided_at);
        if let Some(notes) = admin_notes {
            row.admin_notes = Some(notes.to_string());
        }
        lock(&self.shows).insert(show.id, show.clone());
        lock(&self.feedback).push(feedback.clone());
        debug!("Approved pending show {} as {}", pending_id, show.id);
        Ok(())
    }

    async fn commit_rejection(
        &self,
        pending_id: Uuid,
        feedback: &FeedbackRecord,
        admin_notes: Option<&str>,
        decided_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut pending = lock(&self.pending);
        let row = take_pending_for_decision(&mut pending, pending_id)?;
        row.status = ShowStatus::Rejected;
        row.decided_at = Some(decided_at);
        if let Some(notes) = admin_notes {
            row.admin_notes = Some(notes.to_string());
        }
        lock(&self.feedback).push(feedback.clone());
        debug!("Rejected pending show {}", pending_id);
        Ok(())
    }

    async fn feedback_since(&self, since: DateTime<Utc>) -> Result<Vec<FeedbackRecord>> {
        Ok(lock(&self.feedback)
            .iter()
            .filter(|f| f.created_at >= since)
            .cloned()
            .collect())
    }
}
