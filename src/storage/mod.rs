pub mod in_memory;
pub mod sqlite;

pub use in_memory::InMemoryStorage;
pub use sqlite::SqliteStorage;

use crate::domain::*;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

/// Storage trait for the source registry, the pending review queue,
/// canonical shows and decision feedback.
///
/// Writes are row-scoped. `insert_pending` enforces the dedup-key uniqueness
/// check among PENDING rows and reports a clash as `StoreConflict`; decision
/// commits only apply to rows that are still PENDING and report anything else
/// as `DecisionConflict` without writing.
#[async_trait]
pub trait Storage: Send + Sync {
    // Source registry
    async fn upsert_source(&self, source: &ScrapingSource) -> Result<()>;
    async fn get_source(&self, url: &str) -> Result<Option<ScrapingSource>>;
    async fn list_sources(&self) -> Result<Vec<ScrapingSource>>;
    /// Insert a seeded source, or update only its enabled flag, priority and
    /// config when present. Returns true when the source was new.
    async fn import_source(&self, seed: &SourceSeed) -> Result<bool>;
    /// Enabling also clears the error streak.
    async fn set_source_enabled(&self, url: &str, enabled: bool) -> Result<()>;
    async fn set_source_priority(&self, url: &str, priority_score: f64) -> Result<()>;
    /// Reset the streak and stamp the success. A disabled source whose streak
    /// reached `reenable_at_streak` is enabled again; returns true if so.
    async fn record_source_success(
        &self,
        url: &str,
        at: DateTime<Utc>,
        reenable_at_streak: u32,
    ) -> Result<bool>;
    /// Bump the streak and stamp the failure. An enabled source whose streak
    /// reaches `disable_at_streak` is disabled; returns true if so.
    async fn record_source_failure(
        &self,
        url: &str,
        at: DateTime<Utc>,
        disable_at_streak: u32,
    ) -> Result<bool>;

    // Pending store
    async fn insert_pending(&self, show: &PendingShow) -> Result<()>;
    async fn get_pending(&self, id: Uuid) -> Result<Option<PendingShow>>;
    /// Rows of any status whose date range touches `[from, to]`
    async fn pending_in_window(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<PendingShow>>;
    async fn list_pending(&self, status: Option<ShowStatus>) -> Result<Vec<PendingShow>>;
    /// Replace the payload of a row that is still PENDING. Returns false if it was decided.
    async fn update_pending_payload(
        &self,
        id: Uuid,
        payload: &NormalizedShow,
        confidence_score: u8,
    ) -> Result<bool>;
    async fn link_duplicate(&self, id: Uuid, duplicate_of: Uuid) -> Result<()>;

    // Canonical shows
    async fn get_show(&self, id: Uuid) -> Result<Option<CanonicalShow>>;
    async fn shows_in_window(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<CanonicalShow>>;

    // Decisions, each atomic per row
    async fn commit_approval(
        &self,
        pending_id: Uuid,
        show: &CanonicalShow,
        feedback: &FeedbackRecord,
        admin_notes: Option<&str>,
        decided_at: DateTime<Utc>,
    ) -> Result<()>;
    async fn commit_rejection(
        &self,
        pending_id: Uuid,
        feedback: &FeedbackRecord,
        admin_notes: Option<&str>,
        decided_at: DateTime<Utc>,
    ) -> Result<()>;

    // Feedback
    async fn feedback_since(&self, since: DateTime<Utc>) -> Result<Vec<FeedbackRecord>>;
}

/// Whether `[start, end]` touches `[from, to]`.
pub(crate) fn range_touches(start: NaiveDate, end: NaiveDate, from: NaiveDate, to: NaiveDate) -> bool {
    start <= to && end >= from
}
