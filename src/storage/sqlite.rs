use super::Storage;
use crate::domain::*;
use crate::error::{Result, ScraperError};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

const SCHEMA: &str = r#"
PRAGMA journal_mode=WAL;
CREATE TABLE IF NOT EXISTS scraping_sources (
    url              TEXT PRIMARY KEY,
    enabled          INTEGER NOT NULL,
    priority_score   REAL NOT NULL,
    error_streak     INTEGER NOT NULL,
    last_success_at  TEXT,
    last_error_at    TEXT,
    config           TEXT
);
CREATE TABLE IF NOT EXISTS scraped_shows_pending (
    id               TEXT PRIMARY KEY,
    source_url       TEXT NOT NULL,
    raw_payload      TEXT NOT NULL,
    status           TEXT NOT NULL,
    admin_notes      TEXT,
    confidence_score INTEGER NOT NULL,
    duplicate_of     TEXT,
    dedup_key        TEXT NOT NULL,
    start_date       TEXT NOT NULL,
    end_date         TEXT NOT NULL,
    created_at       TEXT NOT NULL,
    decided_at       TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_pending_dedup_key
    ON scraped_shows_pending (dedup_key) WHERE status = 'PENDING';
CREATE INDEX IF NOT EXISTS idx_pending_dates
    ON scraped_shows_pending (start_date, end_date);
CREATE TABLE IF NOT EXISTS shows (
    id          TEXT PRIMARY KEY,
    pending_id  TEXT NOT NULL UNIQUE,
    payload     TEXT NOT NULL,
    start_date  TEXT NOT NULL,
    end_date    TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS feedback_records (
    id                TEXT PRIMARY KEY,
    source_url        TEXT NOT NULL,
    pending_id        TEXT NOT NULL,
    action            TEXT NOT NULL,
    field_corrections TEXT NOT NULL,
    confidence_score  INTEGER NOT NULL,
    created_at        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_feedback_created ON feedback_records (created_at);
"#;

const PENDING_COLUMNS: &str = "id, source_url, raw_payload, status, admin_notes, confidence_score, \
     duplicate_of, dedup_key, created_at, decided_at";

/// SQLite-backed storage. One connection guarded by a mutex; every statement is
/// short and row-scoped.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn day(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

fn parse_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| ScraperError::CorruptRow(format!("bad timestamp '{}': {}", s, e)))
    })
    .transpose()
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| ScraperError::CorruptRow(format!("bad uuid '{}': {}", raw, e)))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

/// Column values as stored, converted to domain types outside the row callback.
struct PendingRow {
    id: String,
    source_url: String,
    raw_payload: String,
    status: String,
    admin_notes: Option<String>,
    confidence_score: i64,
    duplicate_of: Option<String>,
    dedup_key: String,
    created_at: String,
    decided_at: Option<String>,
}

impl PendingRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source_url: row.get(1)?,
            raw_payload: row.get(2)?,
            status: row.get(3)?,
            admin_notes: row.get(4)?,
            confidence_score: row.get(5)?,
            duplicate_of: row.get(6)?,
            dedup_key: row.get(7)?,
            created_at: row.get(8)?,
            decided_at: row.get(9)?,
        })
    }

    fn into_domain(self) -> Result<PendingShow> {
        Ok(PendingShow {
            id: parse_uuid(&self.id)?,
            source_url: self.source_url,
            raw_payload: serde_json::from_str(&self.raw_payload)?,
            status: self.status.parse().map_err(ScraperError::CorruptRow)?,
            confidence_score: self.confidence_score.clamp(0, 100) as u8,
            admin_notes: self.admin_notes,
            duplicate_of: self.duplicate_of.as_deref().map(parse_uuid).transpose()?,
            dedup_key: self.dedup_key,
            created_at: parse_ts(Some(self.created_at))?
                .ok_or_else(|| ScraperError::CorruptRow("missing created_at".to_string()))?,
            decided_at: parse_ts(self.decided_at)?,
        })
    }
}

fn query_pending(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<PendingShow>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, PendingRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(PendingRow::into_domain).collect()
}

type SourceColumns = (String, bool, f64, i64, Option<String>, Option<String>, Option<String>);

fn source_from_row(row: &Row<'_>) -> rusqlite::Result<SourceColumns> {
    Ok((
        row.get(0)?,
        row.get::<_, i64>(1)? != 0,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn source_into_domain(cols: SourceColumns) -> Result<ScrapingSource> {
    let (url, enabled, priority_score, error_streak, last_success_at, last_error_at, config) = cols;
    Ok(ScrapingSource {
        url,
        enabled,
        priority_score,
        error_streak: error_streak.max(0) as u32,
        last_success_at: parse_ts(last_success_at)?,
        last_error_at: parse_ts(last_error_at)?,
        config: match config {
            Some(raw) => serde_json::from_str(&raw)?,
            None => serde_json::Value::Null,
        },
    })
}

fn config_column(config: &serde_json::Value) -> Result<Option<String>> {
    match config {
        serde_json::Value::Null => Ok(None),
        other => Ok(Some(serde_json::to_string(other)?)),
    }
}

/// `(enabled, error_streak)` of a source, or `NotFound`.
fn source_health(tx: &rusqlite::Transaction<'_>, url: &str) -> Result<(bool, i64)> {
    tx.query_row(
        "SELECT enabled, error_streak FROM scraping_sources WHERE url = ?1",
        params![url],
        |row| Ok((row.get::<_, i64>(0)? != 0, row.get(1)?)),
    )
    .optional()?
    .ok_or_else(|| ScraperError::NotFound(format!("source {}", url)))
}

fn require_source_changed(changed: usize, url: &str) -> Result<()> {
    if changed == 0 {
        return Err(ScraperError::NotFound(format!("source {}", url)));
    }
    Ok(())
}

/// Shared by approve/reject: flip a PENDING row to its terminal status or explain why not.
fn transition_pending(
    tx: &rusqlite::Transaction<'_>,
    pending_id: Uuid,
    status: ShowStatus,
    admin_notes: Option<&str>,
    decided_at: DateTime<Utc>,
) -> Result<()> {
    let changed = tx.execute(
        "UPDATE scraped_shows_pending
         SET status = ?1, decided_at = ?2, admin_notes = COALESCE(?3, admin_notes)
         WHERE id = ?4 AND status = 'PENDING'",
        params![status.as_str(), ts(decided_at), admin_notes, pending_id.to_string()],
    )?;
    if changed == 1 {
        return Ok(());
    }
    let current: Option<String> = tx
        .query_row(
            "SELECT status FROM scraped_shows_pending WHERE id = ?1",
            params![pending_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    match current {
        Some(status) => Err(ScraperError::DecisionConflict {
            id: pending_id,
            status,
        }),
        None => Err(ScraperError::NotFound(format!("pending show {}", pending_id))),
    }
}

fn insert_feedback(tx: &rusqlite::Transaction<'_>, feedback: &FeedbackRecord) -> Result<()> {
    tx.execute(
        "INSERT INTO feedback_records
         (id, source_url, pending_id, action, field_corrections, confidence_score, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            feedback.id.to_string(),
            feedback.source_url,
            feedback.pending_id.to_string(),
            feedback.action.as_str(),
            serde_json::to_string(&feedback.field_corrections)?,
            feedback.confidence_score as i64,
            ts(feedback.created_at),
        ],
    )?;
    Ok(())
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn upsert_source(&self, source: &ScrapingSource) -> Result<()> {
        let config = config_column(&source.config)?;
        self.conn().execute(
            "INSERT INTO scraping_sources
             (url, enabled, priority_score, error_streak, last_success_at, last_error_at, config)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(url) DO UPDATE SET
                enabled=excluded.enabled,
                priority_score=excluded.priority_score,
                error_streak=excluded.error_streak,
                last_success_at=excluded.last_success_at,
                last_error_at=excluded.last_error_at,
                config=excluded.config",
            params![
                source.url,
                source.enabled as i64,
                source.priority_score,
                source.error_streak as i64,
                source.last_success_at.map(ts),
                source.last_error_at.map(ts),
                config,
            ],
        )?;
        Ok(())
    }

    async fn get_source(&self, url: &str) -> Result<Option<ScrapingSource>> {
        let cols = self
            .conn()
            .query_row(
                "SELECT url, enabled, priority_score, error_streak, last_success_at, last_error_at, config
                 FROM scraping_sources WHERE url = ?1",
                params![url],
                source_from_row,
            )
            .optional()?;
        cols.map(source_into_domain).transpose()
    }

    async fn list_sources(&self) -> Result<Vec<ScrapingSource>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT url, enabled, priority_score, error_streak, last_success_at, last_error_at, config
             FROM scraping_sources ORDER BY url",
        )?;
        let rows = stmt
            .query_map([], source_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(source_into_domain).collect()
    }

    async fn import_source(&self, seed: &SourceSeed) -> Result<bool> {
        let source = seed.to_source();
        let config = config_column(&source.config)?;
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let exists = tx
            .query_row(
                "SELECT 1 FROM scraping_sources WHERE url = ?1",
                params![source.url],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            tx.execute(
                "UPDATE scraping_sources
                 SET enabled = ?1,
                     priority_score = COALESCE(?2, priority_score),
                     config = COALESCE(?3, config)
                 WHERE url = ?4",
                params![source.enabled as i64, seed.priority_score, config, source.url],
            )?;
        } else {
            tx.execute(
                "INSERT INTO scraping_sources (url, enabled, priority_score, error_streak, config)
                 VALUES (?1, ?2, ?3, 0, ?4)",
                params![source.url, source.enabled as i64, source.priority_score, config],
            )?;
        }
        tx.commit()?;
        Ok(!exists)
    }

    async fn set_source_enabled(&self, url: &str, enabled: bool) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE scraping_sources
             SET enabled = ?1, error_streak = CASE WHEN ?1 = 1 THEN 0 ELSE error_streak END
             WHERE url = ?2",
            params![enabled as i64, url],
        )?;
        require_source_changed(changed, url)
    }

    async fn set_source_priority(&self, url: &str, priority_score: f64) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE scraping_sources SET priority_score = ?1 WHERE url = ?2",
            params![priority_score, url],
        )?;
        require_source_changed(changed, url)
    }

    async fn record_source_success(
        &self,
        url: &str,
        at: DateTime<Utc>,
        reenable_at_streak: u32,
    ) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let (enabled, streak) = source_health(&tx, url)?;
        let reenable = !enabled && streak >= reenable_at_streak as i64;
        tx.execute(
            "UPDATE scraping_sources
             SET error_streak = 0, last_success_at = ?1, enabled = CASE WHEN ?2 THEN 1 ELSE enabled END
             WHERE url = ?3",
            params![ts(at), reenable, url],
        )?;
        tx.commit()?;
        Ok(reenable)
    }

    async fn record_source_failure(
        &self,
        url: &str,
        at: DateTime<Utc>,
        disable_at_streak: u32,
    ) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let (enabled, streak) = source_health(&tx, url)?;
        let disable = enabled && streak + 1 >= disable_at_streak as i64;
        tx.execute(
            "UPDATE scraping_sources
             SET error_streak = error_streak + 1, last_error_at = ?1,
                 enabled = CASE WHEN ?2 THEN 0 ELSE enabled END
             WHERE url = ?3",
            params![ts(at), disable, url],
        )?;
        tx.commit()?;
        Ok(disable)
    }

    async fn insert_pending(&self, show: &PendingShow) -> Result<()> {
        let conn = self.conn();
        let res = conn.execute(
            "INSERT INTO scraped_shows_pending
             (id, source_url, raw_payload, status, admin_notes, confidence_score, duplicate_of,
              dedup_key, start_date, end_date, created_at, decided_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                show.id.to_string(),
                show.source_url,
                serde_json::to_string(&show.raw_payload)?,
                show.status.as_str(),
                show.admin_notes,
                show.confidence_score as i64,
                show.duplicate_of.map(|id| id.to_string()),
                show.dedup_key,
                day(show.raw_payload.start_date),
                day(show.raw_payload.end_date),
                ts(show.created_at),
                show.decided_at.map(ts),
            ],
        );
        match res {
            Ok(_) => {
                debug!("Created pending show: {} with id {}", show.raw_payload.name, show.id);
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => {
                let existing: Option<String> = conn
                    .query_row(
                        "SELECT id FROM scraped_shows_pending WHERE dedup_key = ?1 AND status = 'PENDING'",
                        params![show.dedup_key],
                        |row| row.get(0),
                    )
                    .optional()?;
                match existing {
                    Some(id) => Err(ScraperError::StoreConflict {
                        existing_id: parse_uuid(&id)?,
                    }),
                    None => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_pending(&self, id: Uuid) -> Result<Option<PendingShow>> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM scraped_shows_pending WHERE id = ?1", PENDING_COLUMNS);
        Ok(query_pending(&conn, &sql, params![id.to_string()])?.into_iter().next())
    }

    async fn pending_in_window(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<PendingShow>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM scraped_shows_pending
             WHERE start_date <= ?1 AND end_date >= ?2 ORDER BY created_at",
            PENDING_COLUMNS
        );
        query_pending(&conn, &sql, params![day(to), day(from)])
    }

    async fn list_pending(&self, status: Option<ShowStatus>) -> Result<Vec<PendingShow>> {
        let conn = self.conn();
        match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {} FROM scraped_shows_pending WHERE status = ?1 ORDER BY created_at",
                    PENDING_COLUMNS
                );
                query_pending(&conn, &sql, params![status.as_str()])
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM scraped_shows_pending ORDER BY created_at",
                    PENDING_COLUMNS
                );
                query_pending(&conn, &sql, params![])
            }
        }
    }

    async fn update_pending_payload(
        &self,
        id: Uuid,
        payload: &NormalizedShow,
        confidence_score: u8,
    ) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE scraped_shows_pending
             SET raw_payload = ?1, confidence_score = ?2, start_date = ?3, end_date = ?4
             WHERE id = ?5 AND status = 'PENDING'",
            params![
                serde_json::to_string(payload)?,
                confidence_score as i64,
                day(payload.start_date),
                day(payload.end_date),
                id.to_string(),
            ],
        )?;
        if changed == 1 {
            return Ok(true);
        }
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM scraped_shows_pending WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match exists {
            Some(_) => Ok(false),
            None => Err(ScraperError::NotFound(format!("pending show {}", id))),
        }
    }

    async fn link_duplicate(&self, id: Uuid, duplicate_of: Uuid) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE scraped_shows_pending SET duplicate_of = ?1 WHERE id = ?2",
            params![duplicate_of.to_string(), id.to_string()],
        )?;
        if changed == 0 {
            return Err(ScraperError::NotFound(format!("pending show {}", id)));
        }
        Ok(())
    }

    async fn get_show(&self, id: Uuid) -> Result<Option<CanonicalShow>> {
        let payload: Option<String> = self
            .conn()
            .query_row(
                "SELECT payload FROM shows WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(payload.map(|p| serde_json::from_str(&p)).transpose()?)
    }

    async fn shows_in_window(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<CanonicalShow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT payload FROM shows WHERE start_date <= ?1 AND end_date >= ?2 ORDER BY created_at",
        )?;
        let payloads = stmt
            .query_map(params![day(to), day(from)], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        payloads
            .iter()
            .map(|p| serde_json::from_str(p).map_err(ScraperError::from))
            .collect()
    }

    async fn commit_approval(
        &self,
        pending_id: Uuid,
        show: &CanonicalShow,
        feedback: &FeedbackRecord,
        admin_notes: Option<&str>,
        decided_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        transition_pending(&tx, pending_id, ShowStatus::Approved, admin_notes, decided_at)?;
        tx.execute(
            "INSERT INTO shows (id, pending_id, payload, start_date, end_date, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                show.id.to_string(),
                pending_id.to_string(),
                serde_json::to_string(show)?,
                day(show.start_date),
                day(show.end_date),
                ts(show.created_at),
            ],
        )?;
        insert_feedback(&tx, feedback)?;
        tx.commit()?;
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
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        transition_pending(&tx, pending_id, ShowStatus::Rejected, admin_notes, decided_at)?;
        insert_feedback(&tx, feedback)?;
        tx.commit()?;
        debug!("Rejected pending show {}", pending_id);
        Ok(())
    }

    async fn feedback_since(&self, since: DateTime<Utc>) -> Result<Vec<FeedbackRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, source_url, pending_id, action, field_corrections, confidence_score, created_at
             FROM feedback_records WHERE created_at >= ?1 ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![ts(since)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, source_url, pending_id, action, corrections, confidence, created_at)| {
                Ok(FeedbackRecord {
                    id: parse_uuid(&id)?,
                    source_url,
                    pending_id: parse_uuid(&pending_id)?,
                    action: action.parse().map_err(ScraperError::CorruptRow)?,
                    field_corrections: serde_json::from_str(&corrections)?,
                    confidence_score: confidence.clamp(0, 100) as u8,
                    created_at: parse_ts(Some(created_at))?
                        .ok_or_else(|| ScraperError::CorruptRow("missing created_at".to_string()))?,
                })
            })
            .collect()
    }
}
