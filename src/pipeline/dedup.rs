//! Duplicate detection for normalized candidates.
//!
//! Two records describe the same show when their normalized names are equal,
//! their date ranges come within the configured window of each other, and
//! their location agrees (venue or address within a small edit distance, or
//! identical city and state).

use crate::config::DedupConfig;
use crate::domain::{NormalizedShow, PendingShow, ShowStatus};
use crate::error::{Result, ScraperError};
use crate::pipeline::scoring;
use crate::storage::Storage;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sha2::{Digest, Sha256};
use strsim::levenshtein;
use tracing::{debug, info};
use uuid::Uuid;

/// Comparable projection of a show used by `similar`.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchKey {
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub venue: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
}

/// Lowercase, punctuation stripped, whitespace collapsed.
pub fn normalize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { ' ' })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalize_location(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(normalize_name)
        .filter(|v| !v.is_empty())
}

pub fn match_key(show: &NormalizedShow) -> MatchKey {
    MatchKey {
        name: normalize_name(&show.name),
        start_date: show.start_date,
        end_date: show.end_date,
        venue: normalize_location(&show.venue_name),
        address: normalize_location(&show.address),
        city: normalize_location(&show.city),
        state: normalize_location(&show.state),
    }
}

pub fn similar(a: &MatchKey, b: &MatchKey, config: &DedupConfig) -> bool {
    a.name == b.name && dates_near(a, b, config.window_days) && location_matches(a, b, config.max_edit_distance)
}

fn dates_near(a: &MatchKey, b: &MatchKey, window_days: i64) -> bool {
    let window = Duration::days(window_days.max(0));
    a.start_date <= b.end_date + window && b.start_date <= a.end_date + window
}

/// City and state must agree wherever both sides carry them. Venue or address
/// closeness only stands in when city/state is missing on a side.
fn location_matches(a: &MatchKey, b: &MatchKey, max_distance: usize) -> bool {
    let differs = |x: &Option<String>, y: &Option<String>| matches!((x, y), (Some(x), Some(y)) if x != y);
    if differs(&a.city, &b.city) || differs(&a.state, &b.state) {
        return false;
    }
    let both_located = a.city.is_some() && a.state.is_some() && b.city.is_some() && b.state.is_some();
    if both_located {
        return true;
    }

    let close = |x: &Option<String>, y: &Option<String>| match (x, y) {
        (Some(x), Some(y)) => levenshtein(x, y) <= max_distance,
        _ => false,
    };
    close(&a.venue, &b.venue) || close(&a.address, &b.address)
}

/// Exact key backing the store's uniqueness check among PENDING rows.
pub fn dedup_key(show: &NormalizedShow) -> String {
    let key = match_key(show);
    let material = format!(
        "{}|{}|{}|{}",
        key.name,
        key.city.unwrap_or_default(),
        key.state.unwrap_or_default(),
        key.start_date
    );
    hex::encode(Sha256::digest(material.as_bytes()))
}

/// Fill fields missing on `existing` from `incoming`. Filled fields are
/// never overwritten; a fee of 0.0 counts as filled.
pub fn fill_missing(existing: &NormalizedShow, incoming: &NormalizedShow) -> (NormalizedShow, Vec<&'static str>) {
    let mut merged = existing.clone();
    let mut filled = Vec::new();

    let mut fill = |field: &'static str, target: &mut Option<String>, source: &Option<String>| {
        let empty = target.as_deref().map_or(true, |v| v.trim().is_empty());
        if empty && source.is_some() {
            *target = source.clone();
            filled.push(field);
        }
    };
    fill("venue_name", &mut merged.venue_name, &incoming.venue_name);
    fill("address", &mut merged.address, &incoming.address);
    fill("city", &mut merged.city, &incoming.city);
    fill("state", &mut merged.state, &incoming.state);
    fill("description", &mut merged.description, &incoming.description);
    fill("url", &mut merged.url, &incoming.url);
    fill("contact_info", &mut merged.contact_info, &incoming.contact_info);

    if merged.entry_fee.is_none() && incoming.entry_fee.is_some() {
        merged.entry_fee = incoming.entry_fee;
        filled.push("entry_fee");
    }

    (merged, filled)
}

/// What happened to one candidate at commit time.
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateOutcome {
    /// New PENDING row
    Inserted { id: Uuid },
    /// Folded into an existing PENDING row, which it is a duplicate of
    Merged { duplicate_of: Uuid, filled: Vec<&'static str> },
    /// Matches a row a human already decided; nothing written
    DuplicateOfDecided { duplicate_of: Uuid, status: ShowStatus },
    /// Matches an approved canonical show; nothing written
    DuplicateOfCanonical { duplicate_of: Uuid },
}

impl CandidateOutcome {
    pub fn is_duplicate(&self) -> bool {
        !matches!(self, CandidateOutcome::Inserted { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Deduplicator {
    config: DedupConfig,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Match a candidate against stored rows and either merge it or insert it
    /// as a new PENDING row. Callers run this sequentially in commit order.
    pub async fn commit_candidate(
        &self,
        storage: &dyn Storage,
        source_url: &str,
        show: NormalizedShow,
        confidence_score: u8,
        now: DateTime<Utc>,
    ) -> Result<CandidateOutcome> {
        let key = match_key(&show);
        let window = Duration::days(self.config.window_days.max(0));
        let from = show.start_date - window;
        let to = show.end_date + window;

        // Rows come back oldest first, so the first hit is the earliest match
        let existing = storage
            .pending_in_window(from, to)
            .await?
            .into_iter()
            .filter(|row| row.duplicate_of.is_none())
            .find(|row| similar(&key, &match_key(&row.raw_payload), &self.config));
        if let Some(row) = existing {
            return self.merge_into(storage, &row, &show).await;
        }

        if let Some(canonical) = storage
            .shows_in_window(from, to)
            .await?
            .into_iter()
            .find(|s| similar(&key, &canonical_key(s), &self.config))
        {
            debug!("Candidate '{}' already approved as show {}", show.name, canonical.id);
            return Ok(CandidateOutcome::DuplicateOfCanonical {
                duplicate_of: canonical.id,
            });
        }

        let row = PendingShow {
            id: Uuid::new_v4(),
            source_url: source_url.to_string(),
            dedup_key: dedup_key(&show),
            raw_payload: show,
            status: ShowStatus::Pending,
            confidence_score,
            admin_notes: None,
            duplicate_of: None,
            created_at: now,
            decided_at: None,
        };

        match storage.insert_pending(&row).await {
            Ok(()) => Ok(CandidateOutcome::Inserted { id: row.id }),
            // Another writer got there first: already pending, merge instead
            Err(ScraperError::StoreConflict { existing_id }) => {
                info!("Store conflict on insert, merging into pending show {}", existing_id);
                let existing = storage
                    .get_pending(existing_id)
                    .await?
                    .ok_or_else(|| ScraperError::NotFound(format!("pending show {}", existing_id)))?;
                self.merge_into(storage, &existing, &row.raw_payload).await
            }
            Err(e) => Err(e),
        }
    }

    async fn merge_into(
        &self,
        storage: &dyn Storage,
        existing: &PendingShow,
        incoming: &NormalizedShow,
    ) -> Result<CandidateOutcome> {
        if existing.status.is_decided() {
            debug!(
                "Candidate '{}' matches {} row {}",
                incoming.name, existing.status, existing.id
            );
            return Ok(CandidateOutcome::DuplicateOfDecided {
                duplicate_of: existing.id,
                status: existing.status,
            });
        }

        let (merged, filled) = fill_missing(&existing.raw_payload, incoming);
        if !filled.is_empty() {
            let updated = storage
                .update_pending_payload(existing.id, &merged, scoring::score(&merged))
                .await?;
            if !updated {
                // Decided between our read and our write; leave it alone
                let status = storage
                    .get_pending(existing.id)
                    .await?
                    .map_or(ShowStatus::Approved, |row| row.status);
                return Ok(CandidateOutcome::DuplicateOfDecided {
                    duplicate_of: existing.id,
                    status,
                });
            }
        }

        info!(
            "Merged duplicate '{}' into pending show {} (filled: {:?})",
            incoming.name, existing.id, filled
        );
        Ok(CandidateOutcome::Merged {
            duplicate_of: existing.id,
            filled,
        })
    }

    /// Link PENDING rows that match an earlier PENDING row but got past the
    /// exact-key check. Returns `(duplicate, original)` pairs.
    pub async fn sweep_pending(&self, storage: &dyn Storage) -> Result<Vec<(Uuid, Uuid)>> {
        let rows = storage.list_pending(Some(ShowStatus::Pending)).await?;
        let mut roots: Vec<(Uuid, MatchKey)> = Vec::new();
        let mut links = Vec::new();

        for row in rows.iter().filter(|r| r.duplicate_of.is_none()) {
            let key = match_key(&row.raw_payload);
            match roots.iter().find(|(_, root)| similar(root, &key, &self.config)) {
                Some((root_id, _)) => {
                    storage.link_duplicate(row.id, *root_id).await?;
                    info!("Linked pending show {} as duplicate of {}", row.id, root_id);
                    links.push((row.id, *root_id));
                }
                None => roots.push((row.id, key)),
            }
        }

        Ok(links)
    }
}

fn canonical_key(show: &crate::domain::CanonicalShow) -> MatchKey {
    MatchKey {
        name: normalize_name(&show.title),
        start_date: show.start_date,
        end_date: show.end_date,
        venue: normalize_location(&show.location),
        address: normalize_location(&show.address),
        city: normalize_location(&show.city),
        state: normalize_location(&show.state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CanonicalShow, FeedbackAction, FeedbackRecord};
    use crate::storage::InMemoryStorage;
    use std::collections::BTreeMap;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn expo(date: NaiveDate, venue: &str) -> NormalizedShow {
        let mut show = NormalizedShow::new("Sports Card Expo", date);
        show.venue_name = Some(venue.to_string());
        show.city = Some("Philadelphia".to_string());
        show.state = Some("PA".to_string());
        show
    }

    fn config() -> DedupConfig {
        DedupConfig::default()
    }

    #[test]
    fn test_name_normalization() {
        assert_eq!(normalize_name("  Sports-Card EXPO!! "), "sports card expo");
        assert_eq!(normalize_name("Monthly Card Show, Indy"), "monthly card show indy");
    }

    #[test]
    fn test_philadelphia_pair_is_similar() {
        let a = match_key(&expo(d(2025, 8, 15), "Liberty Convention Center"));
        let b = match_key(&expo(d(2025, 8, 16), "Liberty Convention Hall"));
        assert!(similar(&a, &b, &config()));
    }

    #[test]
    fn test_venue_typo_matches_without_city() {
        let mut a = NormalizedShow::new("Card Show", d(2025, 8, 15));
        a.venue_name = Some("Elks Lodge 12".to_string());
        let mut b = a.clone();
        b.venue_name = Some("Elk Lodge 12".to_string());
        assert!(similar(&match_key(&a), &match_key(&b), &config()));
    }

    #[test]
    fn test_same_venue_name_in_different_cities_is_not_similar() {
        let located = |city: &str| {
            let mut show = NormalizedShow::new("Monthly Card Show", d(2025, 8, 15));
            show.venue_name = Some("Elks Lodge".to_string());
            show.city = Some(city.to_string());
            show.state = Some("OH".to_string());
            show
        };
        let dayton = match_key(&located("Dayton"));
        let columbus = match_key(&located("Columbus"));
        assert!(!similar(&dayton, &columbus, &config()));

        // City known on one side only: the venue decides
        let mut unlocated = located("Dayton");
        unlocated.city = None;
        unlocated.state = None;
        assert!(similar(&dayton, &match_key(&unlocated), &config()));
    }

    #[test]
    fn test_different_name_or_distant_date_is_not_similar() {
        let a = match_key(&expo(d(2025, 8, 15), "Liberty Convention Center"));
        let mut other_name = expo(d(2025, 8, 15), "Liberty Convention Center");
        other_name.name = "Coin Expo".to_string();
        assert!(!similar(&a, &match_key(&other_name), &config()));

        let far = match_key(&expo(d(2025, 8, 25), "Liberty Convention Center"));
        assert!(!similar(&a, &far, &config()));
    }

    #[test]
    fn test_different_city_is_not_similar() {
        let a = match_key(&expo(d(2025, 8, 15), "Convention Center"));
        let mut b = expo(d(2025, 8, 15), "Expo Hall North");
        b.city = Some("Pittsburgh".to_string());
        assert!(!similar(&a, &match_key(&b), &config()));
    }

    #[test]
    fn test_dedup_key_ignores_case_and_punctuation() {
        let a = expo(d(2025, 8, 15), "x");
        let mut b = a.clone();
        b.name = "sports card expo!".to_string();
        b.city = Some("PHILADELPHIA".to_string());
        assert_eq!(dedup_key(&a), dedup_key(&b));
        assert_eq!(dedup_key(&a).len(), 64);
    }

    #[test]
    fn test_fill_missing_never_overwrites() {
        let mut existing = expo(d(2025, 8, 15), "Liberty Convention Center");
        existing.entry_fee = Some(0.0);
        let mut incoming = expo(d(2025, 8, 16), "Liberty Convention Hall");
        incoming.entry_fee = Some(10.0);
        incoming.address = Some("1 Market St".to_string());

        let (merged, filled) = fill_missing(&existing, &incoming);
        assert_eq!(merged.venue_name.as_deref(), Some("Liberty Convention Center"));
        assert_eq!(merged.entry_fee, Some(0.0));
        assert_eq!(merged.address.as_deref(), Some("1 Market St"));
        assert_eq!(merged.start_date, d(2025, 8, 15));
        assert_eq!(filled, vec!["address"]);
    }

    #[tokio::test]
    async fn test_second_source_merges_into_first() {
        let storage = InMemoryStorage::new();
        let dedup = Deduplicator::new(config());
        let now = Utc::now();

        let first = dedup
            .commit_candidate(&storage, "https://s1", expo(d(2025, 8, 15), "Liberty Convention Center"), 60, now)
            .await
            .unwrap();
        let first_id = match first {
            CandidateOutcome::Inserted { id } => id,
            other => panic!("expected insert, got {:?}", other),
        };

        let mut second = expo(d(2025, 8, 16), "Liberty Convention Hall");
        second.address = Some("1 Market St".to_string());
        let outcome = dedup
            .commit_candidate(&storage, "https://s2", second, 70, now + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CandidateOutcome::Merged {
                duplicate_of: first_id,
                filled: vec!["address"]
            }
        );

        let pending = storage.list_pending(Some(ShowStatus::Pending)).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].raw_payload.address.as_deref(), Some("1 Market St"));
        assert_eq!(pending[0].source_url, "https://s1");
    }

    #[tokio::test]
    async fn test_key_clash_without_location_merges_on_store_conflict() {
        let storage = InMemoryStorage::new();
        let dedup = Deduplicator::new(config());
        let now = Utc::now();

        // No location on either side, so `similar` says no, but the exact keys agree
        let bare = NormalizedShow::new("Card Show", d(2025, 8, 15));
        assert!(!similar(&match_key(&bare), &match_key(&bare), &config()));

        let first_id = match dedup
            .commit_candidate(&storage, "https://s1", bare.clone(), 30, now)
            .await
            .unwrap()
        {
            CandidateOutcome::Inserted { id } => id,
            other => panic!("expected insert, got {:?}", other),
        };

        let mut second = bare.clone();
        second.description = Some("Dealers welcome".to_string());
        let outcome = dedup
            .commit_candidate(&storage, "https://s2", second, 35, now + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CandidateOutcome::Merged {
                duplicate_of: first_id,
                filled: vec!["description"]
            }
        );

        let pending = storage.list_pending(Some(ShowStatus::Pending)).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, first_id);
        assert_eq!(pending[0].raw_payload.description.as_deref(), Some("Dealers welcome"));
    }

    #[tokio::test]
    async fn test_match_against_decided_row_writes_nothing() {
        let storage = InMemoryStorage::new();
        let dedup = Deduplicator::new(config());
        let show = expo(d(2025, 8, 15), "Liberty Convention Center");
        let id = match dedup
            .commit_candidate(&storage, "https://s1", show.clone(), 60, Utc::now())
            .await
            .unwrap()
        {
            CandidateOutcome::Inserted { id } => id,
            other => panic!("expected insert, got {:?}", other),
        };
        let feedback = FeedbackRecord {
            id: Uuid::new_v4(),
            source_url: "https://s1".to_string(),
            pending_id: id,
            action: FeedbackAction::Rejected,
            field_corrections: BTreeMap::new(),
            confidence_score: 60,
            created_at: Utc::now(),
        };
        storage.commit_rejection(id, &feedback, None, Utc::now()).await.unwrap();

        let mut again = show.clone();
        again.address = Some("1 Market St".to_string());
        let outcome = dedup
            .commit_candidate(&storage, "https://s1", again, 60, Utc::now())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CandidateOutcome::DuplicateOfDecided {
                duplicate_of: id,
                status: ShowStatus::Rejected
            }
        );
        let row = storage.get_pending(id).await.unwrap().unwrap();
        assert_eq!(row.raw_payload.address, None);
        assert_eq!(storage.list_pending(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_match_against_canonical_show() {
        let storage = InMemoryStorage::new();
        let dedup = Deduplicator::new(config());
        let show = expo(d(2025, 8, 15), "Liberty Convention Center");
        let pending = PendingShow {
            id: Uuid::new_v4(),
            source_url: "https://s1".to_string(),
            raw_payload: show.clone(),
            status: ShowStatus::Pending,
            confidence_score: 60,
            admin_notes: None,
            duplicate_of: None,
            dedup_key: "unrelated".to_string(),
            created_at: Utc::now(),
            decided_at: None,
        };
        storage.insert_pending(&pending).await.unwrap();
        let canonical = CanonicalShow::from_approved(&pending, &show, Utc::now());
        let feedback = FeedbackRecord {
            id: Uuid::new_v4(),
            source_url: "https://s1".to_string(),
            pending_id: pending.id,
            action: FeedbackAction::Approved,
            field_corrections: BTreeMap::new(),
            confidence_score: 60,
            created_at: Utc::now(),
        };
        storage
            .commit_approval(pending.id, &canonical, &feedback, None, Utc::now())
            .await
            .unwrap();

        // The approved pending row is found first and reported as decided
        let outcome = dedup
            .commit_candidate(&storage, "https://s2", show, 60, Utc::now())
            .await
            .unwrap();
        assert!(outcome.is_duplicate());
        assert_eq!(storage.all_shows().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_links_later_rows_to_earliest() {
        let storage = InMemoryStorage::new();
        let now = Utc::now();
        let mut ids = Vec::new();
        for (i, venue) in ["Liberty Convention Center", "Liberty Convention Hall", "Liberty Conv. Center"]
            .iter()
            .enumerate()
        {
            let show = expo(d(2025, 8, 15 + i as u32), venue);
            let row = PendingShow {
                id: Uuid::new_v4(),
                source_url: format!("https://s{}", i),
                raw_payload: show,
                status: ShowStatus::Pending,
                confidence_score: 60,
                admin_notes: None,
                duplicate_of: None,
                // Distinct keys simulate rows that raced past the uniqueness check
                dedup_key: format!("key-{}", i),
                created_at: now + Duration::seconds(i as i64),
                decided_at: None,
            };
            storage.insert_pending(&row).await.unwrap();
            ids.push(row.id);
        }

        let links = Deduplicator::new(config()).sweep_pending(&storage).await.unwrap();
        assert_eq!(links, vec![(ids[1], ids[0]), (ids[2], ids[0])]);
        let second = storage.get_pending(ids[1]).await.unwrap().unwrap();
        assert_eq!(second.duplicate_of, Some(ids[0]));
        assert_eq!(second.status, ShowStatus::Pending);
    }
}
