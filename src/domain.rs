//! Domain data shapes shared across the pipeline, storage and review layers.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A configured web page scraped for card show listings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrapingSource {
    pub url: String,
    pub enabled: bool,
    pub priority_score: f64,
    pub error_streak: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    /// Free-form per-source settings carried through from the seed file
    #[serde(default)]
    pub config: serde_json::Value,
}

impl ScrapingSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            enabled: true,
            priority_score: 50.0,
            error_streak: 0,
            last_success_at: None,
            last_error_at: None,
            config: serde_json::Value::Null,
        }
    }
}

/// One entry of a seed file. Importing it never touches runtime counters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceSeed {
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority_score: Option<f64>,
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_enabled() -> bool {
    true
}

impl SourceSeed {
    /// The row a first import creates.
    pub fn to_source(&self) -> ScrapingSource {
        let mut source = ScrapingSource::new(self.url.clone());
        source.enabled = self.enabled;
        if let Some(priority) = self.priority_score {
            source.priority_score = priority;
        }
        source.config = self.config.clone();
        source
    }
}

/// Candidate fields as the extractor returns them. Everything is optional and
/// loosely typed; the normalizer is the schema boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CandidateFields {
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(default, alias = "start_date", alias = "date", deserialize_with = "lenient_string")]
    pub start_date: Option<String>,
    #[serde(default, alias = "end_date", deserialize_with = "lenient_string")]
    pub end_date: Option<String>,
    #[serde(default, alias = "venue_name", alias = "venue", deserialize_with = "lenient_string")]
    pub venue_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub address: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub city: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub state: Option<String>,
    #[serde(default, alias = "entry_fee", alias = "fee", deserialize_with = "lenient_string")]
    pub entry_fee: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub url: Option<String>,
    #[serde(default, alias = "contact_info", alias = "contact", deserialize_with = "lenient_string")]
    pub contact_info: Option<String>,
}

/// Accept strings, numbers and booleans; treat null and blank strings as absent.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(serde_json::Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

/// One extracted, not yet validated show record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCandidate {
    pub source_url: String,
    pub chunk_index: usize,
    pub fields: CandidateFields,
    pub extracted_at: DateTime<Utc>,
}

/// A candidate after normalization: name and dates are guaranteed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedShow {
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub venue_name: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub entry_fee: Option<f64>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub contact_info: Option<String>,
}

impl NormalizedShow {
    pub fn new(name: impl Into<String>, start_date: NaiveDate) -> Self {
        Self {
            name: name.into(),
            start_date,
            end_date: start_date,
            venue_name: None,
            address: None,
            city: None,
            state: None,
            entry_fee: None,
            description: None,
            url: None,
            contact_info: None,
        }
    }

    /// Field name / display value pairs, used for correction diffs.
    pub fn field_values(&self) -> Vec<(&'static str, Option<String>)> {
        vec![
            ("name", Some(self.name.clone())),
            ("start_date", Some(self.start_date.to_string())),
            ("end_date", Some(self.end_date.to_string())),
            ("venue_name", self.venue_name.clone()),
            ("address", self.address.clone()),
            ("city", self.city.clone()),
            ("state", self.state.clone()),
            ("entry_fee", self.entry_fee.map(|f| format!("{:.2}", f))),
            ("description", self.description.clone()),
            ("url", self.url.clone()),
            ("contact_info", self.contact_info.clone()),
        ]
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShowStatus {
    Pending,
    Approved,
    Rejected,
}

impl ShowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShowStatus::Pending => "PENDING",
            ShowStatus::Approved => "APPROVED",
            ShowStatus::Rejected => "REJECTED",
        }
    }

    pub fn is_decided(&self) -> bool {
        !matches!(self, ShowStatus::Pending)
    }
}

impl fmt::Display for ShowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(ShowStatus::Pending),
            "APPROVED" => Ok(ShowStatus::Approved),
            "REJECTED" => Ok(ShowStatus::Rejected),
            other => Err(format!("unknown show status '{}'", other)),
        }
    }
}

/// A review-queue row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingShow {
    pub id: Uuid,
    pub source_url: String,
    pub raw_payload: NormalizedShow,
    pub status: ShowStatus,
    pub confidence_score: u8,
    pub admin_notes: Option<String>,
    pub duplicate_of: Option<Uuid>,
    /// Exact-match key backing the store's uniqueness check
    pub dedup_key: String,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CanonicalStatus {
    Active,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// The approved, queryable event record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanonicalShow {
    pub id: Uuid,
    pub pending_id: Uuid,
    pub source_url: String,
    pub title: String,
    pub location: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub entry_fee: Option<f64>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub contact_info: Option<String>,
    pub status: CanonicalStatus,
    pub organizer_id: Option<Uuid>,
    pub features: Vec<String>,
    pub categories: Vec<String>,
    pub coordinates: Option<Coordinates>,
    pub created_at: DateTime<Utc>,
}

impl CanonicalShow {
    pub fn from_approved(pending: &PendingShow, show: &NormalizedShow, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pending_id: pending.id,
            source_url: pending.source_url.clone(),
            title: show.name.clone(),
            location: show.venue_name.clone(),
            address: show.address.clone(),
            city: show.city.clone(),
            state: show.state.clone(),
            start_date: show.start_date,
            end_date: show.end_date,
            entry_fee: show.entry_fee,
            description: show.description.clone(),
            url: show.url.clone(),
            contact_info: show.contact_info.clone(),
            status: CanonicalStatus::Active,
            organizer_id: None,
            features: Vec::new(),
            categories: vec!["card_show".to_string()],
            coordinates: None,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackAction {
    Approved,
    ApprovedWithEdits,
    Rejected,
}

impl FeedbackAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackAction::Approved => "approved",
            FeedbackAction::ApprovedWithEdits => "approved_with_edits",
            FeedbackAction::Rejected => "rejected",
        }
    }
}

impl FromStr for FeedbackAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(FeedbackAction::Approved),
            "approved_with_edits" => Ok(FeedbackAction::ApprovedWithEdits),
            "rejected" => Ok(FeedbackAction::Rejected),
            other => Err(format!("unknown feedback action '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldCorrection {
    pub from: Option<String>,
    pub to: Option<String>,
}

/// Append-only record of one human decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackRecord {
    pub id: Uuid,
    pub source_url: String,
    pub pending_id: Uuid,
    pub action: FeedbackAction,
    pub field_corrections: BTreeMap<String, FieldCorrection>,
    pub confidence_score: u8,
    pub created_at: DateTime<Utc>,
}

/// Admin edits applied on approval. Only `Some` fields are changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ShowEdits {
    pub name: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub venue_name: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub entry_fee: Option<f64>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub contact_info: Option<String>,
}

impl ShowEdits {
    pub fn apply(&self, show: &NormalizedShow) -> NormalizedShow {
        let mut edited = show.clone();
        if let Some(name) = &self.name {
            edited.name = name.clone();
        }
        if let Some(start) = self.start_date {
            edited.start_date = start;
            if edited.end_date < start {
                edited.end_date = start;
            }
        }
        if let Some(end) = self.end_date {
            edited.end_date = end;
        }
        override_field(&mut edited.venue_name, &self.venue_name);
        override_field(&mut edited.address, &self.address);
        override_field(&mut edited.city, &self.city);
        override_field(&mut edited.state, &self.state);
        if self.entry_fee.is_some() {
            edited.entry_fee = self.entry_fee;
        }
        override_field(&mut edited.description, &self.description);
        override_field(&mut edited.url, &self.url);
        override_field(&mut edited.contact_info, &self.contact_info);
        edited
    }
}

fn override_field(target: &mut Option<String>, edit: &Option<String>) {
    if let Some(value) = edit {
        *target = Some(value.clone());
    }
}

/// Per-field `{from, to}` diff between the extracted and the approved record.
pub fn field_diff(before: &NormalizedShow, after: &NormalizedShow) -> BTreeMap<String, FieldCorrection> {
    before
        .field_values()
        .into_iter()
        .zip(after.field_values())
        .filter(|((_, from), (_, to))| from != to)
        .map(|((field, from), (_, to))| (field.to_string(), FieldCorrection { from, to }))
        .collect()
}
