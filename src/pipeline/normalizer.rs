//! Candidate normalization: the schema boundary between loosely-typed
//! extraction output and the rest of the pipeline.

use crate::domain::{CandidateFields, NormalizedShow, RawCandidate};
use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::Html;
use std::collections::HashMap;
use std::fmt;

/// Why a candidate was discarded. Drops are expected outcomes, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    MissingName,
    MissingDate,
    UnparseableDate(String),
    PastDate(NaiveDate),
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::MissingName => "missing_name",
            DropReason::MissingDate => "missing_date",
            DropReason::UnparseableDate(_) => "unparseable_date",
            DropReason::PastDate(_) => "past_date",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::MissingName => write!(f, "candidate has no name"),
            DropReason::MissingDate => write!(f, "candidate has no date"),
            DropReason::UnparseableDate(raw) => write!(f, "could not parse date '{}'", raw),
            DropReason::PastDate(date) => write!(f, "start date {} is in the past", date),
        }
    }
}

static STATES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    [
        ("alabama", "AL"),
        ("alaska", "AK"),
        ("arizona", "AZ"),
        ("arkansas", "AR"),
        ("california", "CA"),
        ("colorado", "CO"),
        ("connecticut", "CT"),
        ("delaware", "DE"),
        ("district of columbia", "DC"),
        ("florida", "FL"),
        ("georgia", "GA"),
        ("hawaii", "HI"),
        ("idaho", "ID"),
        ("illinois", "IL"),
        ("indiana", "IN"),
        ("iowa", "IA"),
        ("kansas", "KS"),
        ("kentucky", "KY"),
        ("louisiana", "LA"),
        ("maine", "ME"),
        ("maryland", "MD"),
        ("massachusetts", "MA"),
        ("michigan", "MI"),
        ("minnesota", "MN"),
        ("mississippi", "MS"),
        ("missouri", "MO"),
        ("montana", "MT"),
        ("nebraska", "NE"),
        ("nevada", "NV"),
        ("new hampshire", "NH"),
        ("new jersey", "NJ"),
        ("new mexico", "NM"),
        ("new york", "NY"),
        ("north carolina", "NC"),
        ("north dakota", "ND"),
        ("ohio", "OH"),
        ("oklahoma", "OK"),
        ("oregon", "OR"),
        ("pennsylvania", "PA"),
        ("puerto rico", "PR"),
        ("rhode island", "RI"),
        ("south carolina", "SC"),
        ("south dakota", "SD"),
        ("tennessee", "TN"),
        ("texas", "TX"),
        ("utah", "UT"),
        ("vermont", "VT"),
        ("virginia", "VA"),
        ("washington", "WA"),
        ("west virginia", "WV"),
        ("wisconsin", "WI"),
        ("wyoming", "WY"),
    ]
    .into_iter()
    .collect()
});

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

// A time part may follow, e.g. "2025-08-02T10:00:00Z"
static ISO_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{4})-(\d{1,2})-(\d{1,2})(?:\b|T)").unwrap());

static NUMERIC_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,2})/(\d{1,2})(?:/(\d{4}|\d{2}))?\b").unwrap());

const MONTH_PATTERN: &str = r"(jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?)\.?";

// "Aug 2", "January 5-6, 2025", "Dec 30 - Jan 2 2026", "March 3rd through 5th"
static MONTH_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)\b{m}\s+(\d{{1,2}})(?:st|nd|rd|th)?(?:\s*(?:-|–|—|to|thru|through)\s*(?:{m}\s+)?(\d{{1,2}})(?:st|nd|rd|th)?)?(?:\s*,?\s*(\d{{4}}))?",
        m = MONTH_PATTERN
    ))
    .unwrap()
});

static FEE_AMOUNT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+(?:\.\d{1,2})?)").unwrap());

static CITY_STATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.+?),\s*([A-Za-z .]+)$").unwrap());

/// Normalize one candidate, or say why it was dropped.
pub fn normalize(candidate: &RawCandidate, today: NaiveDate) -> Result<NormalizedShow, DropReason> {
    normalize_fields(&candidate.fields, today)
}

pub fn normalize_fields(fields: &CandidateFields, today: NaiveDate) -> Result<NormalizedShow, DropReason> {
    let name = clean_text(fields.name.as_deref()).ok_or(DropReason::MissingName)?;

    let raw_date = clean_text(fields.start_date.as_deref()).ok_or(DropReason::MissingDate)?;
    let (start_date, mut end_date) =
        parse_date_range(&raw_date, today).ok_or_else(|| DropReason::UnparseableDate(raw_date.clone()))?;

    if let Some((explicit_end, _)) = clean_text(fields.end_date.as_deref())
        .and_then(|raw| parse_date_range(&raw, start_date))
    {
        if explicit_end >= start_date {
            end_date = explicit_end;
        }
    }

    if start_date < today {
        return Err(DropReason::PastDate(start_date));
    }

    let mut city = clean_text(fields.city.as_deref());
    let mut state = clean_text(fields.state.as_deref()).map(|s| normalize_state(&s));

    // "Indianapolis, IN" in the city field
    if state.is_none() {
        if let Some((c, s)) = city.as_deref().and_then(split_city_state) {
            city = Some(c);
            state = Some(s);
        }
    }

    Ok(NormalizedShow {
        name,
        start_date,
        end_date,
        venue_name: clean_text(fields.venue_name.as_deref()),
        address: clean_text(fields.address.as_deref()),
        city,
        state,
        entry_fee: fields.entry_fee.as_deref().and_then(parse_fee),
        description: clean_text(fields.description.as_deref()),
        url: clean_text(fields.url.as_deref()),
        contact_info: clean_text(fields.contact_info.as_deref()),
    })
}

/// Strip tags and entities, collapse whitespace. Blank results become `None`.
pub fn clean_text(raw: Option<&str>) -> Option<String> {
    let raw = raw?;
    let text = if raw.contains('<') || raw.contains('&') {
        strip_markup(raw)
    } else {
        raw.to_string()
    };
    let collapsed = WHITESPACE.replace_all(text.trim(), " ").to_string();
    (!collapsed.is_empty()).then_some(collapsed)
}

fn strip_markup(raw: &str) -> String {
    let fragment = Html::parse_fragment(raw);
    fragment.root_element().text().collect::<Vec<_>>().join(" ")
}

/// Map a full state name to its two-letter code. Unrecognized values pass through trimmed.
pub fn normalize_state(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('.');
    if is_state_code(trimmed) {
        return trimmed.to_ascii_uppercase();
    }
    let key = WHITESPACE.replace_all(&trimmed.to_lowercase(), " ").to_string();
    match STATES.get(key.as_str()) {
        Some(code) => code.to_string(),
        None => trimmed.to_string(),
    }
}

pub fn is_state_code(value: &str) -> bool {
    value.len() == 2 && {
        let upper = value.to_ascii_uppercase();
        STATES.values().any(|code| *code == upper)
    }
}

fn split_city_state(raw: &str) -> Option<(String, String)> {
    let caps = CITY_STATE.captures(raw)?;
    let state = normalize_state(&caps[2]);
    is_state_code(&state).then(|| (caps[1].trim().to_string(), state))
}

/// Parse an entry fee. Any mention of "free" is 0.0.
pub fn parse_fee(raw: &str) -> Option<f64> {
    let lower = raw.to_lowercase();
    if lower.contains("free") {
        return Some(0.0);
    }
    FEE_AMOUNT
        .captures(&lower)
        .and_then(|caps| caps[1].parse::<f64>().ok())
}

/// Parse a flexible date string into `(start, end)`. Dates without a year fall
/// in `reference`'s year, or the next one if that day has already passed.
pub fn parse_date_range(raw: &str, reference: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
    let text = raw.trim();

    let iso: Vec<NaiveDate> = ISO_DATE
        .captures_iter(text)
        .filter_map(|c| ymd(c[1].parse().ok()?, c[2].parse().ok()?, c[3].parse().ok()?))
        .collect();
    if let Some(start) = iso.first().copied() {
        return Some(ordered(start, iso.get(1).copied()));
    }

    if let Some(range) = parse_month_name(text, reference) {
        return Some(range);
    }

    let numeric: Vec<NaiveDate> = NUMERIC_DATE
        .captures_iter(text)
        .filter_map(|c| {
            let month: u32 = c[1].parse().ok()?;
            let day: u32 = c[2].parse().ok()?;
            match c.get(3) {
                Some(y) => ymd(expand_year(y.as_str())?, month, day),
                None => infer_year(month, day, reference),
            }
        })
        .collect();
    numeric
        .first()
        .copied()
        .map(|start| ordered(start, numeric.get(1).copied()))
}

fn parse_month_name(text: &str, reference: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
    let caps = MONTH_DATE.captures(text)?;
    let start_month = month_number(&caps[1])?;
    let start_day: u32 = caps[2].parse().ok()?;
    let end_month = caps.get(3).and_then(|m| month_number(m.as_str())).unwrap_or(start_month);
    let end_day: Option<u32> = caps.get(4).and_then(|d| d.as_str().parse().ok());
    let crosses_year = end_month < start_month;

    let start = match caps.get(5).and_then(|y| y.as_str().parse::<i32>().ok()) {
        // The trailing year belongs to the end of the range
        Some(year) if crosses_year && end_day.is_some() => ymd(year - 1, start_month, start_day)?,
        Some(year) => ymd(year, start_month, start_day)?,
        None => infer_year(start_month, start_day, reference)?,
    };

    let end = match end_day {
        Some(day) => {
            let year = if crosses_year { start.year() + 1 } else { start.year() };
            ymd(year, end_month, day)
        }
        None => None,
    };
    Some(ordered(start, end))
}

fn ordered(start: NaiveDate, end: Option<NaiveDate>) -> (NaiveDate, NaiveDate) {
    match end {
        Some(end) if end >= start => (start, end),
        _ => (start, start),
    }
}

fn ymd(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day)
}

fn infer_year(month: u32, day: u32, reference: NaiveDate) -> Option<NaiveDate> {
    match ymd(reference.year(), month, day) {
        Some(date) if date >= reference => Some(date),
        _ => ymd(reference.year() + 1, month, day),
    }
}

fn expand_year(raw: &str) -> Option<i32> {
    let year: i32 = raw.parse().ok()?;
    Some(if raw.len() == 2 { 2000 + year } else { year })
}

fn month_number(raw: &str) -> Option<u32> {
    let lower = raw.to_lowercase();
    let month = match lower.get(..3)? {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}
