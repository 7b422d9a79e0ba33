//! Deterministic confidence scoring, adapted from the quality gate's
//! issue-weighting approach: each present and valid field contributes a fixed
//! weight, and the total is clamped to 0..=100.
//!
//! The score only orders the review queue and flags rows for attention. It
//! never approves anything on its own.

use crate::domain::NormalizedShow;
use crate::pipeline::normalizer::is_state_code;

pub const LOW_CONFIDENCE_THRESHOLD: u8 = 70;

const NAME_WEIGHT: u32 = 20;
const DATE_WEIGHT: u32 = 30;
const SUSPECT_DATE_WEIGHT: u32 = 15;
const VENUE_WEIGHT: u32 = 8;
const ADDRESS_WEIGHT: u32 = 7;
const CITY_WEIGHT: u32 = 7;
const STATE_WEIGHT: u32 = 8;
const FEE_WEIGHT: u32 = 5;
const DESCRIPTION_WEIGHT: u32 = 5;
const CONTACT_WEIGHT: u32 = 5;
const URL_WEIGHT: u32 = 5;

/// Longest span treated as a plausible single show.
const MAX_PLAUSIBLE_SPAN_DAYS: i64 = 7;

pub fn score(show: &NormalizedShow) -> u8 {
    let mut total = 0;

    if !show.name.trim().is_empty() {
        total += NAME_WEIGHT;
    }

    let span = (show.end_date - show.start_date).num_days();
    total += if (0..=MAX_PLAUSIBLE_SPAN_DAYS).contains(&span) {
        DATE_WEIGHT
    } else {
        SUSPECT_DATE_WEIGHT
    };

    total += weight_if(present(&show.venue_name), VENUE_WEIGHT);
    total += weight_if(present(&show.address), ADDRESS_WEIGHT);
    total += weight_if(present(&show.city), CITY_WEIGHT);
    total += weight_if(show.state.as_deref().map_or(false, is_state_code), STATE_WEIGHT);
    total += weight_if(show.entry_fee.map_or(false, |f| f >= 0.0), FEE_WEIGHT);
    total += weight_if(present(&show.description), DESCRIPTION_WEIGHT);
    total += weight_if(present(&show.contact_info), CONTACT_WEIGHT);
    total += weight_if(present(&show.url), URL_WEIGHT);

    total.min(100) as u8
}

pub fn is_low_confidence(score: u8) -> bool {
    score < LOW_CONFIDENCE_THRESHOLD
}

fn present(field: &Option<String>) -> bool {
    field.as_deref().map_or(false, |v| !v.trim().is_empty())
}

fn weight_if(condition: bool, weight: u32) -> u32 {
    if condition {
        weight
    } else {
        0
    }
}
