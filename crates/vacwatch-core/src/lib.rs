//! Core domain model and response-metric merge rules for vacwatch.

use chrono::{DateTime, Duration, DurationRound, FixedOffset, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "vacwatch-core";

pub const VACANCY_URL_PREFIX: &str = "https://hh.ru/vacancy/";
pub const UNKNOWN_SPECIALIZATION: &str = "Неизвестно";
pub const DEFAULT_MIN_RESAMPLE_SECS: i64 = 60;
pub const DEFAULT_UTC_OFFSET_HOURS: i32 = 3;

const LISTING_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const NOT_FOUND_SENTINELS: [&str; 2] = ["Не найдено", "Автообновление не настроено"];

pub fn vacancy_link(vacancy_id: &str) -> String {
    format!("{VACANCY_URL_PREFIX}{vacancy_id}")
}

/// Fixed reporting offset, `None` when `hours` is out of range.
pub fn reporting_offset(hours: i32) -> Option<FixedOffset> {
    FixedOffset::east_opt(hours.checked_mul(3600)?)
}

pub fn now_in(offset: FixedOffset) -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&offset)
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Listing timestamp split into its display parts (`DD.MM.YYYY`, `HH:MM`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SplitTimestamp {
    pub date: String,
    pub time: String,
    #[serde(default)]
    pub parsed: Option<NaiveDateTime>,
}

impl SplitTimestamp {
    pub fn is_empty(&self) -> bool {
        self.date.is_empty() && self.time.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("could not parse listing timestamp {raw:?}")]
pub struct UnparsedTimestamp {
    pub raw: String,
}

impl UnparsedTimestamp {
    /// Raw text goes into `date`, `time` stays empty.
    pub fn into_split(self) -> SplitTimestamp {
        SplitTimestamp {
            date: self.raw,
            time: String::new(),
            parsed: None,
        }
    }
}

/// Strip fractional seconds and the `+offset`/`Z` suffix, then parse the
/// remaining local wall-clock time.
pub fn split_listing_timestamp(raw: Option<&str>) -> Result<SplitTimestamp, UnparsedTimestamp> {
    let Some(raw) = raw else {
        return Ok(SplitTimestamp::default());
    };
    if raw.is_empty() || NOT_FOUND_SENTINELS.contains(&raw) {
        return Ok(SplitTimestamp::default());
    }

    let mut stripped = raw;
    if let Some((head, _)) = stripped.split_once('.') {
        stripped = head;
    }
    let stripped = if let Some((head, _)) = stripped.split_once('+') {
        head.to_string()
    } else {
        stripped.replace('Z', "")
    };

    match NaiveDateTime::parse_from_str(&stripped, LISTING_TIMESTAMP_FORMAT) {
        Ok(parsed) => Ok(SplitTimestamp {
            date: parsed.format("%d.%m.%Y").to_string(),
            time: parsed.format("%H:%M").to_string(),
            parsed: Some(parsed),
        }),
        Err(_) => Err(UnparsedTimestamp {
            raw: raw.to_string(),
        }),
    }
}

/// Age of a listing in days, or a marker when its creation time was unreadable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaysSinceCreation {
    Days(f64),
    DateTimeError,
}

pub fn days_since_creation(creation: &SplitTimestamp, now: NaiveDateTime) -> Option<DaysSinceCreation> {
    if creation.is_empty() {
        return None;
    }
    let Some(created) = creation.parsed else {
        return Some(DaysSinceCreation::DateTimeError);
    };
    // Display precision is minutes; age is measured from the same value.
    let created = created
        .duration_trunc(Duration::minutes(1))
        .unwrap_or(created);
    let seconds = (now - created).num_milliseconds() as f64 / 1000.0;
    Some(DaysSinceCreation::Days(round2(seconds / 3600.0 / 24.0)))
}

/// Descriptive fields mirrored onto the stored document on every accepted scrape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VacancyDetails {
    pub title: Option<String>,
    pub company_name: Option<String>,
    pub city: Option<String>,
    pub work_experience: Option<String>,
    pub specialization: String,
    pub publication_type: Option<String>,
    pub is_adv: bool,
    pub hh_auction: bool,
    pub compensation_from: Option<f64>,
    pub compensation_to: Option<f64>,
    pub creation: SplitTimestamp,
    pub publication: SplitTimestamp,
}

impl Default for VacancyDetails {
    fn default() -> Self {
        Self {
            title: None,
            company_name: None,
            city: None,
            work_experience: None,
            specialization: UNKNOWN_SPECIALIZATION.to_string(),
            publication_type: None,
            is_adv: false,
            hh_auction: false,
            compensation_from: None,
            compensation_to: None,
            creation: SplitTimestamp::default(),
            publication: SplitTimestamp::default(),
        }
    }
}

/// One extracted listing from one scrape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VacancyRecord {
    pub vacancy_id: Option<String>,
    pub link: Option<String>,
    pub details: VacancyDetails,
    pub total_responses: i64,
    pub responses_count: Option<i64>,
    pub days_since_creation: Option<DaysSinceCreation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationEntry {
    pub observed_at: DateTime<FixedOffset>,
    pub total_responses: i64,
    pub increase: i64,
    pub hours_since_previous: f64,
    pub rate_per_hour: f64,
    /// Set when the upstream counter went down since the previous entry.
    #[serde(default)]
    pub counter_decreased: bool,
}

/// Persisted per-vacancy document; `history` is append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VacancyDocument {
    pub vacancy_id: String,
    pub details: VacancyDetails,
    pub history: Vec<ObservationEntry>,
    pub first_seen_at: DateTime<FixedOffset>,
    pub updated_at: DateTime<FixedOffset>,
}

impl VacancyDocument {
    pub fn from_mutation(mutation: VacancyMutation) -> Self {
        let observed_at = mutation.entry.observed_at;
        Self {
            vacancy_id: mutation.vacancy_id,
            details: mutation.details,
            history: vec![mutation.entry],
            first_seen_at: observed_at,
            updated_at: observed_at,
        }
    }

    pub fn last_entry(&self) -> Option<&ObservationEntry> {
        self.history.last()
    }

    pub fn link(&self) -> String {
        vacancy_link(&self.vacancy_id)
    }

    /// Overwrite details and append the entry, the in-memory twin of the store upsert.
    pub fn apply(&mut self, mutation: VacancyMutation) {
        self.updated_at = mutation.entry.observed_at;
        self.details = mutation.details;
        self.history.push(mutation.entry);
    }
}

/// The write a store performs for one accepted scrape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VacancyMutation {
    pub vacancy_id: String,
    pub details: VacancyDetails,
    pub entry: ObservationEntry,
    pub creates_document: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergePolicy {
    pub min_interval: Duration,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::seconds(DEFAULT_MIN_RESAMPLE_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeDecision {
    Append(VacancyMutation),
    RateLimited {
        vacancy_id: String,
        last_observed_at: DateTime<FixedOffset>,
        elapsed: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("vacancy record has no vacancy_id")]
    MissingVacancyId,
    #[error("record {record} does not match stored document {stored}")]
    IdMismatch { record: String, stored: String },
}

/// Decide what a new scrape of a vacancy does to its stored document.
pub fn plan_merge(
    record: &VacancyRecord,
    prior: Option<&VacancyDocument>,
    now: DateTime<FixedOffset>,
    policy: MergePolicy,
) -> Result<MergeDecision, MergeError> {
    let vacancy_id = record
        .vacancy_id
        .clone()
        .ok_or(MergeError::MissingVacancyId)?;
    if let Some(doc) = prior {
        if doc.vacancy_id != vacancy_id {
            return Err(MergeError::IdMismatch {
                record: vacancy_id,
                stored: doc.vacancy_id.clone(),
            });
        }
    }

    let reference = prior.and_then(VacancyDocument::last_entry);
    let entry = match reference {
        None => ObservationEntry {
            observed_at: now,
            total_responses: record.total_responses,
            increase: 0,
            hours_since_previous: 0.0,
            rate_per_hour: 0.0,
            counter_decreased: false,
        },
        Some(reference) => {
            let elapsed = now.signed_duration_since(reference.observed_at);
            if elapsed < policy.min_interval {
                return Ok(MergeDecision::RateLimited {
                    vacancy_id,
                    last_observed_at: reference.observed_at,
                    elapsed,
                });
            }

            let increase = record.total_responses - reference.total_responses;
            let hours = round2(elapsed.num_milliseconds() as f64 / 1000.0 / 3600.0);
            let rate = if hours > 0.0 {
                round2(increase as f64 / hours)
            } else {
                0.0
            };
            ObservationEntry {
                observed_at: now,
                total_responses: record.total_responses,
                increase,
                hours_since_previous: hours.max(0.0),
                rate_per_hour: rate,
                counter_decreased: increase < 0,
            }
        }
    };

    Ok(MergeDecision::Append(VacancyMutation {
        vacancy_id,
        details: record.details.clone(),
        entry,
        creates_document: prior.is_none(),
    }))
}
