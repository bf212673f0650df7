//! Listing-page adapters: embedded initial-state extraction and vacancy field normalization.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use scraper::{Html, Selector};
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;
use url::Url;
use uuid::Uuid;
use vacwatch_core::{
    days_since_creation, split_listing_timestamp, vacancy_link, SplitTimestamp, VacancyDetails,
    VacancyRecord, UNKNOWN_SPECIALIZATION,
};
use vacwatch_storage::HttpFetcher;

pub const CRATE_NAME: &str = "vacwatch-adapters";

pub const HH_SOURCE_ID: &str = "hh";
pub const HH_PROFESSIONAL_ROLES_URL: &str = "https://api.hh.ru/professional_roles";
pub const INITIAL_STATE_SELECTOR: &str = "template#HH-Lux-InitialState";
pub const ITEMS_PER_PAGE: usize = 100;
/// The site serves at most this many result pages per search.
pub const MAX_PAGES: usize = 20;

const MONTHLY_PAY: &str = "MONTH";
const LOCAL_CURRENCY: &str = "RUR";
const AUCTION_PROPERTY: &str = "HH_AUCTION";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("initial state template not found")]
    MissingInitialState,
    #[error("initial state template is empty")]
    EmptyInitialState,
    #[error("invalid initial state JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("invalid search url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("{0}")]
    Message(String),
}

impl AdapterError {
    /// Errors after which later pages cannot be expected to parse either.
    pub fn stops_pagination(&self) -> bool {
        matches!(
            self,
            AdapterError::MissingInitialState | AdapterError::EmptyInitialState
        )
    }
}

/// Specialization id → display name, built from the professional-roles directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecializationLookup(BTreeMap<String, String>);

impl SpecializationLookup {
    pub fn from_directory(directory: &JsonValue) -> Self {
        let mut table = BTreeMap::new();
        let categories = directory
            .get("categories")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for category in categories {
            let Some(roles) = category.get("roles").and_then(JsonValue::as_array) else {
                continue;
            };
            for role in roles {
                let id = role.get("id").and_then(json_scalar_string);
                let name = role.get("name").and_then(JsonValue::as_str);
                if let (Some(id), Some(name)) = (id, name) {
                    table.insert(id, name.to_string());
                }
            }
        }
        Self(table)
    }

    pub fn get(&self, id: &str) -> Option<&str> {
        self.0.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Name for the role, `ID: {id}` when unknown, `Неизвестно` without a role.
    pub fn resolve(&self, role_id: Option<&str>) -> String {
        match role_id {
            Some(id) => self
                .get(id)
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("ID: {id}")),
            None => UNKNOWN_SPECIALIZATION.to_string(),
        }
    }
}

impl FromIterator<(String, String)> for SpecializationLookup {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractContext<'a> {
    pub specializations: &'a SpecializationLookup,
    /// Wall-clock "now" in the reporting timezone.
    pub now: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractionWarning {
    pub vacancy_id: Option<String>,
    pub field: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageExtraction {
    pub records: Vec<VacancyRecord>,
    pub warnings: Vec<ExtractionWarning>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    Listings(PageExtraction),
    /// The page loaded but carried no listings: stop paginating.
    EndOfResults,
}

#[async_trait]
pub trait ListingAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    fn page_url(&self, base_url: &str, page: usize) -> Result<String, AdapterError>;

    fn parse_page(&self, html: &str, ctx: &ExtractContext<'_>) -> Result<PageOutcome, AdapterError>;

    async fn fetch_specializations(&self, http: &HttpFetcher, run_id: Uuid) -> SpecializationLookup;
}

#[derive(Debug, Clone)]
pub struct HhAdapter {
    roles_url: String,
}

impl Default for HhAdapter {
    fn default() -> Self {
        Self::new(HH_PROFESSIONAL_ROLES_URL)
    }
}

impl HhAdapter {
    pub fn new(roles_url: impl Into<String>) -> Self {
        Self {
            roles_url: roles_url.into(),
        }
    }
}

#[async_trait]
impl ListingAdapter for HhAdapter {
    fn source_id(&self) -> &'static str {
        HH_SOURCE_ID
    }

    fn page_url(&self, base_url: &str, page: usize) -> Result<String, AdapterError> {
        search_page_url(base_url, page)
    }

    fn parse_page(&self, html: &str, ctx: &ExtractContext<'_>) -> Result<PageOutcome, AdapterError> {
        let payload = extract_initial_state(html)?;
        Ok(extract_listings(&payload, ctx))
    }

    async fn fetch_specializations(&self, http: &HttpFetcher, run_id: Uuid) -> SpecializationLookup {
        match http
            .fetch_json::<JsonValue>(run_id, HH_SOURCE_ID, &self.roles_url)
            .await
        {
            Ok(directory) => {
                let lookup = SpecializationLookup::from_directory(&directory);
                tracing::info!(roles = lookup.len(), "loaded specialization directory");
                lookup
            }
            Err(err) => {
                warn!(url = %self.roles_url, error = %err, "specialization directory unavailable; names fall back to ids");
                SpecializationLookup::default()
            }
        }
    }
}

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn ListingAdapter>> {
    match source_id {
        HH_SOURCE_ID => Some(Box::new(HhAdapter::default())),
        _ => None,
    }
}

/// Search URL for a 0-based page, forcing the maximum page size.
pub fn search_page_url(base_url: &str, page: usize) -> Result<String, AdapterError> {
    let mut url = Url::parse(base_url).map_err(|source| AdapterError::InvalidUrl {
        url: base_url.to_string(),
        source,
    })?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "items_on_page" && k != "page")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept.iter())
        .append_pair("items_on_page", &ITEMS_PER_PAGE.to_string())
        .append_pair("page", &page.to_string());
    Ok(url.into())
}

/// `0` means "until results run out"; anything else is capped at [`MAX_PAGES`].
pub fn page_ceiling(requested: usize) -> Option<usize> {
    (requested > 0).then(|| requested.min(MAX_PAGES))
}

pub fn extract_initial_state(html: &str) -> Result<JsonValue, AdapterError> {
    let document = Html::parse_document(html);
    let selector =
        Selector::parse(INITIAL_STATE_SELECTOR).map_err(|e| AdapterError::Message(e.to_string()))?;
    let node = document
        .select(&selector)
        .next()
        .ok_or(AdapterError::MissingInitialState)?;
    let text = node.text().collect::<String>();
    if text.trim().is_empty() {
        return Err(AdapterError::EmptyInitialState);
    }
    Ok(serde_json::from_str(text.trim())?)
}

/// Normalize every listing on one decoded page. Bad fields degrade to defaults;
/// a listing is never dropped.
pub fn extract_listings(payload: &JsonValue, ctx: &ExtractContext<'_>) -> PageOutcome {
    let Some(listings) = payload
        .get("vacancySearchResult")
        .and_then(|r| r.get("vacancies"))
        .and_then(JsonValue::as_array)
    else {
        warn!("page payload has no vacancySearchResult.vacancies array");
        return PageOutcome::EndOfResults;
    };
    if listings.is_empty() {
        return PageOutcome::EndOfResults;
    }

    let mut extraction = PageExtraction::default();
    for listing in listings {
        let raw = match RawListing::deserialize(listing) {
            Ok(raw) => raw,
            Err(err) => {
                extraction.warnings.push(ExtractionWarning {
                    vacancy_id: None,
                    field: "listing",
                    message: format!("listing is not an object: {err}"),
                });
                RawListing::default()
            }
        };
        let record = normalize_listing(raw, ctx, &mut extraction.warnings);
        extraction.records.push(record);
    }
    for warning in &extraction.warnings {
        warn!(
            vacancy_id = warning.vacancy_id.as_deref().unwrap_or("-"),
            field = warning.field,
            "{}",
            warning.message
        );
    }
    PageOutcome::Listings(extraction)
}

fn normalize_listing(
    raw: RawListing,
    ctx: &ExtractContext<'_>,
    warnings: &mut Vec<ExtractionWarning>,
) -> VacancyRecord {
    let vacancy_id = raw.vacancy_id;
    let mut timestamp = |field: &'static str, value: Option<&str>| -> SplitTimestamp {
        split_listing_timestamp(value).unwrap_or_else(|unparsed| {
            warnings.push(ExtractionWarning {
                vacancy_id: vacancy_id.clone(),
                field,
                message: unparsed.to_string(),
            });
            unparsed.into_split()
        })
    };
    let creation = timestamp("creationTime", raw.creation_time.as_deref());
    let publication = timestamp(
        "publicationTime",
        raw.publication_time.as_ref().and_then(|p| p.value.as_deref()),
    );

    let (compensation_from, compensation_to) = match raw.compensation {
        Some(c)
            if c.mode.as_deref() == Some(MONTHLY_PAY)
                && c.currency_code.as_deref() == Some(LOCAL_CURRENCY) =>
        {
            (c.from, c.to)
        }
        _ => (None, None),
    };

    let hh_auction = raw
        .vacancy_properties
        .and_then(|p| p.properties)
        .unwrap_or_default()
        .iter()
        .flat_map(|group| group.property.iter().flatten())
        .any(|prop| prop.property_type.as_deref() == Some(AUCTION_PROPERTY));

    let role_id = raw
        .professional_role_ids
        .as_ref()
        .and_then(|groups| groups.first())
        .and_then(|group| group.professional_role_id.as_ref())
        .and_then(|ids| ids.first())
        .and_then(json_scalar_string);

    let days = days_since_creation(&creation, ctx.now);

    VacancyRecord {
        link: vacancy_id.as_deref().map(vacancy_link),
        vacancy_id,
        details: VacancyDetails {
            title: raw.name,
            company_name: raw.company.and_then(|c| c.name),
            city: raw.area.and_then(|a| a.name),
            work_experience: raw.work_experience,
            specialization: ctx.specializations.resolve(role_id.as_deref()),
            publication_type: raw.metallic,
            is_adv: raw.is_adv.unwrap_or(false),
            hh_auction,
            compensation_from,
            compensation_to,
            creation,
            publication,
        },
        total_responses: raw.total_responses.unwrap_or(0),
        responses_count: raw.responses_count,
        days_since_creation: days,
    }
}

fn json_scalar_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Any value that does not fit `T` becomes `None` instead of failing the listing.
fn lenient<'de, D, T>(de: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = JsonValue::deserialize(de)?;
    Ok(serde_json::from_value(value).ok())
}

fn lenient_id<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(json_scalar_string(&JsonValue::deserialize(de)?))
}

fn lenient_count<'de, D>(de: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = JsonValue::deserialize(de)?;
    Ok(value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && f.is_finite())
            .map(|f| f as i64)
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawListing {
    #[serde(rename = "vacancyId", deserialize_with = "lenient_id")]
    vacancy_id: Option<String>,
    #[serde(deserialize_with = "lenient")]
    name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    area: Option<RawNamed>,
    #[serde(deserialize_with = "lenient")]
    company: Option<RawNamed>,
    #[serde(deserialize_with = "lenient")]
    compensation: Option<RawCompensation>,
    #[serde(rename = "workExperience", deserialize_with = "lenient")]
    work_experience: Option<String>,
    #[serde(deserialize_with = "lenient")]
    metallic: Option<String>,
    #[serde(rename = "creationTime", deserialize_with = "lenient")]
    creation_time: Option<String>,
    #[serde(rename = "publicationTime", deserialize_with = "lenient")]
    publication_time: Option<RawPublicationTime>,
    #[serde(rename = "totalResponsesCount", deserialize_with = "lenient_count")]
    total_responses: Option<i64>,
    #[serde(rename = "responsesCount", deserialize_with = "lenient_count")]
    responses_count: Option<i64>,
    #[serde(rename = "@isAdv", deserialize_with = "lenient")]
    is_adv: Option<bool>,
    #[serde(rename = "vacancyProperties", deserialize_with = "lenient")]
    vacancy_properties: Option<RawVacancyProperties>,
    #[serde(rename = "professionalRoleIds", deserialize_with = "lenient")]
    professional_role_ids: Option<Vec<RawRoleIds>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawNamed {
    #[serde(deserialize_with = "lenient")]
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawCompensation {
    #[serde(deserialize_with = "lenient")]
    mode: Option<String>,
    #[serde(rename = "currencyCode", deserialize_with = "lenient")]
    currency_code: Option<String>,
    #[serde(deserialize_with = "lenient")]
    from: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    to: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPublicationTime {
    #[serde(rename = "$", deserialize_with = "lenient")]
    value: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawVacancyProperties {
    #[serde(deserialize_with = "lenient")]
    properties: Option<Vec<RawPropertyGroup>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPropertyGroup {
    #[serde(deserialize_with = "lenient")]
    property: Option<Vec<RawProperty>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawProperty {
    #[serde(rename = "propertyType", deserialize_with = "lenient")]
    property_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRoleIds {
    #[serde(rename = "professionalRoleId", deserialize_with = "lenient")]
    professional_role_id: Option<Vec<JsonValue>>,
}
