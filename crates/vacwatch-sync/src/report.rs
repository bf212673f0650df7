//! Reports over stored vacancy documents: hourly response growth, fastest
//! growing vacancies and the per-vacancy hourly pivot.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, Timelike};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use vacwatch_core::{reporting_offset, ObservationEntry, VacancyDocument};

use crate::SyncRunSummary;

pub const HOUR_LABEL_FORMAT: &str = "%d.%m.%Y %H:00";
pub const DEFAULT_TOP_N: usize = 5;
pub const DEFAULT_GROWTH_WINDOW_HOURS: i64 = 24;

/// Hourly reports filtered to one of these cities are bucketed in its local
/// time. None of them observe DST.
const CITY_UTC_OFFSET_HOURS: [(&str, i32); 10] = [
    ("Москва", 3),
    ("Санкт-Петербург", 3),
    ("Краснодар", 3),
    ("Калининград", 2),
    ("Самара", 4),
    ("Екатеринбург", 5),
    ("Новосибирск", 7),
    ("Красноярск", 7),
    ("Иркутск", 8),
    ("Владивосток", 10),
];

pub fn city_offset(city: &str) -> Option<FixedOffset> {
    CITY_UTC_OFFSET_HOURS
        .iter()
        .find(|(name, _)| *name == city)
        .and_then(|(_, hours)| reporting_offset(*hours))
}

fn local_hour(observed_at: DateTime<FixedOffset>, offset: FixedOffset) -> NaiveDateTime {
    let local = observed_at.with_timezone(&offset).naive_local();
    local
        .date()
        .and_hms_opt(local.hour(), 0, 0)
        .unwrap_or(local)
}

pub fn hour_label(hour: NaiveDateTime) -> String {
    hour.format(HOUR_LABEL_FORMAT).to_string()
}

#[derive(Debug, Clone, Default)]
pub struct HourlyFilter {
    pub city: Option<String>,
    /// Empty means every specialization.
    pub specializations: Vec<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub positive_only: bool,
}

impl HourlyFilter {
    fn accepts_document(&self, doc: &VacancyDocument) -> bool {
        if let Some(city) = &self.city {
            if doc.details.city.as_deref() != Some(city.as_str()) {
                return false;
            }
        }
        self.specializations.is_empty() || self.specializations.contains(&doc.details.specialization)
    }

    fn accepts_entry(&self, entry: &ObservationEntry, offset: FixedOffset) -> bool {
        if self.positive_only && entry.increase <= 0 {
            return false;
        }
        let day = entry.observed_at.with_timezone(&offset).date_naive();
        self.from.map_or(true, |from| day >= from) && self.to.map_or(true, |to| day <= to)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HourlyIncrease {
    pub hour: NaiveDateTime,
    pub label: String,
    pub total_increase: i64,
    pub observations: usize,
}

/// Sum of `increase` per local hour, oldest first. A known filter city
/// replaces `offset` with its own.
pub fn hourly_increase(
    docs: &[VacancyDocument],
    offset: FixedOffset,
    filter: &HourlyFilter,
) -> Vec<HourlyIncrease> {
    let offset = filter
        .city
        .as_deref()
        .and_then(city_offset)
        .unwrap_or(offset);
    let mut buckets: BTreeMap<NaiveDateTime, (i64, usize)> = BTreeMap::new();
    for doc in docs.iter().filter(|d| filter.accepts_document(d)) {
        for entry in doc.history.iter().filter(|e| filter.accepts_entry(e, offset)) {
            let bucket = buckets.entry(local_hour(entry.observed_at, offset)).or_default();
            bucket.0 += entry.increase;
            bucket.1 += 1;
        }
    }
    buckets
        .into_iter()
        .map(|(hour, (total_increase, observations))| HourlyIncrease {
            hour,
            label: hour_label(hour),
            total_increase,
            observations,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrowthRow {
    pub vacancy_id: String,
    pub title: Option<String>,
    pub company_name: Option<String>,
    pub city: Option<String>,
    pub specialization: String,
    pub link: String,
    pub observed_at: DateTime<FixedOffset>,
    pub total_responses: i64,
    pub increase: i64,
    pub rate_per_hour: f64,
}

/// Each vacancy's latest entry inside the window, ranked by rate per hour.
pub fn fastest_growing(
    docs: &[VacancyDocument],
    now: DateTime<FixedOffset>,
    window: Duration,
    top_n: usize,
) -> Vec<GrowthRow> {
    let since = now - window;
    let mut rows: Vec<GrowthRow> = docs
        .iter()
        .filter_map(|doc| {
            let latest = doc
                .history
                .iter()
                .filter(|e| e.observed_at >= since && e.observed_at <= now)
                .max_by_key(|e| e.observed_at)?;
            Some(GrowthRow {
                vacancy_id: doc.vacancy_id.clone(),
                title: doc.details.title.clone(),
                company_name: doc.details.company_name.clone(),
                city: doc.details.city.clone(),
                specialization: doc.details.specialization.clone(),
                link: doc.link(),
                observed_at: latest.observed_at,
                total_responses: latest.total_responses,
                increase: latest.increase,
                rate_per_hour: latest.rate_per_hour,
            })
        })
        .collect();
    rows.sort_by(|a, b| {
        b.rate_per_hour
            .total_cmp(&a.rate_per_hour)
            .then_with(|| a.vacancy_id.cmp(&b.vacancy_id))
    });
    rows.truncate(top_n);
    rows
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PivotRow {
    pub vacancy_id: String,
    pub title: Option<String>,
    pub company_name: Option<String>,
    pub city: Option<String>,
    pub publication_type: Option<String>,
    pub specialization: String,
    pub created: String,
    pub link: String,
    /// Summed increase per column; hours without observations are 0.
    pub cells: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PivotTable {
    pub columns: Vec<String>,
    pub rows: Vec<PivotRow>,
}

/// One row per vacancy, one column per local hour seen in any history.
pub fn pivot_table(docs: &[VacancyDocument], offset: FixedOffset) -> PivotTable {
    let hours: BTreeSet<NaiveDateTime> = docs
        .iter()
        .flat_map(|d| d.history.iter())
        .map(|e| local_hour(e.observed_at, offset))
        .collect();
    let index: BTreeMap<NaiveDateTime, usize> =
        hours.iter().enumerate().map(|(i, h)| (*h, i)).collect();

    let mut rows: Vec<PivotRow> = docs
        .iter()
        .map(|doc| {
            let mut cells = vec![0i64; index.len()];
            for entry in &doc.history {
                if let Some(&col) = index.get(&local_hour(entry.observed_at, offset)) {
                    cells[col] += entry.increase;
                }
            }
            let creation = &doc.details.creation;
            PivotRow {
                vacancy_id: doc.vacancy_id.clone(),
                title: doc.details.title.clone(),
                company_name: doc.details.company_name.clone(),
                city: doc.details.city.clone(),
                publication_type: doc.details.publication_type.clone(),
                specialization: doc.details.specialization.clone(),
                created: format!("{} {}", creation.date, creation.time).trim().to_string(),
                link: doc.link(),
                cells,
            }
        })
        .collect();
    rows.sort_by(|a, b| a.vacancy_id.cmp(&b.vacancy_id));

    PivotTable {
        columns: hours.into_iter().map(hour_label).collect(),
        rows,
    }
}

pub fn render_hourly_markdown(rows: &[HourlyIncrease]) -> String {
    let mut lines = vec![
        "# Hourly response growth".to_string(),
        String::new(),
        "| Hour | Increase | Observations |".to_string(),
        "|---|---:|---:|".to_string(),
    ];
    lines.extend(
        rows.iter()
            .map(|r| format!("| {} | {} | {} |", r.label, r.total_increase, r.observations)),
    );
    if rows.is_empty() {
        lines.push("| - | 0 | 0 |".to_string());
    }
    lines.push(String::new());
    lines.join("\n")
}

pub fn render_top_markdown(rows: &[GrowthRow], window: Duration) -> String {
    let mut lines = vec![
        format!("# Fastest growing vacancies (last {} h)", window.num_hours()),
        String::new(),
        "| # | Vacancy | Company | City | Responses | Increase | Rate/h |".to_string(),
        "|---:|---|---|---|---:|---:|---:|".to_string(),
    ];
    for (i, row) in rows.iter().enumerate() {
        lines.push(format!(
            "| {} | [{}]({}) | {} | {} | {} | {} | {:.2} |",
            i + 1,
            escape_cell(row.title.as_deref().unwrap_or(&row.vacancy_id)),
            row.link,
            escape_cell(row.company_name.as_deref().unwrap_or("-")),
            escape_cell(row.city.as_deref().unwrap_or("-")),
            row.total_responses,
            row.increase,
            row.rate_per_hour
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|")
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

async fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))
}

pub async fn write_run_summary(reports_dir: &Path, summary: &SyncRunSummary) -> Result<()> {
    ensure_dir(reports_dir).await?;

    let mut lines = vec![
        "# Vacancy sync brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Created: {}", summary.totals.created),
        format!("- Appended: {}", summary.totals.appended),
        format!("- Rate limited: {}", summary.totals.rate_limited),
        format!("- Failed: {}", summary.totals.failed),
        String::new(),
        "## Searches".to_string(),
    ];
    for search in &summary.searches {
        lines.push(format!(
            "- {}: pages={} skipped={} listings={} warnings={} stop={:?}",
            search.search_id,
            search.pages_loaded,
            search.pages_skipped,
            search.extracted,
            search.warnings,
            search.stop_reason
        ));
    }
    lines.push(String::new());

    fs::write(reports_dir.join("sync_brief.md"), lines.join("\n"))
        .await
        .context("writing sync_brief.md")?;
    write_json(&reports_dir.join("run_summary.json"), summary).await
}

pub async fn write_hourly_report(reports_dir: &Path, rows: &[HourlyIncrease]) -> Result<PathBuf> {
    ensure_dir(reports_dir).await?;
    let path = reports_dir.join("hourly_increase.md");
    fs::write(&path, render_hourly_markdown(rows))
        .await
        .context("writing hourly_increase.md")?;
    write_json(&reports_dir.join("hourly_increase.json"), &rows).await?;
    Ok(path)
}

pub async fn write_top_report(
    reports_dir: &Path,
    rows: &[GrowthRow],
    window: Duration,
) -> Result<PathBuf> {
    ensure_dir(reports_dir).await?;
    let path = reports_dir.join("fastest_growing.md");
    fs::write(&path, render_top_markdown(rows, window))
        .await
        .context("writing fastest_growing.md")?;
    write_json(&reports_dir.join("fastest_growing.json"), &rows).await?;
    Ok(path)
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `pivot.json` plus parquet snapshots of the pivot and the raw
/// observations, returning the manifest path.
pub async fn export_pivot(
    reports_dir: &Path,
    docs: &[VacancyDocument],
    table: &PivotTable,
) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    ensure_dir(&snapshot_dir).await?;
    write_json(&reports_dir.join("pivot.json"), table).await?;

    let pivot_path = snapshot_dir.join("pivot.parquet");
    let observations_path = snapshot_dir.join("observations.parquet");
    write_pivot_parquet(&pivot_path, table)?;
    write_observations_parquet(&observations_path, docs)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("pivot", reports_dir, &pivot_path)?,
            manifest_entry("observations", reports_dir, &observations_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    write_json(&manifest_path, &manifest).await?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn utf8_column<'a>(values: impl Iterator<Item = Option<&'a str>>) -> ArrayRef {
    Arc::new(StringArray::from(values.collect::<Vec<_>>()))
}

fn write_pivot_parquet(path: &Path, table: &PivotTable) -> Result<()> {
    let mut fields = vec![
        ArrowField::new("vacancy_id", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, true),
        ArrowField::new("company_name", DataType::Utf8, true),
        ArrowField::new("city", DataType::Utf8, true),
        ArrowField::new("publication_type", DataType::Utf8, true),
        ArrowField::new("specialization", DataType::Utf8, false),
        ArrowField::new("created", DataType::Utf8, false),
        ArrowField::new("link", DataType::Utf8, false),
    ];
    fields.extend(
        table
            .columns
            .iter()
            .map(|label| ArrowField::new(label, DataType::Int64, false)),
    );

    let rows = &table.rows;
    let mut columns: Vec<ArrayRef> = vec![
        utf8_column(rows.iter().map(|r| Some(r.vacancy_id.as_str()))),
        utf8_column(rows.iter().map(|r| r.title.as_deref())),
        utf8_column(rows.iter().map(|r| r.company_name.as_deref())),
        utf8_column(rows.iter().map(|r| r.city.as_deref())),
        utf8_column(rows.iter().map(|r| r.publication_type.as_deref())),
        utf8_column(rows.iter().map(|r| Some(r.specialization.as_str()))),
        utf8_column(rows.iter().map(|r| Some(r.created.as_str()))),
        utf8_column(rows.iter().map(|r| Some(r.link.as_str()))),
    ];
    for col in 0..table.columns.len() {
        let values = rows
            .iter()
            .map(|r| r.cells.get(col).copied().unwrap_or(0))
            .collect::<Vec<_>>();
        columns.push(Arc::new(Int64Array::from(values)));
    }

    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .context("building pivot record batch")?;
    write_parquet(path, batch)
}

fn write_observations_parquet(path: &Path, docs: &[VacancyDocument]) -> Result<()> {
    let rows: Vec<(&str, &ObservationEntry)> = docs
        .iter()
        .flat_map(|d| d.history.iter().map(move |e| (d.vacancy_id.as_str(), e)))
        .collect();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("vacancy_id", DataType::Utf8, false),
        ArrowField::new("observed_at", DataType::Utf8, false),
        ArrowField::new("total_responses", DataType::Int64, false),
        ArrowField::new("increase", DataType::Int64, false),
        ArrowField::new("hours_since_previous", DataType::Float64, false),
        ArrowField::new("rate_per_hour", DataType::Float64, false),
        ArrowField::new("counter_decreased", DataType::Boolean, false),
    ]));

    let observed_at = StringArray::from(
        rows.iter()
            .map(|(_, e)| Some(e.observed_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let batch = RecordBatch::try_new(
        schema,
        vec![
            utf8_column(rows.iter().map(|(id, _)| Some(*id))),
            Arc::new(observed_at),
            Arc::new(Int64Array::from(
                rows.iter().map(|(_, e)| e.total_responses).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                rows.iter().map(|(_, e)| e.increase).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rows.iter().map(|(_, e)| e.hours_since_previous).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rows.iter().map(|(_, e)| e.rate_per_hour).collect::<Vec<_>>(),
            )),
            Arc::new(BooleanArray::from(
                rows.iter().map(|(_, e)| e.counter_decreased).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building observations record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
