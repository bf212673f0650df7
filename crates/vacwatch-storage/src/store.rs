use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use vacwatch_core::{ObservationEntry, VacancyDetails, VacancyDocument, VacancyMutation};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Document store keyed by `vacancy_id`.
///
/// `upsert` must create the document when absent, and otherwise overwrite its
/// details and append the entry to its history, atomically per document.
#[async_trait]
pub trait VacancyStore: Send + Sync {
    async fn find(&self, vacancy_id: &str) -> Result<Option<VacancyDocument>, StoreError>;

    async fn upsert(&self, mutation: &VacancyMutation) -> Result<(), StoreError>;

    async fn list(&self) -> Result<Vec<VacancyDocument>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryVacancyStore {
    docs: Mutex<BTreeMap<String, VacancyDocument>>,
    writes: AtomicUsize,
}

impl MemoryVacancyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents(docs: impl IntoIterator<Item = VacancyDocument>) -> Self {
        let docs = docs
            .into_iter()
            .map(|doc| (doc.vacancy_id.clone(), doc))
            .collect();
        Self {
            docs: Mutex::new(docs),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VacancyStore for MemoryVacancyStore {
    async fn find(&self, vacancy_id: &str) -> Result<Option<VacancyDocument>, StoreError> {
        Ok(self.docs.lock().await.get(vacancy_id).cloned())
    }

    async fn upsert(&self, mutation: &VacancyMutation) -> Result<(), StoreError> {
        let mut docs = self.docs.lock().await;
        match docs.get_mut(&mutation.vacancy_id) {
            Some(doc) => doc.apply(mutation.clone()),
            None => {
                docs.insert(
                    mutation.vacancy_id.clone(),
                    VacancyDocument::from_mutation(mutation.clone()),
                );
            }
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<VacancyDocument>, StoreError> {
        Ok(self.docs.lock().await.values().cloned().collect())
    }
}

/// Postgres-backed store: one row per vacancy, `details` and `history` as jsonb.
#[derive(Debug, Clone)]
pub struct PgVacancyStore {
    pool: PgPool,
    offset: FixedOffset,
}

const UPSERT_SQL: &str = r#"
INSERT INTO vacancies (vacancy_id, details, history, first_seen_at, updated_at)
VALUES ($1, $2, jsonb_build_array($3::jsonb), $4, $4)
ON CONFLICT (vacancy_id) DO UPDATE
SET details = EXCLUDED.details,
    history = vacancies.history || EXCLUDED.history,
    updated_at = EXCLUDED.updated_at
"#;

const SELECT_SQL: &str =
    "SELECT vacancy_id, details, history, first_seen_at, updated_at FROM vacancies";

impl PgVacancyStore {
    pub async fn connect(database_url: &str, offset: FixedOffset) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool, offset })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn document_from_row(&self, row: &PgRow) -> Result<VacancyDocument, StoreError> {
        let Json(details): Json<VacancyDetails> = row.try_get("details")?;
        let Json(history): Json<Vec<ObservationEntry>> = row.try_get("history")?;
        let first_seen_at: DateTime<Utc> = row.try_get("first_seen_at")?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
        Ok(VacancyDocument {
            vacancy_id: row.try_get("vacancy_id")?,
            details,
            history,
            first_seen_at: first_seen_at.with_timezone(&self.offset),
            updated_at: updated_at.with_timezone(&self.offset),
        })
    }
}

#[async_trait]
impl VacancyStore for PgVacancyStore {
    async fn find(&self, vacancy_id: &str) -> Result<Option<VacancyDocument>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_SQL} WHERE vacancy_id = $1"))
            .bind(vacancy_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(|r| self.document_from_row(r)).transpose()
    }

    async fn upsert(&self, mutation: &VacancyMutation) -> Result<(), StoreError> {
        sqlx::query(UPSERT_SQL)
            .bind(&mutation.vacancy_id)
            .bind(Json(&mutation.details))
            .bind(Json(&mutation.entry))
            .bind(mutation.entry.observed_at.with_timezone(&Utc))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<VacancyDocument>, StoreError> {
        let rows = sqlx::query(&format!("{SELECT_SQL} ORDER BY vacancy_id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| self.document_from_row(r)).collect()
    }
}
