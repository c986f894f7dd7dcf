//! Catalog HTTP fetch + per-category record persistence for geopoll.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use geopoll_core::{Category, Record};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "geopoll-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid JSON body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Fetches one catalog search URL and returns its parsed JSON body.
///
/// Any non-2xx status is an error; there is no retry.
#[async_trait]
pub trait CatalogFetcher: Send + Sync {
    async fn fetch_json(&self, url: &str) -> Result<JsonValue, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

#[async_trait]
impl CatalogFetcher for HttpFetcher {
    async fn fetch_json(&self, url: &str) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_fetch", url);
        async move {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?;
            debug!(bytes = body.len(), "fetched catalog response");
            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: final_url,
                source,
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The category's table has never been created.
    #[error("no such table `{table}` for category {category}")]
    MissingTable {
        category: Category,
        table: &'static str,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_missing_table(&self) -> bool {
        matches!(self, StoreError::MissingTable { .. })
    }
}

/// Keyed, per-category record storage with explicit commit.
///
/// `find` and `list` report a never-created category as
/// [`StoreError::MissingTable`]. `upsert` creates the table on demand and
/// overwrites an existing row with the same id.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find(&self, category: Category, id: &str) -> Result<Option<Record>, StoreError>;

    async fn upsert(&self, category: Category, record: &Record) -> Result<(), StoreError>;

    async fn commit(&self) -> Result<(), StoreError>;

    async fn ensure_table(&self, category: Category) -> Result<(), StoreError>;

    async fn list(&self, category: Category) -> Result<Vec<Record>, StoreError>;
}

/// SQLite-backed store: one `(url, title, id)` table per category with a
/// unique index on `id`.
pub struct SqliteRecordStore {
    pool: SqlitePool,
    pending: Mutex<Option<Transaction<'static, Sqlite>>>,
}

impl SqliteRecordStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true);
        // A single connection keeps reads and the open write transaction on
        // the same handle.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        Ok(Self::new(pool))
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            pending: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn create_table_sql(category: Category) -> [String; 2] {
    let table = category.table_name();
    [
        format!("CREATE TABLE IF NOT EXISTS {table} (url TEXT, title TEXT, id TEXT)"),
        format!("CREATE UNIQUE INDEX IF NOT EXISTS {table}_id_unique ON {table} (id)"),
    ]
}

fn classify_sqlx_error(category: Category, err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.message().starts_with("no such table") {
            return StoreError::MissingTable {
                category,
                table: category.table_name(),
            };
        }
    }
    StoreError::Database(err)
}

fn row_to_record(row: &SqliteRow) -> Result<Record, sqlx::Error> {
    Ok(Record {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        url: row.try_get("url")?,
    })
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn find(&self, category: Category, id: &str) -> Result<Option<Record>, StoreError> {
        let sql = format!(
            "SELECT id, title, url FROM {} WHERE id = ?",
            category.table_name()
        );
        let mut pending = self.pending.lock().await;
        let row = match pending.as_mut() {
            Some(tx) => sqlx::query(&sql).bind(id).fetch_optional(&mut **tx).await,
            None => sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await,
        }
        .map_err(|err| classify_sqlx_error(category, err))?;

        row.as_ref().map(row_to_record).transpose().map_err(StoreError::from)
    }

    async fn upsert(&self, category: Category, record: &Record) -> Result<(), StoreError> {
        let table = category.table_name();
        let mut pending = self.pending.lock().await;
        let mut tx = match pending.take() {
            Some(tx) => tx,
            None => self.pool.begin().await?,
        };

        for statement in create_table_sql(category) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        let sql = format!(
            "INSERT INTO {table} (url, title, id) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET url = excluded.url, title = excluded.title"
        );
        sqlx::query(&sql)
            .bind(&record.url)
            .bind(&record.title)
            .bind(&record.id)
            .execute(&mut *tx)
            .await?;

        *pending = Some(tx);
        Ok(())
    }

    async fn commit(&self) -> Result<(), StoreError> {
        let mut pending = self.pending.lock().await;
        if let Some(tx) = pending.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn ensure_table(&self, category: Category) -> Result<(), StoreError> {
        let mut pending = self.pending.lock().await;
        match pending.as_mut() {
            Some(tx) => {
                for statement in create_table_sql(category) {
                    sqlx::query(&statement).execute(&mut **tx).await?;
                }
            }
            None => {
                let mut tx = self.pool.begin().await?;
                for statement in create_table_sql(category) {
                    sqlx::query(&statement).execute(&mut *tx).await?;
                }
                tx.commit().await?;
            }
        }
        Ok(())
    }

    async fn list(&self, category: Category) -> Result<Vec<Record>, StoreError> {
        let sql = format!(
            "SELECT id, title, url FROM {} ORDER BY rowid",
            category.table_name()
        );
        let mut pending = self.pending.lock().await;
        let rows = match pending.as_mut() {
            Some(tx) => sqlx::query(&sql).fetch_all(&mut **tx).await,
            None => sqlx::query(&sql).fetch_all(&self.pool).await,
        }
        .map_err(|err| classify_sqlx_error(category, err))?;

        rows.iter()
            .map(row_to_record)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }
}

/// Process-local store with the same table semantics as the SQLite store.
/// Writes are visible immediately; `commit` only counts.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    tables: Mutex<BTreeMap<Category, Vec<Record>>>,
    commits: Mutex<usize>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn commit_count(&self) -> usize {
        *self.commits.lock().await
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn find(&self, category: Category, id: &str) -> Result<Option<Record>, StoreError> {
        let tables = self.tables.lock().await;
        let table = tables.get(&category).ok_or(StoreError::MissingTable {
            category,
            table: category.table_name(),
        })?;
        Ok(table.iter().find(|r| r.id == id).cloned())
    }

    async fn upsert(&self, category: Category, record: &Record) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let table = tables.entry(category).or_default();
        match table.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => table.push(record.clone()),
        }
        Ok(())
    }

    async fn commit(&self) -> Result<(), StoreError> {
        *self.commits.lock().await += 1;
        Ok(())
    }

    async fn ensure_table(&self, category: Category) -> Result<(), StoreError> {
        self.tables.lock().await.entry(category).or_default();
        Ok(())
    }

    async fn list(&self, category: Category) -> Result<Vec<Record>, StoreError> {
        let tables = self.tables.lock().await;
        tables.get(&category).cloned().ok_or(StoreError::MissingTable {
            category,
            table: category.table_name(),
        })
    }
}
