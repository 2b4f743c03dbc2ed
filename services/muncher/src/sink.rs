//! Label sink: append-only writes into the downstream relational store.
//!
//! The connection loop is generic over [`LabelStore`] so the stream path
//! can be exercised without Postgres; production uses [`PgLabelStore`].

use lm_protocol::Label;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
}

/// A validated label as stored in the `label` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelRow {
    pub src: String,
    pub uri: String,
    pub cid: String,
    pub val: String,
    pub neg: bool,
    pub cts: String,
    pub exp: Option<String>,
}

impl LabelRow {
    pub fn from_label(label: &Label) -> Self {
        Self {
            src: label.src.clone(),
            uri: label.uri.clone(),
            cid: label.cid.clone().unwrap_or_default(),
            val: label.val.clone(),
            neg: label.neg.unwrap_or(false),
            cts: label.cts.clone(),
            exp: label.exp.clone(),
        }
    }
}

pub trait LabelStore: Send + Sync + 'static {
    fn insert(&self, row: LabelRow) -> impl Future<Output = Result<(), SinkError>> + Send;

    /// Release the underlying handle on shutdown.
    fn close(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Inserts into `{schema}.label`; duplicates from replay are tolerated by
/// the downstream store, so no deduplication happens here.
pub struct PgLabelStore {
    pool: PgPool,
    insert_sql: String,
}

impl PgLabelStore {
    pub async fn connect(database_url: &str, schema: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new().max_connections(10).connect(database_url).await?;
        Ok(Self::with_pool(pool, schema))
    }

    pub fn with_pool(pool: PgPool, schema: &str) -> Self {
        let insert_sql = format!(
            "INSERT INTO {schema}.label (src, uri, cid, val, neg, cts, exp)
             VALUES ($1, $2, $3, $4, $5, $6, $7)"
        );
        Self { pool, insert_sql }
    }
}

impl LabelStore for PgLabelStore {
    async fn insert(&self, row: LabelRow) -> Result<(), SinkError> {
        sqlx::query(sqlx::AssertSqlSafe(self.insert_sql.as_str()))
            .bind(&row.src)
            .bind(&row.uri)
            .bind(&row.cid)
            .bind(&row.val)
            .bind(row.neg)
            .bind(&row.cts)
            .bind(&row.exp)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
