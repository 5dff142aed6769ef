//! The TSDB adapter contract (spec.md §4.8): connect/create-db/create-table/
//! insert/insert_many/fetch/fetch_batch/list_tables/get_columns/commit/close.
//! Grounded on `examples/original_source/src/adapters/tdengine.py`'s
//! `TaosAdapter` for the operation set, generalized to an async trait so
//! other backends (a second adapter was explicitly left out of scope, but
//! the seam is here) can be swapped in without touching the ingest runtime.

use std::collections::HashMap;

use async_trait::async_trait;
use chomp_core::{FieldValue, Ingester, Interval};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TsdbError {
    #[error("database connection error")]
    Connection(#[source] diesel::result::ConnectionError),
    #[error("database query error")]
    Query(#[source] diesel::result::Error),
    #[error("connection pool error")]
    Pool(#[source] diesel::r2d2::PoolError),
    #[error("background task panicked")]
    Join(#[source] tokio::task::JoinError),
    #[error("invalid identifier: {0} (must be ascii alphanumeric/underscore, not starting with a digit)")]
    InvalidIdentifier(String),
    #[error("failed to serialize row payload")]
    Serialize(#[source] serde_json::Error),
    #[error("table {0} not found after auto-create retry")]
    TableStillMissing(String),
    #[error("database {0} already exists")]
    DatabaseAlreadyExists(String),
}

impl From<diesel::result::Error> for TsdbError {
    fn from(e: diesel::result::Error) -> Self {
        TsdbError::Query(e)
    }
}

/// One row of a TSDB table: the bucket timestamp plus one value per
/// non-transient Field, keyed by field name.
#[derive(Debug, Clone)]
pub struct TsdbRow {
    pub ts: DateTime<Utc>,
    pub values: HashMap<String, FieldValue>,
}

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
}

#[async_trait]
pub trait TsdbAdapter: Send + Sync {
    async fn connect(&mut self) -> Result<(), TsdbError>;
    async fn ensure_connected(&self) -> Result<(), TsdbError>;
    async fn create_db(&self, name: &str, force: bool) -> Result<(), TsdbError>;
    async fn use_db(&mut self, name: &str) -> Result<(), TsdbError>;
    async fn create_table(&self, ingester: &Ingester, name: Option<&str>) -> Result<(), TsdbError>;
    async fn insert(&self, ingester: &Ingester, row: &TsdbRow) -> Result<(), TsdbError>;
    async fn insert_many(&self, ingester: &Ingester, rows: &[TsdbRow]) -> Result<(), TsdbError>;
    async fn fetch(
        &self,
        table: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        agg_interval: Interval,
        columns: &[String],
    ) -> Result<Vec<TsdbRow>, TsdbError>;
    async fn fetch_batch(
        &self,
        tables: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        agg_interval: Interval,
        columns: &[String],
    ) -> Result<HashMap<String, Vec<TsdbRow>>, TsdbError>;
    async fn list_tables(&self) -> Result<Vec<String>, TsdbError>;
    async fn get_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, TsdbError>;
    async fn commit(&self) -> Result<(), TsdbError>;
    async fn close(&mut self) -> Result<(), TsdbError>;
}

/// `CREATE TABLE`/`jsonb_populate_recordset` identifiers are interpolated
/// into raw SQL, so every table/column name is validated against this
/// before it ever reaches a query string.
pub fn sanitize_identifier(name: &str) -> Result<&str, TsdbError> {
    let mut chars = name.chars();
    let ok = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if ok {
        Ok(name)
    } else {
        Err(TsdbError::InvalidIdentifier(name.to_string()))
    }
}

/// Postgres column type for a Field type (spec.md §6's type table).
pub fn pg_type(ty: chomp_core::FieldType) -> &'static str {
    use chomp_core::FieldType::*;
    match ty {
        Int8 | Int16 => "smallint",
        Uint8 | Uint16 | Int32 => "integer",
        Uint32 | Int64 => "bigint",
        Uint64 => "numeric",
        Float32 => "real",
        Float64 => "double precision",
        Bool => "boolean",
        Timestamp => "timestamptz",
        String => "text",
        Binary | Varbinary => "bytea",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_rejects_leading_digit_and_punctuation() {
        assert!(sanitize_identifier("price_usd").is_ok());
        assert!(sanitize_identifier("_private").is_ok());
        assert!(sanitize_identifier("1bad").is_err());
        assert!(sanitize_identifier("bad; drop table x").is_err());
        assert!(sanitize_identifier("").is_err());
    }
}
