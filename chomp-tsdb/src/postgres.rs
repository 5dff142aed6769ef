//! Postgres reference adapter: the one concrete `TsdbAdapter` this crate
//! ships (spec.md §4.8 names the contract; a live adapter beyond it is
//! explicitly out of scope, but one reference implementation is needed to
//! exercise the contract end to end). Dynamic per-ingester schemas rule out
//! diesel's compile-time query DSL, so every statement here is raw SQL
//! built from [`sanitize_identifier`]-checked names and bound parameters,
//! following `mmoldb-db`'s own use of `diesel::sql_query` for
//! `information_schema` introspection. The row shape problem -- diesel's
//! `QueryableByName` needs a struct known at compile time, and our columns
//! aren't -- is worked around by wrapping each row in `to_jsonb(...)` so
//! every query, regardless of the underlying table's columns, returns a
//! single `jsonb` column diesel can deserialize uniformly.

use std::collections::HashMap;

use async_trait::async_trait;
use chomp_core::{Field, FieldValue, Ingester, Interval};
use chrono::{DateTime, Utc};
use diesel::r2d2::{ConnectionManager, Pool, PoolError};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::{BigInt, Jsonb, Text, Timestamptz};
use diesel::{sql_query, PgConnection, QueryableByName, RunQueryDsl};

use crate::adapter::{sanitize_identifier, pg_type, ColumnInfo, TsdbAdapter, TsdbError, TsdbRow};

pub type ConnectionPool = Pool<ConnectionManager<PgConnection>>;

pub struct PostgresAdapter {
    url: String,
    pool: Option<ConnectionPool>,
    max_size: u32,
}

impl PostgresAdapter {
    pub fn new(url: impl Into<String>, max_size: u32) -> Self {
        Self {
            url: url.into(),
            pool: None,
            max_size,
        }
    }

    /// Builds the connection string from `POSTGRES_*` environment variables
    /// rather than taking one directly, matching how mmoldb-app bootstraps
    /// its pool from the environment instead of a config file value.
    pub fn from_env(max_size: u32) -> Self {
        Self::new(crate::url::postgres_url_from_environment(), max_size)
    }

    fn pool(&self) -> Result<ConnectionPool, TsdbError> {
        self.pool.clone().ok_or_else(|| {
            TsdbError::Connection(diesel::result::ConnectionError::BadConnection(
                "adapter not connected".to_string(),
            ))
        })
    }

    fn build_pool(url: &str, max_size: u32) -> Result<ConnectionPool, PoolError> {
        let manager = ConnectionManager::new(url);
        Pool::builder().max_size(max_size).build(manager)
    }

    async fn run_blocking<F, T>(&self, f: F) -> Result<T, TsdbError>
    where
        F: FnOnce(&mut PgConnection) -> Result<T, TsdbError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool()?;
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(TsdbError::Pool)?;
            f(&mut conn)
        })
        .await
        .map_err(TsdbError::Join)?
    }
}

#[derive(QueryableByName)]
struct JsonRow {
    #[diesel(sql_type = Jsonb)]
    row: serde_json::Value,
}

#[derive(QueryableByName)]
struct NameRow {
    #[diesel(sql_type = Text)]
    name: String,
}

#[derive(QueryableByName)]
struct ColumnRow {
    #[diesel(sql_type = Text)]
    column_name: String,
    #[diesel(sql_type = Text)]
    data_type: String,
    #[diesel(sql_type = Text)]
    is_nullable: String,
}

fn row_to_json(row: &TsdbRow) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    map.insert("ts".to_string(), serde_json::Value::String(row.ts.to_rfc3339()));
    for (name, value) in &row.values {
        map.insert(name.clone(), field_value_to_json(value));
    }
    serde_json::Value::Object(map)
}

fn field_value_to_json(value: &FieldValue) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

fn json_row_to_tsdb_row(value: serde_json::Value) -> Option<TsdbRow> {
    let obj = value.as_object()?;
    let ts = obj.get("ts")?.as_str()?;
    let ts = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);
    let values = obj
        .iter()
        .filter(|(k, _)| k.as_str() != "ts")
        .filter_map(|(k, v)| json_to_field_value(v).map(|fv| (k.clone(), fv)))
        .collect();
    Some(TsdbRow { ts, values })
}

fn json_to_field_value(value: &serde_json::Value) -> Option<FieldValue> {
    use serde_json::Value as J;
    match value {
        J::Null => None,
        J::Bool(b) => Some(FieldValue::Bool(*b)),
        J::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(FieldValue::Int(i))
            } else {
                n.as_f64().map(FieldValue::Float)
            }
        }
        J::String(s) => Some(FieldValue::String(s.clone())),
        _ => None,
    }
}

fn is_missing_table(err: &DieselError) -> bool {
    matches!(
        err,
        DieselError::DatabaseError(DatabaseErrorKind::Unknown, info)
            if info.message().contains("does not exist")
    )
}

fn create_table_sql(table: &str, fields: &[Field]) -> Result<String, TsdbError> {
    let table = sanitize_identifier(table)?;
    let mut columns = vec!["ts timestamptz NOT NULL".to_string()];
    for field in fields {
        if field.transient {
            continue;
        }
        let name = sanitize_identifier(&field.name)?;
        columns.push(format!("\"{name}\" {}", pg_type(field.ty)));
    }
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS \"{table}\" ({})",
        columns.join(", ")
    ))
}

#[async_trait]
impl TsdbAdapter for PostgresAdapter {
    async fn connect(&mut self) -> Result<(), TsdbError> {
        self.pool = Some(Self::build_pool(&self.url, self.max_size).map_err(|e| {
            TsdbError::Connection(diesel::result::ConnectionError::BadConnection(e.to_string()))
        })?);
        Ok(())
    }

    async fn ensure_connected(&self) -> Result<(), TsdbError> {
        self.pool()?.get().map_err(TsdbError::Pool)?;
        Ok(())
    }

    /// Postgres has no `CREATE DATABASE IF NOT EXISTS`; existence is
    /// checked against `pg_database` first, matching the adapter contract's
    /// `force` flag (skip rather than error if it already exists).
    async fn create_db(&self, name: &str, force: bool) -> Result<(), TsdbError> {
        let name = sanitize_identifier(name)?.to_string();
        self.run_blocking(move |conn| {
            let exists: i64 = sql_query("SELECT count(*)::bigint AS count FROM pg_database WHERE datname = $1")
                .bind::<Text, _>(&name)
                .get_result::<CountRow>(conn)
                .map(|r| r.count)?;
            if exists > 0 {
                if force {
                    return Ok(());
                }
                return Err(TsdbError::DatabaseAlreadyExists(name));
            }
            sql_query(format!("CREATE DATABASE \"{name}\"")).execute(conn)?;
            Ok(())
        })
        .await
    }

    /// No-op: the connection string already targets one database per
    /// adapter instance, so "use" just means "already there".
    async fn use_db(&mut self, name: &str) -> Result<(), TsdbError> {
        log::debug!("use_db({name}) is a no-op for the Postgres adapter");
        Ok(())
    }

    async fn create_table(&self, ingester: &Ingester, name: Option<&str>) -> Result<(), TsdbError> {
        let table = name.unwrap_or_else(|| ingester.table_name()).to_string();
        let sql = create_table_sql(&table, &ingester.fields)?;
        self.run_blocking(move |conn| {
            sql_query(sql).execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn insert(&self, ingester: &Ingester, row: &TsdbRow) -> Result<(), TsdbError> {
        self.insert_many(ingester, std::slice::from_ref(row)).await
    }

    async fn insert_many(&self, ingester: &Ingester, rows: &[TsdbRow]) -> Result<(), TsdbError> {
        if rows.is_empty() {
            return Ok(());
        }
        let table = sanitize_identifier(ingester.table_name())?.to_string();
        let payload = serde_json::Value::Array(rows.iter().map(row_to_json).collect());
        let sql = format!(
            "INSERT INTO \"{table}\" SELECT * FROM jsonb_populate_recordset(null::\"{table}\", $1::jsonb)"
        );

        let ingester_for_retry = ingester.clone();
        let sql_for_retry = sql.clone();
        let payload_for_retry = payload.clone();

        let first = {
            let sql = sql.clone();
            let payload = payload.clone();
            self.run_blocking(move |conn| {
                sql_query(sql).bind::<Jsonb, _>(payload).execute(conn)?;
                Ok(())
            })
            .await
        };

        match first {
            Err(TsdbError::Query(e)) if is_missing_table(&e) => {
                self.create_table(&ingester_for_retry, Some(&table)).await?;
                self.run_blocking(move |conn| {
                    sql_query(sql_for_retry)
                        .bind::<Jsonb, _>(payload_for_retry)
                        .execute(conn)?;
                    Ok(())
                })
                .await
            }
            other => other,
        }
    }

    async fn fetch(
        &self,
        table: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        agg_interval: Interval,
        columns: &[String],
    ) -> Result<Vec<TsdbRow>, TsdbError> {
        let table = sanitize_identifier(table)?.to_string();
        let select_cols = if columns.is_empty() {
            "t.*".to_string()
        } else {
            let mut checked = Vec::with_capacity(columns.len());
            for c in columns {
                checked.push(format!("\"{}\"", sanitize_identifier(c)?));
            }
            format!("{}, t.ts", checked.join(", "))
        };

        let step_secs = agg_interval.to_seconds().max(1);
        let sql = format!(
            "SELECT to_jsonb(row) AS row FROM ( \
                SELECT b.bucket AS ts, {select_cols} \
                FROM generate_series($1::timestamptz, $2::timestamptz, make_interval(secs => $3)) AS b(bucket) \
                LEFT JOIN LATERAL ( \
                    SELECT * FROM \"{table}\" WHERE ts <= b.bucket ORDER BY ts DESC LIMIT 1 \
                ) t ON true \
                ORDER BY b.bucket \
            ) row"
        );

        let rows = self
            .run_blocking(move |conn| {
                Ok(sql_query(sql)
                    .bind::<Timestamptz, _>(from)
                    .bind::<Timestamptz, _>(to)
                    .bind::<BigInt, _>(step_secs)
                    .load::<JsonRow>(conn)?)
            })
            .await?;

        Ok(rows.into_iter().filter_map(|r| json_row_to_tsdb_row(r.row)).collect())
    }

    async fn fetch_batch(
        &self,
        tables: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        agg_interval: Interval,
        columns: &[String],
    ) -> Result<HashMap<String, Vec<TsdbRow>>, TsdbError> {
        let mut out = HashMap::with_capacity(tables.len());
        for table in tables {
            let rows = self.fetch(table, from, to, agg_interval, columns).await?;
            out.insert(table.clone(), rows);
        }
        Ok(out)
    }

    async fn list_tables(&self) -> Result<Vec<String>, TsdbError> {
        let rows = self
            .run_blocking(|conn| {
                Ok(sql_query(
                    "SELECT table_name AS name FROM information_schema.tables \
                     WHERE table_schema = 'public' ORDER BY table_name",
                )
                .load::<NameRow>(conn)?)
            })
            .await?;
        Ok(rows.into_iter().map(|r| r.name).collect())
    }

    async fn get_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, TsdbError> {
        let table = sanitize_identifier(table)?.to_string();
        let rows = self
            .run_blocking(move |conn| {
                Ok(sql_query(
                    "SELECT column_name, data_type, is_nullable FROM information_schema.columns \
                     WHERE table_schema = 'public' AND table_name = $1 ORDER BY ordinal_position",
                )
                .bind::<Text, _>(table)
                .load::<ColumnRow>(conn)?)
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| ColumnInfo {
                name: r.column_name,
                data_type: r.data_type,
                is_nullable: r.is_nullable == "YES",
            })
            .collect())
    }

    /// A no-op: every statement above runs and commits on its own
    /// connection outside an explicit transaction.
    async fn commit(&self) -> Result<(), TsdbError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TsdbError> {
        self.pool = None;
        Ok(())
    }
}

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chomp_core::FieldType;

    #[test]
    fn create_table_sql_skips_transient_fields() {
        let fields = vec![
            Field {
                name: "px".to_string(),
                ty: FieldType::Float64,
                target: None,
                selector: None,
                params: chomp_core::Params::None,
                method: None,
                headers: None,
                handler: None,
                reducer: None,
                transformers: vec![],
                transient: false,
                value: None,
                id: String::new(),
            },
            Field {
                name: "scratch".to_string(),
                ty: FieldType::String,
                target: None,
                selector: None,
                params: chomp_core::Params::None,
                method: None,
                headers: None,
                handler: None,
                reducer: None,
                transformers: vec![],
                transient: true,
                value: None,
                id: String::new(),
            },
        ];
        let sql = create_table_sql("prices", &fields).unwrap();
        assert!(sql.contains("\"px\" double precision"));
        assert!(!sql.contains("scratch"));
    }

    #[test]
    fn row_json_roundtrips_scalar_values() {
        let mut values = HashMap::new();
        values.insert("px".to_string(), FieldValue::Float(1.5));
        let row = TsdbRow { ts: Utc::now(), values };
        let json = row_to_json(&row);
        let back = json_row_to_tsdb_row(json).unwrap();
        assert_eq!(back.values.get("px"), Some(&FieldValue::Float(1.5)));
    }
}
