//! Postgres warehouse access: table probing, load planning, bulk insert,
//! staging-table merge, and full-table snapshot reads.

use std::time::Duration;

use bigdecimal::ToPrimitive;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use cmw_core::{canonical_column_name, RecordSet, Scalar};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub use sqlx::PgPool;

pub const CRATE_NAME: &str = "cmw-warehouse";

/// Keep well under Postgres' 65535 bind-parameter ceiling per statement.
const MAX_BINDS_PER_INSERT: usize = 60_000;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("table {0} does not exist; provision it with the migration tool first")]
    TableMissing(String),
    #[error("staging upload to {table} failed")]
    StagingUpload {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("merge into {table} failed")]
    Merge {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Connect with a small pool; `None` means the warehouse is unreachable and
/// the caller should degrade to pass-through mode.
pub async fn connect(database_url: &str) -> Option<PgPool> {
    match PgPoolOptions::new()
        .max_connections(4)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
    {
        Ok(pool) => Some(pool),
        Err(err) => {
            warn!(error = %err, "could not connect to warehouse");
            None
        }
    }
}

/// Probe snapshot of one target table, taken once per sync cycle.
#[derive(Debug, Clone)]
pub struct TableStatus {
    /// The table's name exactly as catalogued, for later quoted references.
    pub name: String,
    pub row_count: i64,
}

/// Case-insensitive existence + row-count probe. `Ok(None)` means the table
/// has not been provisioned.
pub async fn table_status(pool: &PgPool, table: &str) -> Result<Option<TableStatus>, sqlx::Error> {
    let resolved: Option<String> = sqlx::query_scalar(
        r#"
        SELECT table_name
          FROM information_schema.tables
         WHERE table_schema = current_schema()
           AND upper(table_name) = upper($1)
        "#,
    )
    .bind(table)
    .fetch_optional(pool)
    .await?;

    let Some(name) = resolved else {
        return Ok(None);
    };

    let row_count: i64 =
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", quote_ident(&name)))
            .fetch_one(pool)
            .await?;

    Ok(Some(TableStatus { name, row_count }))
}

/// Live canonical column list for a table, in ordinal order.
pub async fn table_columns(pool: &PgPool, table: &str) -> Result<Vec<String>, sqlx::Error> {
    let names: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT column_name
          FROM information_schema.columns
         WHERE table_schema = current_schema()
           AND upper(table_name) = upper($1)
         ORDER BY ordinal_position
        "#,
    )
    .bind(table)
    .fetch_all(pool)
    .await?;
    Ok(names.iter().map(|n| canonical_column_name(n)).collect())
}

/// Load strategy for one sync cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadPlan {
    /// Target table missing: hard precondition failure for this source.
    Abort,
    /// Straight insert into an existing empty table.
    Bulk,
    /// Plain insert into a non-empty table; duplicates possible and accepted.
    Append,
    /// Staged upsert keyed on the canonical unique column.
    Merge { key: String },
}

/// Decide the load strategy from observed table state. Pure so every
/// combination is enumerable under test.
pub fn plan_load(
    table_exists: bool,
    row_count: i64,
    unique_key: Option<&str>,
    record_columns: &[String],
) -> LoadPlan {
    if !table_exists {
        return LoadPlan::Abort;
    }
    if row_count == 0 {
        return LoadPlan::Bulk;
    }
    if let Some(key) = unique_key {
        let canonical = canonical_column_name(key);
        if record_columns.iter().any(|c| *c == canonical) {
            return LoadPlan::Merge { key: canonical };
        }
    }
    LoadPlan::Append
}

/// Quote an identifier for Postgres, tolerating reserved words (`from`, `to`)
/// among column names.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quoted_column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Multi-row parameterized INSERT for `row_count` rows of `columns` columns.
pub fn build_insert_sql(table: &str, columns: &[String], row_count: usize) -> String {
    let mut placeholders = Vec::with_capacity(row_count);
    let mut n = 1;
    for _ in 0..row_count {
        let row: Vec<String> = columns
            .iter()
            .map(|_| {
                let p = format!("${n}");
                n += 1;
                p
            })
            .collect();
        placeholders.push(format!("({})", row.join(", ")));
    }
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_ident(table),
        quoted_column_list(columns),
        placeholders.join(", ")
    )
}

/// One MERGE statement: match on the unique key, update every non-key column,
/// insert the full row otherwise.
pub fn build_merge_sql(table: &str, stage: &str, key: &str, columns: &[String]) -> String {
    let update_clause = columns
        .iter()
        .filter(|c| *c != key)
        .map(|c| format!("{ident} = s.{ident}", ident = quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let insert_cols = quoted_column_list(columns);
    let insert_vals = columns
        .iter()
        .map(|c| format!("s.{}", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "MERGE INTO {table} t USING {stage} s ON t.{key} = s.{key} \
         WHEN MATCHED THEN UPDATE SET {update_clause} \
         WHEN NOT MATCHED THEN INSERT ({insert_cols}) VALUES ({insert_vals})",
        table = quote_ident(table),
        stage = quote_ident(stage),
        key = quote_ident(key),
    )
}

/// Staging table scoped to one merge invocation: target name plus a random
/// suffix so re-runs and crashed predecessors cannot collide.
pub fn staging_table_name(table: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_STAGE_{}", table, &suffix[..8]).to_ascii_uppercase()
}

fn bind_scalar<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    value: &'q Scalar,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    match value {
        Scalar::Null => query.bind(Option::<String>::None),
        Scalar::Bool(b) => query.bind(*b),
        Scalar::Int(i) => query.bind(*i),
        Scalar::Float(f) => query.bind(*f),
        Scalar::Text(s) => query.bind(s.as_str()),
    }
}

/// Insert every row of the record set, chunked to stay within the bind
/// parameter limit. Returns the number of rows written.
pub async fn insert_rows(
    pool: &PgPool,
    table: &str,
    records: &RecordSet,
) -> Result<u64, sqlx::Error> {
    if records.is_empty() {
        return Ok(0);
    }
    let columns = records.columns();
    let rows_per_chunk = (MAX_BINDS_PER_INSERT / columns.len()).max(1);

    let mut written = 0u64;
    for chunk in records.rows().chunks(rows_per_chunk) {
        let sql = build_insert_sql(table, columns, chunk.len());
        let mut query = sqlx::query(&sql);
        for row in chunk {
            for value in row {
                query = bind_scalar(query, value);
            }
        }
        let result = query.execute(pool).await?;
        written += result.rows_affected();
    }
    Ok(written)
}

/// Staged upsert: create a staging table with the target's column types, load
/// the record set into it, run one MERGE, and always attempt to drop the
/// staging table afterwards.
pub async fn merge_rows(
    pool: &PgPool,
    table: &str,
    records: &RecordSet,
    key: &str,
) -> Result<u64, WarehouseError> {
    let stage = staging_table_name(table);
    let result = stage_and_merge(pool, table, &stage, records, key).await;
    drop_staging(pool, &stage).await;
    result
}

async fn stage_and_merge(
    pool: &PgPool,
    table: &str,
    stage: &str,
    records: &RecordSet,
    key: &str,
) -> Result<u64, WarehouseError> {
    let create_sql = format!(
        "CREATE TABLE {} AS SELECT {} FROM {} WITH NO DATA",
        quote_ident(stage),
        quoted_column_list(records.columns()),
        quote_ident(table),
    );
    sqlx::query(&create_sql)
        .execute(pool)
        .await
        .map_err(|source| WarehouseError::StagingUpload {
            table: table.to_string(),
            source,
        })?;

    insert_rows(pool, stage, records)
        .await
        .map_err(|source| WarehouseError::StagingUpload {
            table: table.to_string(),
            source,
        })?;

    let merge_sql = build_merge_sql(table, stage, key, records.columns());
    let result = sqlx::query(&merge_sql)
        .execute(pool)
        .await
        .map_err(|source| WarehouseError::Merge {
            table: table.to_string(),
            source,
        })?;
    Ok(result.rows_affected())
}

/// Best-effort cleanup. A failure here must never mask the merge outcome, but
/// it is surfaced as a warning instead of being swallowed.
async fn drop_staging(pool: &PgPool, stage: &str) {
    let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(stage));
    if let Err(err) = sqlx::query(&sql).execute(pool).await {
        warn!(stage, error = %err, "failed to drop staging table");
    }
}

/// Authoritative post-sync snapshot: the full deduplicated table, newest
/// first when a time column is known.
pub async fn fetch_snapshot(
    pool: &PgPool,
    table: &str,
    order_column: Option<&str>,
) -> Result<RecordSet, sqlx::Error> {
    let sql = match order_column {
        Some(col) => format!(
            "SELECT DISTINCT * FROM {} ORDER BY {} DESC",
            quote_ident(table),
            quote_ident(col)
        ),
        None => format!("SELECT DISTINCT * FROM {}", quote_ident(table)),
    };
    let rows = sqlx::query(&sql).fetch_all(pool).await?;

    let Some(first) = rows.first() else {
        return Ok(RecordSet::default());
    };
    let columns: Vec<String> = first
        .columns()
        .iter()
        .map(|c| canonical_column_name(c.name()))
        .collect();

    let mut out = RecordSet::new(columns);
    for row in &rows {
        let mut cells = std::collections::BTreeMap::new();
        for (idx, column) in row.columns().iter().enumerate() {
            let scalar = decode_cell(row, idx, column.type_info().name());
            cells.insert(canonical_column_name(column.name()), scalar);
        }
        out.push_row(cells)
            .map_err(|e| sqlx::Error::Decode(e.into()))?;
    }
    Ok(out)
}

/// Decode one cell into a [`Scalar`] by Postgres type name. Unknown types
/// degrade to text, then null.
fn decode_cell(row: &PgRow, idx: usize, type_name: &str) -> Scalar {
    match type_name {
        "BOOL" => opt(row.try_get::<Option<bool>, _>(idx)).map_or(Scalar::Null, Scalar::Bool),
        "INT2" => opt(row.try_get::<Option<i16>, _>(idx))
            .map_or(Scalar::Null, |v| Scalar::Int(v as i64)),
        "INT4" => opt(row.try_get::<Option<i32>, _>(idx))
            .map_or(Scalar::Null, |v| Scalar::Int(v as i64)),
        "INT8" => opt(row.try_get::<Option<i64>, _>(idx)).map_or(Scalar::Null, Scalar::Int),
        "FLOAT4" => opt(row.try_get::<Option<f32>, _>(idx))
            .map_or(Scalar::Null, |v| Scalar::Float(v as f64)),
        "FLOAT8" => opt(row.try_get::<Option<f64>, _>(idx)).map_or(Scalar::Null, Scalar::Float),
        "NUMERIC" => opt(row.try_get::<Option<sqlx::types::BigDecimal>, _>(idx))
            .and_then(|v| v.to_f64())
            .map_or(Scalar::Null, Scalar::Float),
        "TIMESTAMPTZ" => opt(row.try_get::<Option<DateTime<Utc>>, _>(idx))
            .map_or(Scalar::Null, |v| Scalar::Text(v.to_rfc3339())),
        "TIMESTAMP" => opt(row.try_get::<Option<NaiveDateTime>, _>(idx))
            .map_or(Scalar::Null, |v| Scalar::Text(v.to_string())),
        "DATE" => opt(row.try_get::<Option<NaiveDate>, _>(idx))
            .map_or(Scalar::Null, |v| Scalar::Text(v.to_string())),
        "JSON" | "JSONB" => opt(row.try_get::<Option<serde_json::Value>, _>(idx))
            .map_or(Scalar::Null, |v| Scalar::Text(v.to_string())),
        "UUID" => opt(row.try_get::<Option<sqlx::types::Uuid>, _>(idx))
            .map_or(Scalar::Null, |v| Scalar::Text(v.to_string())),
        _ => opt(row.try_get::<Option<String>, _>(idx)).map_or(Scalar::Null, Scalar::Text),
    }
}

fn opt<T>(result: Result<Option<T>, sqlx::Error>) -> Option<T> {
    result.ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn load_plan_is_deterministic_over_all_state_combinations() {
        let columns = cols(&["TIME", "CLOSE", "VOLUME"]);
        let cases: &[(bool, i64, Option<&str>, LoadPlan)] = &[
            // table missing always aborts, whatever else is observed
            (false, 0, None, LoadPlan::Abort),
            (false, 0, Some("TIME"), LoadPlan::Abort),
            (false, 42, None, LoadPlan::Abort),
            (false, 42, Some("TIME"), LoadPlan::Abort),
            // empty table: bulk, key or not
            (true, 0, None, LoadPlan::Bulk),
            (true, 0, Some("TIME"), LoadPlan::Bulk),
            (true, 0, Some("MISSING"), LoadPlan::Bulk),
            // populated table: merge only with a usable key
            (true, 1, Some("TIME"), LoadPlan::Merge { key: "TIME".into() }),
            (true, 42, Some("TIME"), LoadPlan::Merge { key: "TIME".into() }),
            (true, 42, None, LoadPlan::Append),
            (true, 42, Some("MISSING"), LoadPlan::Append),
        ];
        for (exists, rows, key, expected) in cases {
            assert_eq!(
                &plan_load(*exists, *rows, *key, &columns),
                expected,
                "exists={exists} rows={rows} key={key:?}"
            );
        }
    }

    #[test]
    fn load_plan_canonicalizes_the_key_before_matching() {
        let columns = cols(&["MERGE_KEY", "FROM", "TO"]);
        assert_eq!(
            plan_load(true, 7, Some("merge_key"), &columns),
            LoadPlan::Merge { key: "MERGE_KEY".into() }
        );
    }

    #[test]
    fn identifiers_are_quoted_against_reserved_words() {
        assert_eq!(quote_ident("FROM"), "\"FROM\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn insert_sql_numbers_placeholders_row_major() {
        let sql = build_insert_sql("COINDESK_NEWS", &cols(&["ID", "TITLE"]), 2);
        assert_eq!(
            sql,
            "INSERT INTO \"COINDESK_NEWS\" (\"ID\", \"TITLE\") VALUES ($1, $2), ($3, $4)"
        );
    }

    #[test]
    fn merge_sql_updates_every_column_except_the_key() {
        let sql = build_merge_sql(
            "COINDESK_HISTODAY",
            "COINDESK_HISTODAY_STAGE_AB12CD34",
            "TIME",
            &cols(&["TIME", "CLOSE", "FROM"]),
        );
        assert!(sql.starts_with(
            "MERGE INTO \"COINDESK_HISTODAY\" t USING \"COINDESK_HISTODAY_STAGE_AB12CD34\" s \
             ON t.\"TIME\" = s.\"TIME\""
        ));
        assert!(sql.contains("WHEN MATCHED THEN UPDATE SET \"CLOSE\" = s.\"CLOSE\", \"FROM\" = s.\"FROM\""));
        assert!(!sql.contains("\"TIME\" = s.\"TIME\","));
        assert!(sql.contains(
            "WHEN NOT MATCHED THEN INSERT (\"TIME\", \"CLOSE\", \"FROM\") \
             VALUES (s.\"TIME\", s.\"CLOSE\", s.\"FROM\")"
        ));
    }

    #[test]
    fn staging_names_carry_a_random_suffix() {
        let a = staging_table_name("COINDESK_HISTODAY");
        let b = staging_table_name("COINDESK_HISTODAY");
        assert!(a.starts_with("COINDESK_HISTODAY_STAGE_"));
        assert_eq!(a.len(), "COINDESK_HISTODAY_STAGE_".len() + 8);
        assert_ne!(a, b);
    }
}
