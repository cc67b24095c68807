// ABOUTME: Direct PostgreSQL destination using INSERT ... ON CONFLICT upserts
// ABOUTME: Ships rows as one JSON parameter and lets json_populate_recordset type them

use super::Destination;
use crate::postgres::{self, PgConnection, TlsPolicy};
use crate::record::{column_union, records_to_json_array, Record};
use crate::tables::{validate_table_name, TableDescriptor};
use crate::utils::quote_ident;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio_postgres::error::SqlState;

/// SQLSTATEs that reject every row of a table alike
fn is_table_level_state(code: &SqlState) -> bool {
    *code == SqlState::UNDEFINED_TABLE
        || *code == SqlState::UNDEFINED_COLUMN
        || *code == SqlState::INSUFFICIENT_PRIVILEGE
}

/// Writes into a PostgreSQL database over a direct connection
///
/// A batch travels as a single `json` parameter. PostgreSQL casts each field to
/// the destination column type via `json_populate_recordset(NULL::"table", $1)`,
/// so the migrator never needs to know column types and the statement stays at
/// one bind parameter regardless of batch size.
pub struct PostgresDestination {
    conn: PgConnection,
}

impl PostgresDestination {
    pub async fn connect(url: &str, tls_policy: TlsPolicy) -> Result<Self> {
        let conn = postgres::connect_with_retry(url, tls_policy, "destination").await?;
        Ok(Self { conn })
    }
}

/// Which `json_populate_*` function feeds the INSERT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowSource {
    /// `json_populate_recordset` over a JSON array
    Set,
    /// `json_populate_record` over a single JSON object
    Single,
}

/// Build the upsert statement for `table` with the given column list
///
/// Non-key columns are overwritten from `EXCLUDED`; when every column is part
/// of the conflict key there is nothing to update and the statement uses
/// `DO NOTHING`.
///
/// # Examples
///
/// ```
/// # use pg_table_migrator::destination::postgres::{build_upsert_sql, RowSource};
/// let sql = build_upsert_sql(
///     "topics",
///     &["id".to_string(), "title".to_string()],
///     &["id".to_string()],
///     RowSource::Set,
/// )
/// .unwrap();
/// assert!(sql.ends_with(r#"ON CONFLICT ("id") DO UPDATE SET "title" = EXCLUDED."title""#));
/// ```
pub fn build_upsert_sql(
    table: &str,
    columns: &[String],
    conflict_key: &[String],
    source: RowSource,
) -> Result<String> {
    validate_table_name(table)?;
    if columns.is_empty() {
        bail!("Cannot build an upsert for '{}' without columns", table);
    }
    if conflict_key.is_empty() {
        bail!("Cannot build an upsert for '{}' without a conflict key", table);
    }
    for key in conflict_key {
        if !columns.contains(key) {
            bail!(
                "Rows for '{}' are missing conflict key column '{}'",
                table,
                key
            );
        }
    }

    let quoted_table = quote_ident(table);
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let conflict_list = conflict_key
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let populate = match source {
        RowSource::Set => "json_populate_recordset",
        RowSource::Single => "json_populate_record",
    };

    let mut sql = format!(
        "INSERT INTO {table} ({cols}) SELECT {cols} FROM {populate}(NULL::{table}, $1::json) \
         ON CONFLICT ({keys}) DO",
        table = quoted_table,
        cols = column_list,
        populate = populate,
        keys = conflict_list,
    );

    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !conflict_key.contains(c))
        .map(|c| format!("{col} = EXCLUDED.{col}", col = quote_ident(c)))
        .collect();

    if updates.is_empty() {
        sql.push_str(" NOTHING");
    } else {
        sql.push_str(" UPDATE SET ");
        sql.push_str(&updates.join(", "));
    }

    Ok(sql)
}

/// `TRUNCATE TABLE "<table>" RESTART IDENTITY CASCADE`
pub fn truncate_sql(table: &str) -> String {
    format!("TRUNCATE TABLE {} RESTART IDENTITY CASCADE", quote_ident(table))
}

/// Move the sequence named by `$1` past the largest `column` value in `table`
///
/// An empty table resets the sequence so its next value is 1.
pub fn sync_sequence_sql(table: &str, column: &str) -> String {
    format!(
        "SELECT setval($1::text::regclass, GREATEST(COALESCE(MAX({col}), 0), 1), \
         MAX({col}) IS NOT NULL) FROM {table}",
        col = quote_ident(column),
        table = quote_ident(table),
    )
}

#[async_trait]
impl Destination for PostgresDestination {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    async fn count_rows(&self, table: &TableDescriptor) -> Result<u64> {
        validate_table_name(&table.name)?;
        let client = self.conn.client()?;

        let row = client
            .query_one(crate::source::postgres::count_sql(&table.name).as_str(), &[])
            .await
            .with_context(|| {
                format!("Failed to count rows in destination table '{}'", table.name)
            })?;
        let count: i64 = row.get(0);

        Ok(count.max(0) as u64)
    }

    async fn clear_table(&self, table: &TableDescriptor) -> Result<()> {
        validate_table_name(&table.name)?;
        let client = self.conn.client()?;

        client
            .batch_execute(&truncate_sql(&table.name))
            .await
            .with_context(|| format!("Failed to truncate destination table '{}'", table.name))?;

        Ok(())
    }

    async fn upsert_many(
        &self,
        table: &TableDescriptor,
        records: &[Record],
    ) -> Result<Option<u64>> {
        if records.is_empty() {
            return Ok(Some(0));
        }
        let client = self.conn.client()?;

        let columns = column_union(records);
        let sql = build_upsert_sql(
            &table.name,
            &columns,
            &table.conflict_key,
            RowSource::Set,
        )?;
        let payload = records_to_json_array(records);

        let affected = client
            .execute(sql.as_str(), &[&payload])
            .await
            .with_context(|| {
                format!(
                    "Failed to upsert {} rows into '{}'",
                    records.len(),
                    table.name
                )
            })?;

        Ok(Some(affected))
    }

    async fn upsert_one(&self, table: &TableDescriptor, record: &Record) -> Result<()> {
        let client = self.conn.client()?;

        let columns: Vec<String> = record.columns().map(str::to_string).collect();
        let sql = build_upsert_sql(
            &table.name,
            &columns,
            &table.conflict_key,
            RowSource::Single,
        )?;
        let payload = record.clone().into_json();

        client
            .execute(sql.as_str(), &[&payload])
            .await
            .with_context(|| {
                format!(
                    "Failed to upsert {} into '{}'",
                    record.identity(&table.conflict_key),
                    table.name
                )
            })?;

        Ok(())
    }

    fn is_table_unavailable(&self, error: &anyhow::Error) -> bool {
        error
            .chain()
            .filter_map(|cause| cause.downcast_ref::<tokio_postgres::Error>())
            .filter_map(|e| e.code())
            .any(is_table_level_state)
    }

    async fn sync_identity(&self, table: &TableDescriptor) -> Result<()> {
        validate_table_name(&table.name)?;
        let client = self.conn.client()?;

        for column in &table.conflict_key {
            let row = client
                .query_one(
                    "SELECT pg_get_serial_sequence($1, $2)",
                    &[&quote_ident(&table.name), column],
                )
                .await
                .with_context(|| {
                    format!("Failed to look up the sequence of '{}.{}'", table.name, column)
                })?;
            let Some(sequence) = row.get::<_, Option<String>>(0) else {
                continue;
            };

            client
                .query_one(
                    sync_sequence_sql(&table.name, column).as_str(),
                    &[&sequence],
                )
                .await
                .with_context(|| format!("Failed to advance sequence {}", sequence))?;
            tracing::debug!("  Advanced {} past the copied rows", sequence);
        }

        Ok(())
    }

    async fn close(&mut self) {
        self.conn.close().await;
    }
}
