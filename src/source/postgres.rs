// ABOUTME: PostgreSQL source reader for full-table scans
// ABOUTME: Converts each row to an ordered JSON record with row_to_json

use super::Source;
use crate::postgres::{self, PgConnection, TlsPolicy};
use crate::record::Record;
use crate::tables::{validate_table_name, TableDescriptor};
use crate::utils::quote_ident;
use anyhow::{Context, Result};
use async_trait::async_trait;

/// Reads tables from a PostgreSQL database
///
/// Rows are fetched as `row_to_json(t)`, which keeps the column order of the
/// table and renders every PostgreSQL type (numeric, uuid, timestamptz, bytea,
/// arrays, enums) in the text form `json_populate_record` and PostgREST accept
/// on the way back in.
pub struct PostgresSource {
    conn: PgConnection,
}

impl PostgresSource {
    /// Connect to the source database, retrying transient failures
    pub async fn connect(url: &str, tls_policy: TlsPolicy) -> Result<Self> {
        let conn = postgres::connect_with_retry(url, tls_policy, "source").await?;
        Ok(Self { conn })
    }
}

/// `SELECT row_to_json(t) FROM "<table>" t`
pub fn select_all_sql(table: &str) -> String {
    format!("SELECT row_to_json(t) FROM {} t", quote_ident(table))
}

/// `SELECT COUNT(*) FROM "<table>"`
pub fn count_sql(table: &str) -> String {
    format!("SELECT COUNT(*) FROM {}", quote_ident(table))
}

#[async_trait]
impl Source for PostgresSource {
    async fn read_table(&self, table: &TableDescriptor) -> Result<Vec<Record>> {
        validate_table_name(&table.name)?;
        let client = self.conn.client()?;

        let rows = client
            .query(select_all_sql(&table.name).as_str(), &[])
            .await
            .with_context(|| format!("Failed to read table '{}' from source", table.name))?;

        rows.iter()
            .map(|row| {
                let value: serde_json::Value = row
                    .try_get(0)
                    .with_context(|| format!("Failed to decode row of '{}'", table.name))?;
                Record::from_json(value)
            })
            .collect()
    }

    async fn count_rows(&self, table: &TableDescriptor) -> Result<u64> {
        validate_table_name(&table.name)?;
        let client = self.conn.client()?;

        let row = client
            .query_one(count_sql(&table.name).as_str(), &[])
            .await
            .with_context(|| format!("Failed to count rows in source table '{}'", table.name))?;
        let count: i64 = row.get(0);

        Ok(count.max(0) as u64)
    }

    async fn close(&mut self) {
        self.conn.close().await;
    }
}
