// ABOUTME: Source side of a migration run: full-table scans into schema-free records
// ABOUTME: Defines the Source trait and the PostgreSQL reader behind it

pub mod postgres;

pub use postgres::PostgresSource;

use crate::record::Record;
use crate::tables::TableDescriptor;
use anyhow::Result;
use async_trait::async_trait;

/// Read access to the tables being migrated
#[async_trait]
pub trait Source: Send + Sync {
    /// Read every row of `table` in one scan, in scan order
    async fn read_table(&self, table: &TableDescriptor) -> Result<Vec<Record>>;

    /// Number of rows currently in `table`
    async fn count_rows(&self, table: &TableDescriptor) -> Result<u64>;

    /// Release the underlying connection. Idempotent.
    async fn close(&mut self);
}
