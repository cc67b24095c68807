// ABOUTME: Destination side of a migration run: counting, clearing, and upserting rows
// ABOUTME: Defines the Destination trait with PostgreSQL and PostgREST implementations

pub mod postgres;
pub mod rest;

pub use postgres::PostgresDestination;
pub use rest::RestDestination;

use crate::record::Record;
use crate::tables::TableDescriptor;
use anyhow::Result;
use async_trait::async_trait;

/// Write access to the database receiving the migrated rows
///
/// Every write is an upsert on the table's conflict key, so replaying a run is
/// safe.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Short name for log lines ("postgres", "rest")
    fn kind(&self) -> &'static str;

    /// Number of rows currently in `table`
    async fn count_rows(&self, table: &TableDescriptor) -> Result<u64>;

    /// Remove every row of `table` (and, where supported, reset identities and cascade)
    async fn clear_table(&self, table: &TableDescriptor) -> Result<()>;

    /// Whether [`Destination::clear_table`] also removes rows in referencing tables
    ///
    /// When it does not, a parent table can only be cleared after its children,
    /// so the migrator clears every table up front in reverse order.
    fn clear_cascades(&self) -> bool {
        true
    }

    /// Upsert a whole batch in one call
    ///
    /// Returns the affected row count when the destination reports one.
    async fn upsert_many(
        &self,
        table: &TableDescriptor,
        records: &[Record],
    ) -> Result<Option<u64>>;

    /// Upsert a single record
    async fn upsert_one(&self, table: &TableDescriptor, record: &Record) -> Result<()>;

    /// Whether `error` means the table as a whole cannot be written
    ///
    /// A missing table, a missing column or a permission error fails every
    /// record alike; retrying row by row would only repeat it.
    fn is_table_unavailable(&self, _error: &anyhow::Error) -> bool {
        false
    }

    /// Bring identity sequences in line with the rows just copied
    ///
    /// Rows arrive with explicit keys, so a sequence would otherwise hand out
    /// ids that already exist.
    async fn sync_identity(&self, _table: &TableDescriptor) -> Result<()> {
        Ok(())
    }

    /// Release the underlying connection or client. Idempotent.
    async fn close(&mut self);
}
