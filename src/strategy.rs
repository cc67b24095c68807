// ABOUTME: Batch write strategies on top of a Destination: bulk upsert or per-record upsert
// ABOUTME: Turns destination errors into per-record failures so one bad row never aborts a batch

use crate::destination::Destination;
use crate::record::Record;
use crate::tables::TableDescriptor;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

/// A record the destination refused
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordFailure {
    pub identity: String,
    pub error: String,
}

/// Outcome of writing one batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteResult {
    pub written: u64,
    pub failures: Vec<RecordFailure>,
}

/// How a batch reaches the destination
#[async_trait]
pub trait WriteStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Write `records` and report what landed
    ///
    /// Rejected records become [`RecordFailure`]s. An error is returned only
    /// when the destination says the table itself cannot be written.
    async fn write_batch(
        &self,
        destination: &dyn Destination,
        table: &TableDescriptor,
        records: &[Record],
    ) -> Result<WriteResult>;
}

/// One upsert call per batch
///
/// When the destination rejects the batch and `fallback_per_record` is set,
/// the batch is replayed record by record so only the offending rows are
/// lost. Without the fallback every record of a rejected batch is reported as
/// failed with the batch error. A table-level rejection is never replayed.
#[derive(Debug, Clone, Copy)]
pub struct BulkUpsert {
    pub fallback_per_record: bool,
}

impl Default for BulkUpsert {
    fn default() -> Self {
        Self {
            fallback_per_record: true,
        }
    }
}

#[async_trait]
impl WriteStrategy for BulkUpsert {
    fn name(&self) -> &'static str {
        "bulk"
    }

    async fn write_batch(
        &self,
        destination: &dyn Destination,
        table: &TableDescriptor,
        records: &[Record],
    ) -> Result<WriteResult> {
        match destination.upsert_many(table, records).await {
            // Trust a reported count only when it is plausible for the batch
            Ok(Some(count)) if count <= records.len() as u64 && count > 0 => Ok(WriteResult {
                written: count,
                failures: Vec::new(),
            }),
            Ok(_) => Ok(WriteResult {
                written: records.len() as u64,
                failures: Vec::new(),
            }),
            Err(e) if destination.is_table_unavailable(&e) => Err(e),
            Err(e) if self.fallback_per_record => {
                tracing::warn!(
                    "    ⚠ Bulk upsert into '{}' failed ({:#}); retrying {} records individually",
                    table.name,
                    e,
                    records.len()
                );
                PerRecordUpsert
                    .write_batch(destination, table, records)
                    .await
            }
            Err(e) => {
                let error = format!("{:#}", e);
                tracing::warn!(
                    "    ✗ Bulk upsert of {} records into '{}' failed: {}",
                    records.len(),
                    table.name,
                    error
                );
                Ok(WriteResult {
                    written: 0,
                    failures: records
                        .iter()
                        .map(|record| RecordFailure {
                            identity: record.identity(&table.conflict_key),
                            error: error.clone(),
                        })
                        .collect(),
                })
            }
        }
    }
}

/// One upsert call per record; failures are logged and skipped
#[derive(Debug, Clone, Copy, Default)]
pub struct PerRecordUpsert;

#[async_trait]
impl WriteStrategy for PerRecordUpsert {
    fn name(&self) -> &'static str {
        "per-record"
    }

    async fn write_batch(
        &self,
        destination: &dyn Destination,
        table: &TableDescriptor,
        records: &[Record],
    ) -> Result<WriteResult> {
        let mut result = WriteResult::default();

        for record in records {
            match destination.upsert_one(table, record).await {
                Ok(()) => result.written += 1,
                Err(e) if destination.is_table_unavailable(&e) => return Err(e),
                Err(e) => {
                    let identity = record.identity(&table.conflict_key);
                    let error = format!("{:#}", e);
                    tracing::warn!(
                        "    ✗ Failed to upsert {} into '{}': {}",
                        identity,
                        table.name,
                        error
                    );
                    result.failures.push(RecordFailure { identity, error });
                }
            }
        }

        Ok(result)
    }
}
