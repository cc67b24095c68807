// ABOUTME: Per-table and per-run accounting returned by the migrator
// ABOUTME: Logs a summary and optionally persists the report as JSON

use crate::strategy::RecordFailure;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;

/// Failures kept per table; `error_count` keeps counting past this
pub const MAX_RECORDED_FAILURES: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableStatus {
    /// Every batch was attempted (individual records may still have failed)
    Migrated,
    /// The source table had no rows
    Empty,
    /// Dry run: rows were read but nothing was written
    Skipped,
    /// A table-level error stopped this table; the run moved on
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct TableReport {
    pub table: String,
    pub rank: usize,
    #[serde(flatten)]
    pub status: TableStatus,
    pub rows_found: u64,
    pub rows_migrated: u64,
    pub error_count: u64,
    pub batches: u64,
    pub cleared: bool,
    pub failures: Vec<RecordFailure>,
    pub elapsed_ms: u64,
}

impl TableReport {
    pub fn new(table: &str, rank: usize) -> Self {
        Self {
            table: table.to_string(),
            rank,
            status: TableStatus::Migrated,
            rows_found: 0,
            rows_migrated: 0,
            error_count: 0,
            batches: 0,
            cleared: false,
            failures: Vec::new(),
            elapsed_ms: 0,
        }
    }

    pub fn record_failures(&mut self, failures: Vec<RecordFailure>) {
        self.error_count += failures.len() as u64;
        let room = MAX_RECORDED_FAILURES.saturating_sub(self.failures.len());
        self.failures.extend(failures.into_iter().take(room));
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, TableStatus::Failed { .. })
    }
}

/// Totals across every table of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunTotals {
    pub tables: usize,
    pub tables_failed: usize,
    pub rows_found: u64,
    pub rows_migrated: u64,
    pub error_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub tables: Vec<TableReport>,
}

impl RunReport {
    pub fn new(dry_run: bool) -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            dry_run,
            tables: Vec::new(),
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.table == name)
    }

    pub fn totals(&self) -> RunTotals {
        self.tables
            .iter()
            .fold(RunTotals::default(), |mut totals, table| {
                totals.tables += 1;
                if table.is_failed() {
                    totals.tables_failed += 1;
                }
                totals.rows_found += table.rows_found;
                totals.rows_migrated += table.rows_migrated;
                totals.error_count += table.error_count;
                totals
            })
    }

    /// True when any table failed or any record was skipped
    pub fn has_errors(&self) -> bool {
        let totals = self.totals();
        totals.tables_failed > 0 || totals.error_count > 0
    }

    pub fn log_summary(&self) {
        tracing::info!("");
        tracing::info!("========================================");
        tracing::info!("Migration summary");
        tracing::info!("========================================");

        for table in &self.tables {
            match &table.status {
                TableStatus::Empty => tracing::info!("  - {:<20} no data", table.table),
                TableStatus::Skipped => tracing::info!(
                    "  - {:<20} {} rows found, {} batches planned (dry run)",
                    table.table,
                    table.rows_found,
                    table.batches
                ),
                TableStatus::Migrated if table.error_count == 0 => tracing::info!(
                    "  ✓ {:<20} {}/{} rows migrated",
                    table.table,
                    table.rows_migrated,
                    table.rows_found
                ),
                TableStatus::Migrated => tracing::warn!(
                    "  ⚠ {:<20} {}/{} rows migrated, {} errors",
                    table.table,
                    table.rows_migrated,
                    table.rows_found,
                    table.error_count
                ),
                TableStatus::Failed { error } => {
                    tracing::error!("  ✗ {:<20} failed: {}", table.table, error)
                }
            }
        }

        let totals = self.totals();
        tracing::info!("----------------------------------------");
        tracing::info!(
            "{} tables, {} rows found, {} rows migrated, {} record errors, {} failed tables",
            totals.tables,
            totals.rows_found,
            totals.rows_migrated,
            totals.error_count,
            totals.tables_failed
        );
    }

    /// Write the report as pretty JSON, replacing `path` atomically
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create report directory {}", parent.display()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("Failed to create temp report in {}", parent.display()))?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), self)
            .with_context(|| format!("Failed to serialize report for {}", path.display()))?;
        tmp.persist(path)
            .with_context(|| format!("Failed to persist report at {}", path.display()))?;

        Ok(())
    }
}
