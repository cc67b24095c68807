// ABOUTME: Sequential table-by-table copy from a Source to a Destination
// ABOUTME: Batches rows, upserts them, and keeps per-table counts through partial failures

use crate::destination::Destination;
use crate::record::Record;
use crate::report::{RunReport, TableReport, TableStatus};
use crate::source::Source;
use crate::strategy::WriteStrategy;
use crate::tables::TableDescriptor;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Instant;

/// What happens to rows that already exist at the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Clear a non-empty destination table before copying, leaving an exact mirror
    #[default]
    Mirror,
    /// Upsert only; rows that exist only at the destination survive
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationOptions {
    pub batch_size: usize,
    pub conflict_policy: ConflictPolicy,
    pub dry_run: bool,
}

impl MigrationOptions {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            conflict_policy: ConflictPolicy::Mirror,
            dry_run: false,
        }
    }
}

/// Copies an ordered list of tables, one at a time
///
/// Tables are processed strictly in the order given and batches strictly in
/// scan order; every call is awaited before the next one starts, so a child
/// table is never written before its parents are complete. Only table-level
/// bookkeeping errors end up in the report; connection setup is the caller's
/// job and is where fatal errors surface.
///
/// Under [`ConflictPolicy::Mirror`] a destination whose clear cascades is
/// cleared table by table just before each copy. One that does not cascade is
/// cleared up front, children first, so no parent delete trips a foreign key.
pub struct Migrator {
    options: MigrationOptions,
    strategy: Box<dyn WriteStrategy>,
}

impl Migrator {
    pub fn new(options: MigrationOptions, strategy: Box<dyn WriteStrategy>) -> Result<Self> {
        if options.batch_size == 0 {
            bail!("Batch size must be at least 1");
        }
        Ok(Self { options, strategy })
    }

    /// Migrate every table in `tables`, in order
    pub async fn run(
        &self,
        source: &dyn Source,
        destination: &dyn Destination,
        tables: &[TableDescriptor],
    ) -> RunReport {
        let mut report = RunReport::new(self.options.dry_run);

        tracing::info!(
            "Migrating {} tables to {} destination (batch size {}, {} writes, {:?} policy{})",
            tables.len(),
            destination.kind(),
            self.options.batch_size,
            self.strategy.name(),
            self.options.conflict_policy,
            if self.options.dry_run { ", dry run" } else { "" }
        );

        let mirror = self.options.conflict_policy == ConflictPolicy::Mirror;
        let clear_inline = mirror && destination.clear_cascades();
        let (cleared, clear_failures) = if mirror && !clear_inline && !self.options.dry_run {
            self.clear_children_first(source, destination, tables).await
        } else {
            (HashSet::new(), HashMap::new())
        };

        for (position, table) in tables.iter().enumerate() {
            tracing::info!("");
            tracing::info!(
                "[{}/{}] Migrating table '{}'",
                position + 1,
                tables.len(),
                table.name
            );

            let started = Instant::now();
            let mut table_report = TableReport::new(&table.name, table.rank);
            table_report.cleared = cleared.contains(&table.name);

            let outcome = match clear_failures.get(&table.name) {
                Some(error) => Err(anyhow::anyhow!(
                    "Failed to clear destination table: {}",
                    error
                )),
                None => {
                    self.migrate_table(
                        source,
                        destination,
                        table,
                        clear_inline,
                        &mut table_report,
                    )
                    .await
                }
            };

            if let Err(e) = outcome {
                let error = format!("{:#}", e);
                tracing::error!("  ✗ Table '{}' failed: {}", table.name, error);
                table_report.status = TableStatus::Failed { error };
            }

            table_report.elapsed_ms = started.elapsed().as_millis() as u64;
            report.tables.push(table_report);
        }

        report.finish();
        report
    }

    /// Clear populated destination tables in reverse order
    ///
    /// Returns the tables that were cleared and, per table, why clearing
    /// failed. Tables with no source rows are left alone, as in the copy loop.
    async fn clear_children_first(
        &self,
        source: &dyn Source,
        destination: &dyn Destination,
        tables: &[TableDescriptor],
    ) -> (HashSet<String>, HashMap<String, String>) {
        let mut cleared = HashSet::new();
        let mut failures = HashMap::new();

        tracing::info!("");
        tracing::info!(
            "Clearing {} destination tables in reverse dependency order",
            tables.len()
        );

        for table in tables.iter().rev() {
            match clear_if_populated(source, destination, table).await {
                Ok(true) => {
                    cleared.insert(table.name.clone());
                }
                Ok(false) => {}
                Err(e) => {
                    let error = format!("{:#}", e);
                    tracing::error!("  ✗ Could not clear '{}': {}", table.name, error);
                    failures.insert(table.name.clone(), error);
                }
            }
        }

        (cleared, failures)
    }

    async fn migrate_table(
        &self,
        source: &dyn Source,
        destination: &dyn Destination,
        table: &TableDescriptor,
        clear_inline: bool,
        report: &mut TableReport,
    ) -> Result<()> {
        let rows = source.read_table(table).await?;
        report.rows_found = rows.len() as u64;

        if rows.is_empty() {
            tracing::info!("  - No data in '{}'", table.name);
            report.status = TableStatus::Empty;
            return Ok(());
        }

        let plan = plan_batches(rows.len(), self.options.batch_size);
        report.batches = plan.len() as u64;
        tracing::info!(
            "  Found {} rows in '{}' ({} batches)",
            rows.len(),
            table.name,
            plan.len()
        );

        if self.options.dry_run {
            report.status = TableStatus::Skipped;
            return Ok(());
        }

        if clear_inline {
            let existing = destination.count_rows(table).await?;
            if existing > 0 {
                tracing::info!(
                    "  Clearing {} existing rows from destination '{}'",
                    existing,
                    table.name
                );
                destination.clear_table(table).await?;
                report.cleared = true;
            }
        }

        for (index, batch) in batches(&rows, self.options.batch_size).enumerate() {
            tracing::debug!(
                "  Batch {}/{}: {} records",
                index + 1,
                plan.len(),
                batch.len()
            );

            let result = self
                .strategy
                .write_batch(destination, table, batch)
                .await
                .with_context(|| {
                    format!(
                        "Destination rejected batch {}/{} of '{}'",
                        index + 1,
                        plan.len(),
                        table.name
                    )
                })?;

            report.rows_migrated += result.written;
            if result.failures.is_empty() {
                tracing::info!(
                    "  ✓ Batch {}/{} complete ({} records)",
                    index + 1,
                    plan.len(),
                    result.written
                );
            } else {
                tracing::warn!(
                    "  ⚠ Batch {}/{}: {} written, {} failed",
                    index + 1,
                    plan.len(),
                    result.written,
                    result.failures.len()
                );
                report.record_failures(result.failures);
            }
        }

        if report.rows_migrated > 0 {
            if let Err(e) = destination.sync_identity(table).await {
                tracing::warn!(
                    "  ⚠ Could not advance identity sequences for '{}': {:#}",
                    table.name,
                    e
                );
            }
        }

        report.status = TableStatus::Migrated;
        tracing::info!(
            "  ✓ Migrated {}/{} records for '{}'",
            report.rows_migrated,
            report.rows_found,
            table.name
        );

        Ok(())
    }
}

async fn clear_if_populated(
    source: &dyn Source,
    destination: &dyn Destination,
    table: &TableDescriptor,
) -> Result<bool> {
    if source.count_rows(table).await? == 0 {
        return Ok(false);
    }

    let existing = destination.count_rows(table).await?;
    if existing == 0 {
        return Ok(false);
    }

    tracing::info!(
        "  Clearing {} existing rows from destination '{}'",
        existing,
        table.name
    );
    destination.clear_table(table).await?;
    Ok(true)
}

/// Sizes of the batches a table of `rows` rows is split into
///
/// There are `ceil(rows / batch_size)` batches; all are full except possibly
/// the last, which holds the remainder.
///
/// # Examples
///
/// ```
/// # use pg_table_migrator::migrator::plan_batches;
/// assert_eq!(plan_batches(150, 50), vec![50, 50, 50]);
/// assert_eq!(plan_batches(7, 3), vec![3, 3, 1]);
/// assert!(plan_batches(0, 50).is_empty());
/// ```
pub fn plan_batches(rows: usize, batch_size: usize) -> Vec<usize> {
    if batch_size == 0 {
        return Vec::new();
    }
    let full = rows / batch_size;
    let mut plan = vec![batch_size; full];
    if rows % batch_size != 0 {
        plan.push(rows % batch_size);
    }
    plan
}

fn batches(rows: &[Record], batch_size: usize) -> std::slice::Chunks<'_, Record> {
    rows.chunks(batch_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{BulkUpsert, PerRecordUpsert};
    use anyhow::bail;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::sync::Mutex;

    fn row(id: i64, label: &str) -> Record {
        Record::from_json(json!({"id": id, "label": label})).unwrap()
    }

    fn rows(ids: std::ops::RangeInclusive<i64>) -> Vec<Record> {
        ids.map(|id| row(id, "src")).collect()
    }

    struct MemorySource {
        tables: HashMap<String, Vec<Record>>,
        broken: HashSet<String>,
    }

    impl MemorySource {
        fn new(tables: Vec<(&str, Vec<Record>)>) -> Self {
            Self {
                tables: tables
                    .into_iter()
                    .map(|(name, rows)| (name.to_string(), rows))
                    .collect(),
                broken: HashSet::new(),
            }
        }
    }

    #[async_trait]
    impl Source for MemorySource {
        async fn read_table(&self, table: &TableDescriptor) -> Result<Vec<Record>> {
            if self.broken.contains(&table.name) {
                bail!("permission denied for table {}", table.name);
            }
            Ok(self.tables.get(&table.name).cloned().unwrap_or_default())
        }

        async fn count_rows(&self, table: &TableDescriptor) -> Result<u64> {
            Ok(self.tables.get(&table.name).map_or(0, |r| r.len() as u64))
        }

        async fn close(&mut self) {}
    }

    /// In-memory destination keyed by id that records every call in order
    ///
    /// `references` holds `(child, parent)` pairs. Clearing a parent removes
    /// its children's rows too, unless `no_cascade` is set, in which case the
    /// clear is refused while a child still has rows.
    #[derive(Default)]
    struct MemoryDestination {
        tables: Mutex<HashMap<String, BTreeMap<i64, Record>>>,
        missing: HashSet<String>,
        reject_ids: HashSet<i64>,
        references: Vec<(&'static str, &'static str)>,
        no_cascade: bool,
        log: Mutex<Vec<String>>,
    }

    impl MemoryDestination {
        fn with_rows(table: &str, rows: Vec<Record>) -> Self {
            let dest = Self::default();
            dest.insert_rows(table, rows);
            dest
        }

        fn insert_rows(&self, table: &str, rows: Vec<Record>) {
            self.tables
                .lock()
                .unwrap()
                .entry(table.to_string())
                .or_default()
                .extend(rows.into_iter().map(|r| (id_of(&r), r)));
        }

        fn children_of(&self, table: &str) -> Vec<&'static str> {
            self.references
                .iter()
                .filter(|(_, parent)| *parent == table)
                .map(|(child, _)| *child)
                .collect()
        }

        fn snapshot(&self, table: &str) -> Vec<Record> {
            self.tables
                .lock()
                .unwrap()
                .get(table)
                .map(|rows| rows.values().cloned().collect())
                .unwrap_or_default()
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn check(&self, table: &TableDescriptor) -> Result<()> {
            if self.missing.contains(&table.name) {
                bail!("relation \"{}\" does not exist", table.name);
            }
            Ok(())
        }
    }

    fn id_of(record: &Record) -> i64 {
        record.get("id").and_then(|v| v.as_i64()).unwrap()
    }

    #[async_trait]
    impl Destination for MemoryDestination {
        fn kind(&self) -> &'static str {
            "memory"
        }

        async fn count_rows(&self, table: &TableDescriptor) -> Result<u64> {
            self.check(table)?;
            self.log.lock().unwrap().push(format!("count:{}", table.name));
            Ok(self
                .tables
                .lock()
                .unwrap()
                .get(&table.name)
                .map_or(0, |r| r.len() as u64))
        }

        async fn clear_table(&self, table: &TableDescriptor) -> Result<()> {
            self.check(table)?;
            self.log
                .lock()
                .unwrap()
                .push(format!("clear:{}", table.name));
            let mut tables = self.tables.lock().unwrap();
            for child in self.children_of(&table.name) {
                let child_has_rows = tables.get(child).map_or(false, |rows| !rows.is_empty());
                if self.no_cascade && child_has_rows {
                    bail!(
                        "update or delete on table \"{}\" violates foreign key constraint \
                         on table \"{}\"",
                        table.name,
                        child
                    );
                }
                tables.remove(child);
            }
            tables.remove(&table.name);
            Ok(())
        }

        fn clear_cascades(&self) -> bool {
            !self.no_cascade
        }

        async fn upsert_many(
            &self,
            table: &TableDescriptor,
            records: &[Record],
        ) -> Result<Option<u64>> {
            self.check(table)?;
            self.log
                .lock()
                .unwrap()
                .push(format!("many:{}:{}", table.name, records.len()));
            if records.iter().any(|r| self.reject_ids.contains(&id_of(r))) {
                bail!("batch rejected");
            }
            let mut tables = self.tables.lock().unwrap();
            let target = tables.entry(table.name.clone()).or_default();
            for record in records {
                target.insert(id_of(record), record.clone());
            }
            Ok(None)
        }

        async fn upsert_one(&self, table: &TableDescriptor, record: &Record) -> Result<()> {
            self.check(table)?;
            let id = id_of(record);
            self.log
                .lock()
                .unwrap()
                .push(format!("one:{}:{}", table.name, id));
            if self.reject_ids.contains(&id) {
                bail!("null value in column \"label\" violates not-null constraint");
            }
            self.tables
                .lock()
                .unwrap()
                .entry(table.name.clone())
                .or_default()
                .insert(id, record.clone());
            Ok(())
        }

        fn is_table_unavailable(&self, error: &anyhow::Error) -> bool {
            error.to_string().contains("does not exist")
        }

        async fn sync_identity(&self, table: &TableDescriptor) -> Result<()> {
            self.log.lock().unwrap().push(format!("sync:{}", table.name));
            Ok(())
        }

        async fn close(&mut self) {}
    }

    fn tables(names: &[&str]) -> Vec<TableDescriptor> {
        names
            .iter()
            .enumerate()
            .map(|(rank, name)| TableDescriptor::new(*name, rank))
            .collect()
    }

    fn migrator(batch_size: usize, strategy: Box<dyn WriteStrategy>) -> Migrator {
        Migrator::new(MigrationOptions::new(batch_size), strategy).unwrap()
    }

    #[test]
    fn test_plan_batches() {
        assert_eq!(plan_batches(150, 50), vec![50, 50, 50]);
        assert_eq!(plan_batches(151, 50), vec![50, 50, 50, 1]);
        assert_eq!(plan_batches(3, 50), vec![3]);
        assert!(plan_batches(0, 50).is_empty());
        assert!(plan_batches(10, 0).is_empty());

        for rows in 1..=40usize {
            for size in 1..=12usize {
                let plan = plan_batches(rows, size);
                assert_eq!(plan.len(), (rows + size - 1) / size);
                let expected_last = if rows % size == 0 { size } else { rows % size };
                assert_eq!(*plan.last().unwrap(), expected_last);
                assert_eq!(plan.iter().sum::<usize>(), rows);
            }
        }
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert!(Migrator::new(MigrationOptions::new(0), Box::new(PerRecordUpsert)).is_err());
    }

    #[tokio::test]
    async fn test_users_150_rows_in_three_batches() {
        let source = MemorySource::new(vec![("users", rows(1..=150))]);
        let dest = MemoryDestination::default();

        let report = migrator(50, Box::new(BulkUpsert::default()))
            .run(&source, &dest, &tables(&["users"]))
            .await;

        let users = report.table("users").unwrap();
        assert_eq!(users.status, TableStatus::Migrated);
        assert_eq!(users.rows_found, 150);
        assert_eq!(users.rows_migrated, 150);
        assert_eq!(users.error_count, 0);
        assert_eq!(users.batches, 3);
        assert_eq!(
            dest.log(),
            vec![
                "count:users",
                "many:users:50",
                "many:users:50",
                "many:users:50",
                "sync:users"
            ]
        );
    }

    #[tokio::test]
    async fn test_mirror_replaces_stale_destination_rows() {
        let source = MemorySource::new(vec![(
            "topics",
            vec![row(1, "Verbs"), row(2, "Nouns"), row(3, "Adjectives")],
        )]);
        let dest =
            MemoryDestination::with_rows("topics", vec![row(2, "stale"), row(9, "dest-only")]);

        let report = migrator(100, Box::new(BulkUpsert::default()))
            .run(&source, &dest, &tables(&["topics"]))
            .await;

        let topics = report.table("topics").unwrap();
        assert_eq!(topics.rows_found, 3);
        assert_eq!(topics.rows_migrated, 3);
        assert_eq!(topics.error_count, 0);
        assert!(topics.cleared);
        assert_eq!(
            dest.snapshot("topics"),
            vec![row(1, "Verbs"), row(2, "Nouns"), row(3, "Adjectives")]
        );
    }

    #[tokio::test]
    async fn test_merge_policy_keeps_destination_only_rows() {
        let source = MemorySource::new(vec![("topics", vec![row(1, "Verbs"), row(2, "Nouns")])]);
        let dest =
            MemoryDestination::with_rows("topics", vec![row(2, "stale"), row(9, "dest-only")]);

        let mut options = MigrationOptions::new(100);
        options.conflict_policy = ConflictPolicy::Merge;
        let report = Migrator::new(options, Box::new(BulkUpsert::default()))
            .unwrap()
            .run(&source, &dest, &tables(&["topics"]))
            .await;

        assert!(!report.table("topics").unwrap().cleared);
        assert_eq!(
            dest.snapshot("topics"),
            vec![row(1, "Verbs"), row(2, "Nouns"), row(9, "dest-only")]
        );
        assert!(!dest.log().iter().any(|call| call.starts_with("count:")));
    }

    #[tokio::test]
    async fn test_repeated_runs_are_idempotent() {
        let source = MemorySource::new(vec![
            ("users", rows(1..=7)),
            ("topics", vec![row(1, "a"), row(2, "b")]),
        ]);
        let dest = MemoryDestination::with_rows("users", vec![row(42, "leftover")]);
        let m = migrator(3, Box::new(PerRecordUpsert));
        let order = tables(&["users", "topics"]);

        m.run(&source, &dest, &order).await;
        let first = (dest.snapshot("users"), dest.snapshot("topics"));
        let report = m.run(&source, &dest, &order).await;
        let second = (dest.snapshot("users"), dest.snapshot("topics"));

        assert_eq!(first, second);
        assert_eq!(second.0, rows(1..=7));
        assert!(!report.has_errors());
    }

    #[tokio::test]
    async fn test_record_failure_is_contained() {
        let source = MemorySource::new(vec![
            ("users", rows(1..=120)),
            ("topics", vec![row(1, "a")]),
        ]);
        let mut dest = MemoryDestination::default();
        dest.reject_ids.insert(7);

        let report = migrator(50, Box::new(PerRecordUpsert))
            .run(&source, &dest, &tables(&["users", "topics"]))
            .await;

        let users = report.table("users").unwrap();
        assert_eq!(users.status, TableStatus::Migrated);
        assert_eq!(users.rows_migrated, 119);
        assert_eq!(users.error_count, 1);
        assert_eq!(users.failures[0].identity, "id=7");
        assert_eq!(dest.snapshot("users").len(), 119);

        let log = dest.log();
        assert!(log.contains(&"one:users:120".to_string()));
        assert_eq!(report.table("topics").unwrap().rows_migrated, 1);
    }

    #[tokio::test]
    async fn test_bulk_failure_falls_back_to_single_rows() {
        let source = MemorySource::new(vec![("users", rows(1..=50))]);
        let mut dest = MemoryDestination::default();
        dest.reject_ids.insert(7);

        let report = migrator(50, Box::new(BulkUpsert::default()))
            .run(&source, &dest, &tables(&["users"]))
            .await;

        let users = report.table("users").unwrap();
        assert_eq!(users.rows_migrated, 49);
        assert_eq!(users.error_count, 1);
    }

    #[tokio::test]
    async fn test_empty_table_reports_no_data() {
        let source = MemorySource::new(vec![("users", vec![]), ("topics", vec![row(1, "a")])]);
        let dest = MemoryDestination::default();

        let report = migrator(50, Box::new(BulkUpsert::default()))
            .run(&source, &dest, &tables(&["users", "topics"]))
            .await;

        let users = report.table("users").unwrap();
        assert_eq!(users.status, TableStatus::Empty);
        assert_eq!(users.rows_found, 0);
        assert_eq!(users.batches, 0);
        assert!(!report.has_errors());
        assert!(!dest.log().iter().any(|call| call.contains("users")));
    }

    #[tokio::test]
    async fn test_table_failures_do_not_stop_the_run() {
        let mut source = MemorySource::new(vec![
            ("users", rows(1..=2)),
            ("topics", rows(1..=2)),
            ("audibles", rows(1..=2)),
        ]);
        source.broken.insert("users".to_string());
        let mut dest = MemoryDestination::default();
        dest.missing.insert("topics".to_string());

        let report = migrator(50, Box::new(BulkUpsert::default()))
            .run(&source, &dest, &tables(&["users", "topics", "audibles"]))
            .await;

        assert!(report.table("users").unwrap().is_failed());
        match &report.table("topics").unwrap().status {
            TableStatus::Failed { error } => assert!(error.contains("does not exist")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(report.table("audibles").unwrap().rows_migrated, 2);
        assert_eq!(report.totals().tables_failed, 2);
        assert!(report.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_parents_written_before_children() {
        let source = MemorySource::new(vec![
            ("users", rows(1..=4)),
            ("topics", rows(1..=4)),
            ("flashcards", rows(1..=4)),
        ]);
        let dest = MemoryDestination::default();

        migrator(2, Box::new(BulkUpsert::default()))
            .run(&source, &dest, &tables(&["users", "topics", "flashcards"]))
            .await;

        let log = dest.log();
        let writes_to = |t: &str| {
            let prefix = format!("many:{}:", t);
            let hits: Vec<usize> = log
                .iter()
                .enumerate()
                .filter(|(_, call)| call.starts_with(&prefix))
                .map(|(i, _)| i)
                .collect();
            hits
        };
        let last_of = |t: &str| *writes_to(t).last().unwrap();
        let first_of = |t: &str| writes_to(t)[0];
        assert!(last_of("users") < first_of("topics"));
        assert!(last_of("topics") < first_of("flashcards"));
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let source = MemorySource::new(vec![("users", rows(1..=5))]);
        let dest = MemoryDestination::with_rows("users", vec![row(1, "old")]);

        let mut options = MigrationOptions::new(2);
        options.dry_run = true;
        let report = Migrator::new(options, Box::new(BulkUpsert::default()))
            .unwrap()
            .run(&source, &dest, &tables(&["users"]))
            .await;

        let users = report.table("users").unwrap();
        assert_eq!(users.status, TableStatus::Skipped);
        assert_eq!(users.rows_found, 5);
        assert_eq!(users.batches, 3);
        assert!(report.dry_run);
        assert!(dest.log().is_empty());
        assert_eq!(dest.snapshot("users"), vec![row(1, "old")]);
    }

    #[tokio::test]
    async fn test_missing_table_fails_without_per_record_replay() {
        let source = MemorySource::new(vec![
            ("topics", rows(1..=120)),
            ("audibles", rows(1..=2)),
        ]);
        let mut dest = MemoryDestination::default();
        dest.missing.insert("topics".to_string());

        let mut options = MigrationOptions::new(50);
        options.conflict_policy = ConflictPolicy::Merge;
        let report = Migrator::new(options, Box::new(BulkUpsert::default()))
            .unwrap()
            .run(&source, &dest, &tables(&["topics", "audibles"]))
            .await;

        let topics = report.table("topics").unwrap();
        match &topics.status {
            TableStatus::Failed { error } => {
                assert!(error.contains("batch 1/3"));
                assert!(error.contains("does not exist"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(topics.rows_migrated, 0);
        assert_eq!(topics.error_count, 0);
        assert_eq!(report.table("audibles").unwrap().rows_migrated, 2);
        assert_eq!(report.totals().tables_failed, 1);
        assert!(!dest.log().iter().any(|call| call.contains("topics")));
    }

    #[tokio::test]
    async fn test_non_cascading_destination_cleared_children_first() {
        let source = MemorySource::new(vec![
            ("users", rows(1..=3)),
            ("topics", rows(1..=2)),
            ("flashcards", rows(1..=4)),
        ]);
        let dest = MemoryDestination {
            references: vec![("topics", "users"), ("flashcards", "topics")],
            no_cascade: true,
            ..Default::default()
        };
        dest.insert_rows("users", vec![row(1, "old"), row(8, "stale")]);
        dest.insert_rows("topics", vec![row(5, "stale")]);
        let m = migrator(2, Box::new(BulkUpsert::default()));
        let order = tables(&["users", "topics", "flashcards"]);

        let first = m.run(&source, &dest, &order).await;
        assert!(!first.has_errors());
        assert!(first.table("users").unwrap().cleared);
        assert!(first.table("topics").unwrap().cleared);
        assert!(!first.table("flashcards").unwrap().cleared);

        dest.log.lock().unwrap().clear();
        let second = m.run(&source, &dest, &order).await;
        assert!(!second.has_errors());
        assert_eq!(dest.snapshot("users"), rows(1..=3));
        assert_eq!(dest.snapshot("flashcards"), rows(1..=4));

        let log = dest.log();
        let clears: Vec<&str> = log
            .iter()
            .filter(|call| call.starts_with("clear:"))
            .map(String::as_str)
            .collect();
        assert_eq!(clears, vec!["clear:flashcards", "clear:topics", "clear:users"]);
        let last_clear = log.iter().rposition(|c| c.starts_with("clear:")).unwrap();
        let first_write = log.iter().position(|c| c.starts_with("many:")).unwrap();
        assert!(last_clear < first_write);
    }

    #[tokio::test]
    async fn test_parent_clear_refused_fails_only_that_table() {
        let source = MemorySource::new(vec![("users", rows(1..=2)), ("topics", vec![])]);
        let dest = MemoryDestination {
            references: vec![("topics", "users")],
            no_cascade: true,
            ..Default::default()
        };
        dest.insert_rows("users", vec![row(1, "old")]);
        dest.insert_rows("topics", vec![row(1, "dest-only")]);

        let report = migrator(50, Box::new(BulkUpsert::default()))
            .run(&source, &dest, &tables(&["users", "topics"]))
            .await;

        match &report.table("users").unwrap().status {
            TableStatus::Failed { error } => assert!(error.contains("foreign key")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(report.table("topics").unwrap().status, TableStatus::Empty);
        assert!(!dest.log().iter().any(|call| call.starts_with("many:users")));
    }

    #[tokio::test]
    async fn test_identity_sync_skipped_when_nothing_written() {
        let source = MemorySource::new(vec![("users", rows(1..=3))]);
        let mut dest = MemoryDestination::default();
        dest.reject_ids.extend([1, 2, 3]);

        let report = migrator(50, Box::new(PerRecordUpsert))
            .run(&source, &dest, &tables(&["users"]))
            .await;

        assert_eq!(report.table("users").unwrap().error_count, 3);
        assert!(!dest.log().contains(&"sync:users".to_string()));
    }
}
