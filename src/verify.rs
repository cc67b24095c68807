// ABOUTME: Row-count comparison between source and destination after a run
// ABOUTME: Reports mismatches and count errors per table without failing

use crate::destination::Destination;
use crate::source::Source;
use crate::tables::TableDescriptor;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountComparison {
    pub table: String,
    pub source_rows: Option<u64>,
    pub destination_rows: Option<u64>,
    pub error: Option<String>,
}

impl CountComparison {
    pub fn matches(&self) -> bool {
        self.error.is_none() && self.source_rows == self.destination_rows
    }
}

/// Count rows on both sides for every table, in order
pub async fn verify_counts(
    source: &dyn Source,
    destination: &dyn Destination,
    tables: &[TableDescriptor],
) -> Vec<CountComparison> {
    let mut comparisons = Vec::with_capacity(tables.len());

    for table in tables {
        let mut errors = Vec::new();

        let source_rows = match source.count_rows(table).await {
            Ok(count) => Some(count),
            Err(e) => {
                errors.push(format!("source: {:#}", e));
                None
            }
        };
        let destination_rows = match destination.count_rows(table).await {
            Ok(count) => Some(count),
            Err(e) => {
                errors.push(format!("destination: {:#}", e));
                None
            }
        };

        let comparison = CountComparison {
            table: table.name.clone(),
            source_rows,
            destination_rows,
            error: if errors.is_empty() {
                None
            } else {
                Some(errors.join("; "))
            },
        };

        if comparison.matches() {
            tracing::info!(
                "  ✓ {:<20} {} rows",
                comparison.table,
                source_rows.unwrap_or_default()
            );
        } else if let Some(error) = &comparison.error {
            tracing::warn!("  ✗ {:<20} {}", comparison.table, error);
        } else {
            tracing::warn!(
                "  ⚠ {:<20} source {} rows, destination {} rows",
                comparison.table,
                source_rows.unwrap_or_default(),
                destination_rows.unwrap_or_default()
            );
        }

        comparisons.push(comparison);
    }

    comparisons
}
