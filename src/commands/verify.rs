// ABOUTME: Verify command: compares per-table row counts between source and destination
// ABOUTME: Useful right after a mirror run, where counts must match exactly

use crate::config::MigrationConfig;
use crate::source::Source;
use crate::verify::{verify_counts, CountComparison};
use anyhow::Result;

/// Compare row counts for every configured table
///
/// Returns the comparisons; mismatches are logged, not treated as errors.
/// Connection failures are fatal.
pub async fn verify(config: MigrationConfig) -> Result<Vec<CountComparison>> {
    let (mut source, mut destination) = super::open_connections(&config).await?;

    tracing::info!("");
    tracing::info!("Comparing row counts for {} tables...", config.tables.len());
    let comparisons = verify_counts(&source, destination.as_ref(), &config.tables).await;

    destination.close().await;
    source.close().await;

    let mismatched = comparisons.iter().filter(|c| !c.matches()).count();
    if mismatched == 0 {
        tracing::info!("✓ All {} tables match", comparisons.len());
    } else {
        tracing::warn!(
            "⚠ {} of {} tables differ between source and destination",
            mismatched,
            comparisons.len()
        );
    }

    Ok(comparisons)
}
