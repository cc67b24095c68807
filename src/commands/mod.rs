// ABOUTME: Command implementations behind the CLI
// ABOUTME: Exports migrate and verify, plus shared connection setup

pub mod migrate;
pub mod verify;

pub use migrate::migrate;
pub use verify::verify;

use crate::config::{DestinationConfig, MigrationConfig};
use crate::destination::{Destination, PostgresDestination, RestDestination};
use crate::postgres::TlsPolicy;
use crate::source::{PostgresSource, Source};
use anyhow::{Context, Result};

async fn open_source(config: &MigrationConfig) -> Result<PostgresSource> {
    tracing::info!("Connecting to source database...");
    let source = PostgresSource::connect(&config.source_url, TlsPolicy::Verify)
        .await
        .context("Failed to connect to source database")?;
    tracing::info!("✓ Connected to source");
    Ok(source)
}

async fn open_destination(config: &MigrationConfig) -> Result<Box<dyn Destination>> {
    if config.destination_tls == TlsPolicy::AcceptInvalidCerts {
        tracing::warn!(
            "⚠ Destination certificate validation is disabled; pass --strict-tls to enable it"
        );
    }

    match &config.destination {
        DestinationConfig::Postgres { url } => {
            tracing::info!("Connecting to destination database...");
            let destination = PostgresDestination::connect(url, config.destination_tls)
                .await
                .context("Failed to connect to destination database")?;
            tracing::info!("✓ Connected to destination");
            Ok(Box::new(destination))
        }
        DestinationConfig::Rest { api_url, api_key } => {
            tracing::info!("Connecting to destination API at {}...", api_url);
            let destination = RestDestination::new(api_url, api_key, config.destination_tls)?;
            if let Some(first) = config.tables.first() {
                destination.check_connectivity(first).await?;
            }
            tracing::info!("✓ Connected to destination API");
            Ok(Box::new(destination))
        }
    }
}

/// Open source then destination; if the destination fails the source is closed before returning
async fn open_connections(
    config: &MigrationConfig,
) -> Result<(PostgresSource, Box<dyn Destination>)> {
    let mut source = open_source(config).await?;

    match open_destination(config).await {
        Ok(destination) => Ok((source, destination)),
        Err(e) => {
            source.close().await;
            Err(e)
        }
    }
}
