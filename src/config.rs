// ABOUTME: Resolves run configuration from CLI flags, environment, and an optional TOML file
// ABOUTME: Missing connection settings are rejected here, before any connection is opened

use crate::migrator::ConflictPolicy;
use crate::postgres::TlsPolicy;
use crate::tables::{self, TableDescriptor};
use crate::utils;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_POSTGRES_BATCH_SIZE: usize = 100;
pub const DEFAULT_REST_BATCH_SIZE: usize = 50;
/// PostgREST deployments commonly cap request bodies; keep batches small
pub const MAX_REST_BATCH_SIZE: usize = 100;

/// Where migrated rows are written
#[derive(Clone, PartialEq, Eq)]
pub enum DestinationConfig {
    Postgres { url: String },
    Rest { api_url: String, api_key: String },
}

impl DestinationConfig {
    pub fn default_batch_size(&self) -> usize {
        match self {
            DestinationConfig::Postgres { .. } => DEFAULT_POSTGRES_BATCH_SIZE,
            DestinationConfig::Rest { .. } => DEFAULT_REST_BATCH_SIZE,
        }
    }
}

// Connection strings and API keys carry credentials
impl fmt::Debug for DestinationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationConfig::Postgres { .. } => f
                .debug_struct("Postgres")
                .field("url", &"<redacted>")
                .finish(),
            DestinationConfig::Rest { api_url, .. } => f
                .debug_struct("Rest")
                .field("api_url", api_url)
                .field("api_key", &"<redacted>")
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Bulk { fallback_per_record: bool },
    PerRecord,
}

/// Fully resolved settings for one run
#[derive(Clone)]
pub struct MigrationConfig {
    pub source_url: String,
    pub destination: DestinationConfig,
    pub batch_size: usize,
    pub conflict_policy: ConflictPolicy,
    pub write_mode: WriteMode,
    pub destination_tls: TlsPolicy,
    pub dry_run: bool,
    pub tables: Vec<TableDescriptor>,
}

impl fmt::Debug for MigrationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationConfig")
            .field("source_url", &"<redacted>")
            .field("destination", &self.destination)
            .field("batch_size", &self.batch_size)
            .field("conflict_policy", &self.conflict_policy)
            .field("write_mode", &self.write_mode)
            .field("destination_tls", &self.destination_tls)
            .field("dry_run", &self.dry_run)
            .field("tables", &self.tables.len())
            .finish()
    }
}

/// Raw inputs gathered by the CLI (flags already merged with environment variables)
#[derive(Debug, Clone, Default)]
pub struct ConfigInputs {
    pub source_url: Option<String>,
    pub destination_url: Option<String>,
    pub destination_api_url: Option<String>,
    pub destination_api_key: Option<String>,
    pub config_path: Option<PathBuf>,
    pub batch_size: Option<usize>,
    pub merge: bool,
    pub per_record: bool,
    pub no_fallback: bool,
    pub strict_tls: bool,
    pub dry_run: bool,
    pub include_tables: Option<Vec<String>>,
    pub exclude_tables: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    migration: MigrationSection,
    #[serde(default)]
    tables: Vec<TableEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MigrationSection {
    batch_size: Option<usize>,
    policy: Option<ConflictPolicy>,
    per_record: Option<bool>,
    fallback_per_record: Option<bool>,
    strict_tls: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TableEntry {
    name: String,
    #[serde(default)]
    conflict_key: Vec<String>,
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    toml::from_str(&raw)
        .with_context(|| format!("Failed to parse TOML config at {}", path.display()))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Pick the destination from the available settings
///
/// A direct `DESTINATION_URL` wins over the API pair when both are present.
pub fn resolve_destination(
    destination_url: Option<String>,
    api_url: Option<String>,
    api_key: Option<String>,
) -> Result<DestinationConfig> {
    let destination_url = non_empty(destination_url);
    let api_url = non_empty(api_url);
    let api_key = non_empty(api_key);

    if let Some(url) = destination_url {
        if api_url.is_some() {
            tracing::warn!(
                "⚠ Both DESTINATION_URL and DESTINATION_API_URL are set; using the direct connection"
            );
        }
        utils::validate_connection_string(&url).context("Invalid DESTINATION_URL")?;
        return Ok(DestinationConfig::Postgres { url });
    }

    match (api_url, api_key) {
        (Some(api_url), Some(api_key)) => {
            utils::validate_api_url(&api_url).context("Invalid DESTINATION_API_URL")?;
            Ok(DestinationConfig::Rest { api_url, api_key })
        }
        (Some(_), None) => bail!(
            "Missing destination API key.\n\
             DESTINATION_API_URL is set but DESTINATION_API_KEY is not."
        ),
        (None, Some(_)) => bail!(
            "Missing destination API URL.\n\
             DESTINATION_API_KEY is set but DESTINATION_API_URL is not."
        ),
        (None, None) => bail!(
            "Missing destination configuration.\n\
             Set DESTINATION_URL for a direct PostgreSQL connection, or \
             DESTINATION_API_URL and DESTINATION_API_KEY for a REST endpoint."
        ),
    }
}

/// Resolve CLI/environment inputs and the optional config file into a run configuration
///
/// Precedence: command-line flags, then the config file, then built-in defaults.
///
/// # Errors
///
/// Fails without touching the network when the source URL or destination
/// settings are missing or malformed, the config file cannot be read, the batch
/// size is zero, or the table selection names unknown tables.
pub fn resolve(inputs: ConfigInputs) -> Result<MigrationConfig> {
    let source_url = non_empty(inputs.source_url).ok_or_else(|| {
        anyhow::anyhow!(
            "Missing source configuration.\n\
             Set SOURCE_URL (or pass --source) to the PostgreSQL connection string of the source database."
        )
    })?;
    utils::validate_connection_string(&source_url).context("Invalid SOURCE_URL")?;

    let destination = resolve_destination(
        inputs.destination_url,
        inputs.destination_api_url,
        inputs.destination_api_key,
    )?;
    if let DestinationConfig::Postgres { url } = &destination {
        utils::validate_source_target_different(&source_url, url)?;
    }

    let file = match &inputs.config_path {
        Some(path) => load_file_config(path)?,
        None => FileConfig::default(),
    };

    let batch_size = inputs
        .batch_size
        .or(file.migration.batch_size)
        .unwrap_or_else(|| destination.default_batch_size());
    if batch_size == 0 {
        bail!("Batch size must be at least 1");
    }
    let batch_size = match destination {
        DestinationConfig::Rest { .. } if batch_size > MAX_REST_BATCH_SIZE => {
            tracing::warn!(
                "⚠ Batch size {} exceeds the REST limit; using {}",
                batch_size,
                MAX_REST_BATCH_SIZE
            );
            MAX_REST_BATCH_SIZE
        }
        _ => batch_size,
    };

    let conflict_policy = if inputs.merge {
        ConflictPolicy::Merge
    } else {
        file.migration.policy.unwrap_or_default()
    };

    let write_mode = if inputs.per_record || file.migration.per_record.unwrap_or(false) {
        WriteMode::PerRecord
    } else {
        WriteMode::Bulk {
            fallback_per_record: !inputs.no_fallback
                && file.migration.fallback_per_record.unwrap_or(true),
        }
    };

    let destination_tls = if inputs.strict_tls || file.migration.strict_tls.unwrap_or(false) {
        TlsPolicy::Verify
    } else {
        TlsPolicy::AcceptInvalidCerts
    };

    let all_tables = if file.tables.is_empty() {
        tables::default_tables()
    } else {
        tables::tables_from_order(
            file.tables
                .into_iter()
                .map(|entry| (entry.name, entry.conflict_key))
                .collect(),
        )?
    };
    let tables = tables::select_tables(
        &all_tables,
        inputs.include_tables.as_deref(),
        inputs.exclude_tables.as_deref(),
    )?;

    Ok(MigrationConfig {
        source_url,
        destination,
        batch_size,
        conflict_policy,
        write_mode,
        destination_tls,
        dry_run: inputs.dry_run,
        tables,
    })
}
