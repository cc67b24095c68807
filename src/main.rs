// ABOUTME: CLI entry point for pg-table-migrator
// ABOUTME: Parses commands, resolves configuration, and routes to command handlers

use clap::{Args, Parser, Subcommand};
use pg_table_migrator::{commands, config};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pg-table-migrator")]
#[command(
    about = "Copy the learning app tables between hosted PostgreSQL databases",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ConnectionArgs {
    /// Source PostgreSQL connection string
    #[arg(long = "source", env = "SOURCE_URL", hide_env_values = true)]
    source_url: Option<String>,
    /// Destination PostgreSQL connection string (direct connection)
    #[arg(long = "destination", env = "DESTINATION_URL", hide_env_values = true)]
    destination_url: Option<String>,
    /// Destination REST API base URL (e.g. https://<project>.supabase.co)
    #[arg(long, env = "DESTINATION_API_URL")]
    destination_api_url: Option<String>,
    /// Destination REST API key
    #[arg(long, env = "DESTINATION_API_KEY", hide_env_values = true)]
    destination_api_key: Option<String>,
    /// TOML file with migration settings and an optional table list
    #[arg(long)]
    config: Option<PathBuf>,
    /// Validate destination TLS certificates
    #[arg(long)]
    strict_tls: bool,
    /// Migrate only these tables (comma-separated, dependency order is kept)
    #[arg(long, value_delimiter = ',')]
    include_tables: Option<Vec<String>>,
    /// Skip these tables (comma-separated)
    #[arg(long, value_delimiter = ',')]
    exclude_tables: Option<Vec<String>>,
}

impl ConnectionArgs {
    fn into_inputs(self) -> config::ConfigInputs {
        config::ConfigInputs {
            source_url: self.source_url,
            destination_url: self.destination_url,
            destination_api_url: self.destination_api_url,
            destination_api_key: self.destination_api_key,
            config_path: self.config,
            strict_tls: self.strict_tls,
            include_tables: self.include_tables,
            exclude_tables: self.exclude_tables,
            ..Default::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Copy every table from source to destination with batched upserts
    Migrate {
        #[command(flatten)]
        connection: ConnectionArgs,
        /// Rows per write call (default 100 direct, 50 REST)
        #[arg(long)]
        batch_size: Option<usize>,
        /// Upsert only; keep destination rows that are not in the source
        #[arg(long)]
        merge: bool,
        /// Write records one at a time instead of one call per batch
        #[arg(long)]
        per_record: bool,
        /// Do not retry a rejected batch record by record
        #[arg(long)]
        no_fallback: bool,
        /// Read the source and report what would be written, without writing
        #[arg(long)]
        dry_run: bool,
        /// Skip the confirmation prompt before destination tables are truncated
        #[arg(short = 'y', long)]
        yes: bool,
        /// Write the run report as JSON to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Compare per-table row counts between source and destination
    Verify {
        #[command(flatten)]
        connection: ConnectionArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging - default to INFO level if RUST_LOG not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Migrate {
            connection,
            batch_size,
            merge,
            per_record,
            no_fallback,
            dry_run,
            yes,
            report,
        } => {
            let config = config::resolve(config::ConfigInputs {
                batch_size,
                merge,
                per_record,
                no_fallback,
                dry_run,
                ..connection.into_inputs()
            })?;
            commands::migrate(config, yes, report.as_deref()).await?;
            Ok(())
        }
        Commands::Verify { connection } => {
            let config = config::resolve(connection.into_inputs())?;
            commands::verify(config).await?;
            Ok(())
        }
    }
}
