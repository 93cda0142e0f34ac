#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI for trying connections against real feeds.
//!
//! Nothing here talks to a real storefront: `simulate` runs the full
//! pipeline against an in-memory destination.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use elementa_cli_utils::{BarKind, init_logger, progress};
use elementa_destination::MemoryDestination;
use elementa_feed::connection::load_connection;
use elementa_feed::FeedError;
use elementa_feed::reader::{FeedLocation, FeedReader, parse_delimiter, parse_header};
use elementa_ingest::chunk::prepare;
use elementa_ingest::{CleanupRunner, Importer, IngestConfig, IngestError, MemoryRunStore};
use elementa_ingest_models::{CleanupScope, CleanupTrigger};
use elementa_throttle::{AdaptiveThrottle, MemoryStateStore};
use elementa_transform::category::{extract_leaf, normalize};
use elementa_transform::transform::legacy_category_match;

#[derive(Parser)]
#[command(name = "elementa", about = "Product feed syndication tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct FeedArgs {
    /// Connection definition (TOML)
    #[arg(long)]
    connection: PathBuf,
    /// Feed file path or `http(s)` URL
    feed: String,
    /// Field delimiter, e.g. `,`, `|`, `tab`
    #[arg(long)]
    delimiter: Option<String>,
    /// Force gzip decoding (detected from a `.gz` suffix otherwise)
    #[arg(long)]
    gzip: bool,
    /// Maximum number of records to read
    #[arg(long)]
    limit: Option<u64>,
    /// Extra HTTP header for remote feeds, repeatable
    #[arg(long = "header", value_name = "KEY=VALUE")]
    headers: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Filter and transform a feed, printing one JSON line per record
    Preview {
        #[command(flatten)]
        feed: FeedArgs,
    },
    /// Run a full import against an in-memory storefront
    Simulate {
        #[command(flatten)]
        feed: FeedArgs,
        /// Pipeline configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Delete products the feed no longer carries after the import
        #[arg(long)]
        reconcile: bool,
        /// Run a cleanup of every imported product afterwards
        #[arg(long)]
        cleanup: bool,
        /// Make the cleanup count products without deleting them
        #[arg(long)]
        dry_run: bool,
    },
    /// Resolve a category string against a connection's category map
    Normalize {
        /// Connection definition (TOML)
        #[arg(long)]
        connection: PathBuf,
        /// Raw category string, e.g. "Shoes > Running"
        category: String,
    },
}

impl FeedArgs {
    fn reader(&self) -> Result<FeedReader, FeedError> {
        let mut reader = FeedReader::new(FeedLocation::parse(&self.feed));
        if self.gzip {
            reader = reader.with_gzip(true);
        }
        if let Some(delimiter) = &self.delimiter {
            reader = reader.with_delimiter(parse_delimiter(delimiter)?);
        }
        if let Some(limit) = self.limit {
            reader = reader.with_max_records(limit);
        }
        for header in &self.headers {
            let (key, value) = parse_header(header)?;
            reader = reader.with_header(key, value);
        }
        Ok(reader)
    }
}

fn load_config(path: Option<&Path>) -> Result<IngestConfig, IngestError> {
    match path {
        Some(path) => IngestConfig::load(path),
        None => IngestConfig::default().with_env(),
    }
}

#[tokio::main]
async fn main() -> Result<(), IngestError> {
    let multi = init_logger();
    let cli = Cli::parse();

    match cli.command {
        Commands::Preview { feed } => {
            let connection = load_connection(&feed.connection)?;
            let records = feed.reader()?.read().await?;
            log::info!("Previewing {} records", records.len());

            for record in &records {
                let line = match prepare(&connection, record) {
                    Ok(payload) => serde_json::json!({ "payload": payload }),
                    Err(reason) => serde_json::json!({ "skipped": reason.to_string() }),
                };
                println!("{line}");
            }
        }
        Commands::Simulate {
            feed,
            config,
            reconcile,
            cleanup,
            dry_run,
        } => {
            let connection = load_connection(&feed.connection)?;
            let config = load_config(config.as_deref())?;
            let destination = Arc::new(MemoryDestination::new());
            let throttle = AdaptiveThrottle::new(
                Arc::new(MemoryStateStore::new()),
                config.throttle.clone(),
            );
            let runs = Arc::new(MemoryRunStore::new());

            let start = Instant::now();
            let importer = Importer::new(destination.clone(), throttle.clone(), runs.clone(), &config)
                .with_reconcile_stale(reconcile || config.reconcile_stale)
                .with_progress(progress(&multi, BarKind::Records, "Importing"));
            let run = importer.run_feed(&connection, &feed.reader()?).await?;
            log::info!(
                "Import run {} {} in {:.1}s, storefront holds {} products",
                run.id,
                run.status,
                start.elapsed().as_secs_f64(),
                destination.products().len()
            );
            println!("{}", serde_json::to_string_pretty(&run)?);

            if cleanup {
                let runner = CleanupRunner::new(destination.clone(), throttle, runs, &config)
                    .with_progress(progress(&multi, BarKind::Cleanup, "Cleaning up"));
                let cleanup_run = runner
                    .run(&connection, CleanupTrigger::Manual, CleanupScope::All, dry_run)
                    .await?;
                println!("{}", serde_json::to_string_pretty(&cleanup_run)?);
            }
        }
        Commands::Normalize {
            connection,
            category,
        } => {
            let connection = load_connection(&connection)?;
            let delimiter = connection.category_delimiter.as_deref();
            let resolved = normalize(&category, delimiter, &connection.category_mappings);
            let legacy = resolved
                .is_none()
                .then(|| legacy_category_match(&category, &connection.category_mappings))
                .flatten();

            println!("leaf:     {}", extract_leaf(&category, delimiter).unwrap_or_default());
            match (resolved, legacy) {
                (Some(id), _) => println!("category: {id}"),
                (None, Some(id)) => println!("category: {id} (legacy match)"),
                (None, None) => println!("category: no match"),
            }
        }
    }

    Ok(())
}
