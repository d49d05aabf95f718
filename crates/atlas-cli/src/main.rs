use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use atlas_core::{fields, parse_timestamp, RawEntry, Table};
use atlas_resolve::{AuthorResolver, DirectoryConfig, XrpcDirectory};
use atlas_storage::{GristStore, RecordStore, StoreConfig};
use atlas_sync::{Aggregator, EngineConfig, RunOptions, RunStart};

#[derive(Debug, Parser)]
#[command(name = "atlas")]
#[command(about = "Atmosphere link aggregation and sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest a JSON file of entries as one source run.
    Sync {
        /// Source name, as recorded in the Data_Sources table.
        #[arg(long)]
        source: String,
        /// Path to a JSON array of entries, bare URLs or records.
        entries: PathBuf,
        /// Unprefixed field names this source writes.
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,
        /// Recognize forge repository URLs among plain site entries.
        #[arg(long)]
        detect_repos: bool,
        /// Resolve author references and link Author rows.
        #[arg(long)]
        link_authors: bool,
        /// The feed's reported change timestamp, RFC 3339.
        #[arg(long)]
        feed_timestamp: Option<String>,
    },
    /// Repair the Authors table: fill identifiers, merge duplicates.
    ReconcileAuthors,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;

    let cli = Cli::parse();
    match cli.command {
        Commands::Sync {
            source,
            entries,
            fields,
            detect_repos,
            link_authors,
            feed_timestamp,
        } => sync(source, entries, fields, detect_repos, link_authors, feed_timestamp).await,
        Commands::ReconcileAuthors => reconcile_authors().await,
    }
}

fn open_store() -> Result<Arc<dyn RecordStore>> {
    let store = GristStore::new(StoreConfig::from_env())
        .context("building record store client")?
        .with_json_column(Table::Sites.id(), fields::SITE_META);
    Ok(Arc::new(store))
}

fn build_resolver(config: &EngineConfig) -> Result<AuthorResolver> {
    let directory =
        XrpcDirectory::new(DirectoryConfig::from_env()).context("building directory client")?;
    let mut resolver = AuthorResolver::new(Arc::new(directory));
    if let Some(path) = &config.resolver_cache {
        resolver = resolver
            .with_cache_file(path)
            .context("loading resolver cache")?;
    }
    Ok(resolver)
}

async fn sync(
    source: String,
    entries_path: PathBuf,
    fields: Vec<String>,
    detect_repos: bool,
    link_authors: bool,
    feed_timestamp: Option<String>,
) -> Result<()> {
    let raw = std::fs::read_to_string(&entries_path)
        .with_context(|| format!("reading {}", entries_path.display()))?;
    let entries: Vec<RawEntry> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {}", entries_path.display()))?;

    let config = EngineConfig::from_env();
    let mut options = RunOptions::new(source);
    if !fields.is_empty() {
        options = options.with_fields(fields);
    }
    if detect_repos {
        options = options.with_detect_repos();
    }
    if let Some(stamp) = &feed_timestamp {
        let ts = parse_timestamp(stamp)
            .with_context(|| format!("parsing feed timestamp {stamp:?}"))?;
        options = options.with_feed_timestamp(ts);
    }
    let resolver = if link_authors {
        Some(build_resolver(&config)?)
    } else {
        None
    };

    let store = open_store()?;
    let mut run = match Aggregator::start(store, config, options, resolver).await? {
        RunStart::NoChange { source, watermark } => {
            println!("no update in {source} since watermark {watermark}");
            return Ok(());
        }
        RunStart::Ready(run) => run,
    };
    for entry in entries {
        if let Err(err) = run.add_entry(entry).await {
            tracing::warn!(%err, "entry skipped");
        }
    }
    let summary = run.finish().await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn reconcile_authors() -> Result<()> {
    let config = EngineConfig::from_env();
    let store = open_store()?;
    let mut resolver = build_resolver(&config)?;
    let summary = resolver.reconcile(store.as_ref()).await?;
    resolver.save_cache()?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
