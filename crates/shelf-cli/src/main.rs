use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use shelf_sync::{
    ImportPolicy, PgCatalogStore, ShelfPipeline, StoreError, SyncConfig, SyncError,
};
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "shelf-cli")]
#[command(about = "Storefront listing scrape, import and audit")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Walk each source's categories page by page, resuming from checkpoints.
    Scrape {
        #[arg(long)]
        source: Option<String>,
    },
    /// Reconcile acquired listings into the catalog.
    Import {
        #[arg(long)]
        source: Option<String>,
        /// Clear all products and categories before the first batch.
        #[arg(long)]
        replace_all: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Compare acquired listings with the catalog. Never writes.
    Verify {
        #[arg(long)]
        source: Option<String>,
    },
    Migrate,
    /// Infer missing product sources from image URLs.
    BackfillSources {
        #[arg(long)]
        execute: bool,
    },
}

fn init_env() {
    let _ = dotenv::from_filename(".env.local");
    let _ = dotenv::dotenv();
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}

#[tokio::main]
async fn main() -> ExitCode {
    init_env();
    if let Err(err) = init_tracing("info") {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }
    let cli = Cli::parse();

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(SyncError::MissingConnectionString) => {
            eprintln!("{}", SyncError::MissingConnectionString);
            ExitCode::from(2)
        }
        Err(SyncError::Store(StoreError::ConnectionFailure(detail))) => {
            eprintln!("catalog unreachable: {detail}");
            eprintln!("check DIRECT_URL / DATABASE_URL and that the database accepts connections");
            ExitCode::from(3)
        }
        Err(err) => {
            tracing::error!(error = %err, "command failed");
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn connect(config: &SyncConfig) -> Result<PgCatalogStore, SyncError> {
    let connection = config.catalog_connection()?;
    Ok(PgCatalogStore::connect(&connection.url).await?)
}

async fn run(command: Commands) -> Result<(), SyncError> {
    let pipeline = ShelfPipeline::new(SyncConfig::from_env())?;

    match command {
        Commands::Scrape { source } => {
            let summary = pipeline.scrape(source.as_deref()).await?;
            let accepted: usize = summary.sources.iter().map(|s| s.accepted).sum();
            let dataset: usize = summary.sources.iter().map(|s| s.dataset_size).sum();
            println!(
                "scrape complete: run_id={} sources={} accepted={} dataset={}",
                summary.run_id,
                summary.sources.len(),
                accepted,
                dataset
            );
        }
        Commands::Import {
            source,
            replace_all,
            dry_run,
        } => {
            let policy = if replace_all {
                ImportPolicy::ReplaceAll
            } else {
                ImportPolicy::Append
            };
            let store = connect(pipeline.config()).await?;
            let summary = pipeline
                .import(&store, source.as_deref(), policy, dry_run)
                .await?;
            println!(
                "import complete: run_id={} dry_run={} inserted={} renamed={} duplicates={} reports={}",
                summary.run_id,
                summary.dry_run,
                summary.inserted(),
                summary.renamed(),
                summary.duplicates(),
                summary.reports_dir.display()
            );
        }
        Commands::Verify { source } => {
            let store = connect(pipeline.config()).await?;
            let summary = pipeline.verify(&store, source.as_deref()).await?;
            println!(
                "verify complete: run_id={} acquired={} catalog={} missing={} reports={}",
                summary.run_id,
                summary.report.acquired_total,
                summary.report.catalog_total,
                summary.report.missing_total(),
                summary.reports_dir.display()
            );
        }
        Commands::Migrate => {
            let store = connect(pipeline.config()).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::BackfillSources { execute } => {
            let store = connect(pipeline.config()).await?;
            let report = pipeline.backfill(&store, execute).await?;
            println!(
                "backfill {}: scanned={} inferred={} unknown={} updated={}",
                if report.executed { "applied" } else { "dry run" },
                report.scanned,
                report.inferred.values().sum::<usize>(),
                report.unknown,
                report.updated
            );
        }
    }

    Ok(())
}
