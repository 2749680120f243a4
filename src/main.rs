use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use keylime_etl::constants::DEFAULT_LOG_DIR;
use keylime_etl::domain::Entity;
use keylime_etl::logging;
use keylime_etl::pipeline::storage::SqliteStore;
use keylime_etl::pipeline::{RejectReason, RunReport};
use keylime_etl::{EtlError, Pipeline, PipelineConfig};

#[derive(Parser)]
#[command(name = "keylime_etl")]
#[command(about = "Batch ETL from raw customer, product and sales files into a star-schema store")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline and replace the store
    Run {
        /// Config file (defaults to keylime.toml when present)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Raw customers file
        #[arg(long)]
        customers: Option<PathBuf>,
        /// Raw products file
        #[arg(long)]
        products: Option<PathBuf>,
        /// Raw sales file
        #[arg(long)]
        sales: Option<PathBuf>,
        /// Target store
        #[arg(long)]
        store: Option<PathBuf>,
        /// Where to write the JSON run report
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Print per-table row counts and the content digest of a store
    Counts {
        /// Config file (defaults to keylime.toml when present)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Store to inspect, overriding config and KEYLIME_STORE
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

struct RunArgs {
    config: Option<PathBuf>,
    customers: Option<PathBuf>,
    products: Option<PathBuf>,
    sales: Option<PathBuf>,
    store: Option<PathBuf>,
    report: Option<PathBuf>,
}

fn resolve_config(args: RunArgs) -> Result<PipelineConfig, EtlError> {
    let mut config = PipelineConfig::load(args.config.as_deref())?.with_env();
    if let Some(path) = args.customers {
        config.inputs.customers = path;
    }
    if let Some(path) = args.products {
        config.inputs.products = path;
    }
    if let Some(path) = args.sales {
        config.inputs.sales = path;
    }
    if let Some(path) = args.store {
        config.store.path = path;
    }
    if let Some(path) = args.report {
        config.store.report = Some(path);
    }
    Ok(config)
}

/// Store path for `counts`: flag, then env, then config file, then default.
fn resolve_store(
    config: Option<&Path>,
    store: Option<PathBuf>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<PathBuf, EtlError> {
    if let Some(path) = store {
        return Ok(path);
    }
    Ok(PipelineConfig::load(config)?.with_env_overrides(lookup).store.path)
}

fn print_summary(report: &RunReport, report_path: &Path) {
    println!("\n📊 Pipeline Results:");
    println!("   Rows processed: {}", report.total_rows_processed());
    println!("   Rows rejected: {}", report.total_rejected());
    for reason in [
        RejectReason::SchemaViolation,
        RejectReason::OrphanReference,
        RejectReason::AttributeConflict,
    ] {
        println!("     {}: {}", reason, report.rejected(reason));
    }
    println!("   Duplicates merged:");
    for entity in [Entity::Customer, Entity::Product, Entity::Sale] {
        println!("     {}: {}", entity, report.duplicates(entity));
    }
    println!("   Store: {}", report.store.display());
    for count in &report.table_counts {
        println!("     {}: {} rows", count.table, count.rows);
    }
    println!("   Report: {}", report_path.display());
}

async fn run(args: RunArgs) -> Result<(), EtlError> {
    let config = resolve_config(args)?;
    let report_path = config.report_path();
    let pipeline = Pipeline::new(config);
    let report = pipeline.run().await?;
    print_summary(&report, &report_path);
    Ok(())
}

fn counts(store: &Path) -> anyhow::Result<()> {
    let store = SqliteStore::new(store);
    let counts = store
        .table_counts()
        .with_context(|| format!("Failed to read store {}", store.path().display()))?;
    let digest = store.content_digest()?;
    println!("📦 {}", store.path().display());
    for count in counts {
        println!("   {}: {} rows", count.table, count.rows);
    }
    println!("   sha256: {digest}");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let guard = logging::init_logging(Path::new(DEFAULT_LOG_DIR));

    let cli = Cli::parse();

    let status = match cli.command {
        Commands::Run {
            config,
            customers,
            products,
            sales,
            store,
            report,
        } => {
            println!("🚀 Running pipeline...");
            let args = RunArgs {
                config,
                customers,
                products,
                sales,
                store,
                report,
            };
            match run(args).await {
                Ok(()) => {
                    info!("Run completed");
                    println!("✅ Pipeline completed successfully");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!(code = e.code(), "Run failed: {}", e);
                    eprintln!("❌ {}: {}", e.code(), e);
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Counts { config, store } => match resolve_store(config.as_deref(), store, |key| std::env::var(key).ok())
            .map_err(anyhow::Error::from)
            .and_then(|store| counts(&store))
        {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("❌ {e:#}");
                ExitCode::FAILURE
            }
        },
    };

    // Flush buffered file logs before exiting
    drop(guard);
    status
}
