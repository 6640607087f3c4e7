use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pcf_core::SyncType;
use pcf_engine::{aggregate_root, BomGraph};
use pcf_store::{SeedFile, Store};
use pcf_sync::{
    build_scheduler, JobRunner, JobTimeouts, RetryPolicy, SyncConfig, SyncOptions,
    SyncOrchestrator,
};

#[derive(Debug, Parser)]
#[command(name = "pcf-cli")]
#[command(about = "Product carbon footprint engine command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the database schema.
    InitDb,
    /// Apply a YAML seed file (products, BOM edges, factors, data sources).
    Seed { file: String },
    /// Run one sync for a named data source.
    Sync {
        source: String,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        force: bool,
    },
    /// Report the status of a sync log entry.
    Status { log_id: i64 },
    /// Explode the BOM for one finished product, or all of them.
    Explode {
        #[arg(long)]
        root: Option<String>,
    },
    /// Compute the carbon footprint for one finished product.
    Footprint {
        #[arg(long)]
        root: String,
    },
    /// Run the cron scheduler until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let store = Store::connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;

    match cli.command {
        Commands::InitDb => {
            // Schema creation happens on connect; reaching here means it ran.
            println!("database ready at {}", config.database_url);
        }
        Commands::Seed { file } => {
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {file}"))?;
            let seed = SeedFile::from_yaml(&text).with_context(|| format!("parsing {file}"))?;
            let summary = store.apply_seed(&seed).await?;
            println!(
                "seeded: {} products, {} edges, {} factors, {} data sources",
                summary.products, summary.edges, summary.factors, summary.data_sources
            );
        }
        Commands::Sync {
            source,
            dry_run,
            force,
        } => {
            let orchestrator = SyncOrchestrator::new(store, &config)?;
            let report = orchestrator
                .run_sync(&source, SyncType::Manual, SyncOptions { dry_run, force })
                .await?;
            println!(
                "sync {}: log_id={} processed={} created={} updated={} skipped={} failed={}{}",
                report.data_source,
                report.log_id,
                report.counts.processed,
                report.counts.created,
                report.counts.updated,
                report.counts.skipped,
                report.counts.failed,
                if report.dry_run { " (dry run)" } else { "" }
            );
        }
        Commands::Status { log_id } => {
            let orchestrator = SyncOrchestrator::new(store, &config)?;
            let status = orchestrator.sync_status(log_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Explode { root } => {
            let (products, edges) = store.load_bom_graph().await?;
            let graph = BomGraph::new(products, edges);
            let rows = match root {
                Some(code) => {
                    let product = graph
                        .product_by_code(&code)
                        .with_context(|| format!("no product with code {code}"))?;
                    graph.explode(product.id)
                }
                None => graph.explode_all(),
            };
            for row in &rows {
                println!(
                    "{:>5} {}{} {:.6} {} [{}]",
                    row.level,
                    "  ".repeat(row.level as usize),
                    row.component_name,
                    row.cumulative_quantity,
                    row.unit,
                    row.path_string()
                );
            }
            println!("{} rows", rows.len());
        }
        Commands::Footprint { root } => {
            let (products, edges) = store.load_bom_graph().await?;
            let graph = BomGraph::new(products, edges);
            let product = graph
                .product_by_code(&root)
                .with_context(|| format!("no product with code {root}"))?;
            let rows = graph.explode(product.id);
            let factors = store.active_emission_factors().await?;
            let Some(report) = aggregate_root(&rows, &factors, &[]) else {
                bail!("{root} is not a finished product");
            };
            println!(
                "{}: {:.4} kg CO2e (materials {:.4}, energy {:.4}, transport {:.4}, other {:.4})",
                report.root_name,
                report.total_co2e_kg,
                report.by_category.materials,
                report.by_category.energy,
                report.by_category.transport,
                report.by_category.other
            );
            for gap in &report.unmatched {
                println!(
                    "  no emission factor for {} ({:.6} {})",
                    gap.component_name, gap.cumulative_quantity, gap.unit
                );
            }
        }
        Commands::Schedule => {
            if !config.scheduler_enabled {
                bail!("scheduler is disabled; set PCF_SCHEDULER_ENABLED=1");
            }
            let orchestrator = std::sync::Arc::new(SyncOrchestrator::new(store, &config)?);
            let sources = orchestrator.store().active_data_sources().await?;
            let runner = JobRunner::new(
                orchestrator,
                RetryPolicy::default(),
                JobTimeouts::default(),
            );
            let mut scheduler = build_scheduler(runner, &sources).await?;
            scheduler.start().await?;
            println!("scheduler running for {} sources, ctrl-c to stop", sources.len());
            tokio::signal::ctrl_c().await?;
            scheduler.shutdown().await?;
        }
    }

    Ok(())
}
