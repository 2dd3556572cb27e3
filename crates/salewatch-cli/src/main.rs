use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use salewatch_core::GroupSource;
use salewatch_storage::{JsonFileTabStore, TabularStore};
use salewatch_sync::{run_once_from_config, CountyRegistry, RunConfig};
use tracing::{error, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "salewatch")]
#[command(about = "Track county foreclosure sale listings in incremental snapshot tabs")]
struct Cli {
    /// Directory holding the tab store (overrides SALEWATCH_STORE_DIR).
    #[arg(long, global = true)]
    store_dir: Option<PathBuf>,

    /// County registry file (overrides SALEWATCH_COUNTIES).
    #[arg(long, global = true)]
    counties: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every enabled county and merge the results into the store.
    Run {
        /// Read saved CivilView pages from this directory instead of the live site.
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Print a stored tab as tab-separated values.
    Show { tab: String },
    /// List the configured counties and their tab titles.
    Counties,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = RunConfig::from_env();
    if let Some(dir) = cli.store_dir {
        config.store_dir = dir;
    }
    if let Some(path) = cli.counties {
        config.counties_path = path;
    }

    match cli.command.unwrap_or(Commands::Run { fixtures: None }) {
        Commands::Run { fixtures } => {
            let summary = run_once_from_config(config, fixtures).await?;
            println!(
                "run complete: run_id={} counties={}/{} fetched={} new={} all_data_new={}",
                summary.run_id,
                summary.groups_succeeded,
                summary.groups_attempted,
                summary.records_fetched,
                summary.total_new_records,
                summary.aggregate_new_records
            );
            for failed in summary.failed_groups() {
                warn!(county = %failed.display_name, "county failed this run");
            }
            if !summary.has_usable_records() {
                error!("no county produced any records");
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Show { tab } => {
            let store = JsonFileTabStore::new(config.store_dir);
            if !store.exists(&tab).await {
                error!(%tab, "no such tab");
                return Ok(ExitCode::FAILURE);
            }
            for row in store.read_all(&tab).await {
                println!("{}", row.join("\t"));
            }
        }
        Commands::Counties => {
            let registry = CountyRegistry::load(&config.counties_path).await?;
            for county in &registry.counties {
                let tab = GroupSource::new(county.county_id.clone(), county.county_name.clone())
                    .tab_title();
                let status = if county.enabled { "enabled" } else { "disabled" };
                println!("{}\t{}\t{}\t{}", county.county_id, county.county_name, tab, status);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
