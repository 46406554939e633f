use std::path::{Path, PathBuf};
use std::sync::Arc;

use adm_adapters::{is_valid_page_id, load_feed_fixture, AutomationDriver, FixtureDriver};
use adm_core::SyncResult;
use adm_storage::{JsonFileStore, RecordStore};
use adm_sync::{maybe_build_scheduler, SyncConfig, SyncManager};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "adm-cli")]
#[command(about = "Mirror ad-library pages into a local JSON store")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Override ADM_DATA_DIR
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Mirror a page for the first time
    Initial {
        #[arg(long)]
        url: String,
        /// Stop after this many unique ads (0 = no cap)
        #[arg(long)]
        max: Option<usize>,
        /// Recorded feed replayed in place of a live browser
        #[arg(long)]
        fixture: PathBuf,
    },
    /// Refresh a page that already has metadata
    Incremental {
        #[arg(long)]
        page_id: String,
        #[arg(long)]
        fixture: PathBuf,
    },
    /// Refresh every tracked page
    SyncAll {
        #[arg(long)]
        fixture: PathBuf,
    },
    /// Print stored page metadata
    Status {
        #[arg(long)]
        page_id: Option<String>,
    },
    /// Run the cron sweep until interrupted
    Schedule {
        #[arg(long)]
        fixture: PathBuf,
    },
}

fn setup_logging(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
        0 => EnvFilter::new("info"),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn build_manager(config: SyncConfig, fixture: &Path) -> Result<SyncManager> {
    let feed = load_feed_fixture(fixture)?;
    info!(feed = %feed.feed_id, pages = feed.pages.len(), "replaying recorded feed");
    let store = Arc::new(JsonFileStore::new(&config.data_dir));
    let drivers = move || -> Box<dyn AutomationDriver> { Box::new(FixtureDriver::new(feed.clone())) };
    Ok(SyncManager::new(config, store, Box::new(drivers)))
}

fn print_result(result: &SyncResult) -> Result<bool> {
    println!("{}", serde_json::to_string_pretty(result)?);
    Ok(result.success)
}

async fn run(cli: Cli) -> Result<bool> {
    let mut config = SyncConfig::from_env();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    match cli.command {
        Commands::Initial { url, max, fixture } => {
            let manager = build_manager(config, &fixture)?;
            print_result(&manager.initial_sync(&url, max).await)
        }
        Commands::Incremental { page_id, fixture } => {
            if !is_valid_page_id(&page_id) {
                bail!("page id must be numeric, got {page_id:?}");
            }
            let manager = build_manager(config, &fixture)?;
            print_result(&manager.incremental_sync(&page_id).await)
        }
        Commands::SyncAll { fixture } => {
            let manager = build_manager(config, &fixture)?;
            let results = manager.sync_tracked_pages().await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
            Ok(results.iter().all(|r| r.success))
        }
        Commands::Status { page_id } => {
            let store = JsonFileStore::new(&config.data_dir);
            let pages = match page_id {
                Some(page_id) => vec![page_id],
                None => store.list_pages().await?,
            };
            let mut found = Vec::with_capacity(pages.len());
            for page_id in &pages {
                match store.get_metadata(page_id).await? {
                    Some(metadata) => found.push(metadata),
                    None => bail!("page {page_id} has not been synced"),
                }
            }
            println!("{}", serde_json::to_string_pretty(&found)?);
            Ok(true)
        }
        Commands::Schedule { fixture } => {
            config.scheduler_enabled = true;
            let manager = Arc::new(build_manager(config, &fixture)?);
            let Some(mut sched) = maybe_build_scheduler(manager.clone()).await? else {
                bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %manager.config().sync_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    if !run(cli).await? {
        std::process::exit(1);
    }
    Ok(())
}
