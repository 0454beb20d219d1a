use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use feedsync::config::{Config, FeedDescriptor, FeedList};
use feedsync::feed::{FetchScheduler, HttpFetcher};
use feedsync::sync::{BatchDaemon, Session};

/// Get the config directory path (~/.config/feedsync/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedsync"))
}

#[derive(Parser, Debug)]
#[command(
    name = "feedsync",
    version,
    about = "Fetch RSS/Atom feeds into a local cache with sticky per-entry state"
)]
struct Args {
    /// Configuration file (default ~/.config/feedsync/config.toml)
    #[arg(short = 'C', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Cache directory holding one file per feed
    #[arg(short = 'F', long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Read feeds from this serialized feed list instead of the config
    #[arg(long, value_name = "FILE")]
    feed_list: Option<PathBuf>,

    /// Write log output to this file instead of stderr
    #[arg(short = 'L', long, value_name = "FILE")]
    log: Option<PathBuf>,

    /// Update every feed even if its rate has not elapsed
    #[arg(short, long)]
    force: bool,

    /// Log at debug level
    #[arg(short = 'V', long)]
    verbose: bool,

    /// Keep running, updating feeds in the background every tick
    #[arg(short, long)]
    watch: bool,
}

fn init_tracing(args: &Args) -> Result<()> {
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    match &args.log {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create log file '{}'", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Started feedsync");

    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config '{}'", config_path.display()))?;

    let cache_dir = args
        .cache_dir
        .clone()
        .or_else(|| config.cache_dir.clone())
        .unwrap_or_else(|| config_dir.join("feeds"));

    let feeds: Vec<FeedDescriptor> = match &args.feed_list {
        Some(list) => FeedList::read(list)
            .with_context(|| format!("Failed to read feed list '{}'", list.display()))?,
        None => {
            let feeds = config.feeds().context("Invalid feed configuration")?;
            let list = config
                .feed_list
                .clone()
                .unwrap_or_else(|| config_dir.join("feeds.json"));
            // The list is a convenience for external schedulers; failing to
            // write it does not stop this run.
            if let Err(e) = FeedList::write(&list, &feeds) {
                tracing::warn!(path = %list.display(), error = %e, "Failed to write feed list");
            }
            feeds
        }
    };

    if feeds.is_empty() {
        tracing::warn!(config = %config_path.display(), "No feeds configured");
    }

    let client = reqwest::Client::builder()
        .user_agent(concat!("feedsync/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;
    let scheduler = FetchScheduler::new(HttpFetcher::new(client), cache_dir.clone());

    if args.watch {
        // Forcing in watch mode applies to the first round only
        watch(&config, scheduler, feeds, args.force).await?;
    } else {
        let daemon = BatchDaemon::new(scheduler.with_force(args.force), feeds);
        let report = daemon
            .run(chrono::Utc::now().timestamp())
            .await
            .with_context(|| format!("Cache directory '{}' unusable", cache_dir.display()))?;
        if report.failed > 0 || report.corrupt > 0 {
            tracing::warn!(
                failed = report.failed,
                corrupt = report.corrupt,
                "Some feeds were not updated"
            );
        }
    }

    tracing::info!("Gracefully exiting feedsync");
    Ok(())
}

/// Run background updates until interrupted.
async fn watch(
    config: &Config,
    scheduler: FetchScheduler<HttpFetcher>,
    feeds: Vec<FeedDescriptor>,
    force: bool,
) -> Result<()> {
    feedsync::storage::DirectoryReconciler::new(scheduler.cache_dir(), &feeds)
        .reconcile()
        .context("Cache directory unusable")?;

    let mut session = Session::new(
        Arc::new(scheduler),
        feeds,
        config.view_filters(),
        config.active_filter_index(),
    );
    if force {
        session.force_update();
    }

    let mut interval = tokio::time::interval(Duration::from_secs(config.tick_seconds.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                session.poll();
                for report in session.take_reports() {
                    let tag = session
                        .feeds()
                        .get(report.feed)
                        .map(|f| f.tag().to_owned())
                        .unwrap_or_default();
                    tracing::info!(
                        feed = %tag,
                        outcome = report.outcome,
                        new = report.added.len(),
                        gone = report.removed.len(),
                        "Feed update finished"
                    );
                }
                session.tick();
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, waiting for updates in flight");
                session.settle().await;
                return Ok(());
            }
        }
    }
}
