use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use fragwatch::backfill::{BackfillController, StopReason};
use fragwatch::config;
use fragwatch::queue::{JetStreamQueue, QueueTopology};
use fragwatch::reddit::RedditClient;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Walk a subreddit newest-first and queue sale posts for extraction"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Subreddit to walk (defaults to app.subreddit)
    #[arg(long)]
    subreddit: Option<String>,

    /// Stop after publishing this many posts (defaults to app.backfill_max_items)
    #[arg(long)]
    max_items: Option<i64>,

    /// Ignore posts older than this many days (defaults to app.backfill_cutoff_days)
    #[arg(long)]
    cutoff_days: Option<i64>,

    /// Posts per page, 1..=100 (defaults to app.fetch_limit)
    #[arg(long)]
    page_size: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let mut cfg = config::load(Some(&args.config))?;
    if let Some(subreddit) = args.subreddit {
        cfg.app.subreddit = subreddit;
    }
    if args.max_items.is_some() {
        cfg.app.backfill_max_items = args.max_items;
    }
    if args.cutoff_days.is_some() {
        cfg.app.backfill_cutoff_days = args.cutoff_days;
    }
    if args.page_size.is_some() {
        cfg.app.fetch_limit = args.page_size;
    }
    config::validate(&cfg)?;

    let source = RedditClient::from_config(cfg.require_reddit()?)?;
    let queue = JetStreamQueue::connect(&cfg.broker.url, QueueTopology::from(&cfg.broker)).await?;
    let cutoff = cfg.app.backfill_cutoff_from(Utc::now());
    let result = match queue.declare().await {
        Ok(()) => {
            BackfillController::new(&source, &queue)
                .with_page_delay(cfg.app.page_delay())
                .run(
                    &cfg.app.subreddit,
                    cutoff,
                    cfg.app.backfill_max_items(),
                    cfg.app.fetch_limit(),
                )
                .await
        }
        Err(err) => Err(err.into()),
    };

    if let Err(err) = queue.close().await {
        warn!(%err, "failed to flush broker connection");
    }

    let summary = result?;
    match summary.stop {
        StopReason::Exhausted => info!("no more posts available"),
        StopReason::Cutoff => info!(%cutoff, "stopped at cutoff"),
        StopReason::VolumeCap => info!("stopped at volume cap"),
    }
    println!(
        "published={} rejected={} publish_failures={} pages={}",
        summary.published, summary.rejected, summary.publish_failures, summary.pages
    );
    Ok(())
}
