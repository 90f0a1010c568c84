use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use fragwatch::config::{self, Config};
use fragwatch::db::Repository;
use fragwatch::extract::OpenAiExtractor;
use fragwatch::queue::{JetStreamQueue, QueueTopology};
use fragwatch::worker::Worker;

#[derive(Debug, Parser)]
#[command(author, version, about = "Consume queued sale posts, extract listings and store them")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;
    let extractor = Arc::new(OpenAiExtractor::from_config(cfg.require_openai()?)?);

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.app.default_database_url());
    let repo = Repository::connect(&database_url).await?;
    info!(database_url = %database_url, "database opened");

    let result = run(&cfg, &repo, extractor).await;
    repo.close().await;
    result
}

async fn run(cfg: &Config, repo: &Repository, extractor: Arc<OpenAiExtractor>) -> Result<()> {
    repo.migrate().await?;
    repo.ping().await?;

    let queue = Arc::new(
        JetStreamQueue::connect(&cfg.broker.url, QueueTopology::from(&cfg.broker)).await?,
    );
    let result = serve(cfg, repo, extractor, queue.clone()).await;
    if let Err(err) = queue.close().await {
        warn!(%err, "failed to flush broker connection");
    }
    info!("shut down");
    result
}

async fn serve(
    cfg: &Config,
    repo: &Repository,
    extractor: Arc<OpenAiExtractor>,
    queue: Arc<JetStreamQueue>,
) -> Result<()> {
    queue.declare().await?;

    let worker = Worker::new(repo.clone(), extractor)
        .with_persist_retry_delay(cfg.app.persist_retry_delay());
    let shutdown = async {
        if let Err(err) = shutdown_signal().await {
            warn!(?err, "signal listener failed; shutting down");
        }
    };
    if let Some(stats) = worker
        .supervise(queue, shutdown, cfg.app.shutdown_grace())
        .await?
    {
        info!(?stats, "worker finished");
    }
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}
