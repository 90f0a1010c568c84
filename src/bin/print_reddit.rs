use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use fragwatch::config;
use fragwatch::filter;
use fragwatch::queue;
use fragwatch::reddit::{ContentSource, RawPost, RedditClient};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Print the queue payloads a backfill would publish, without publishing"
)]
struct Args {
    /// Path to YAML config file (reads `app` and `reddit`)
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Subreddit to read (defaults to app.subreddit)
    #[arg(long)]
    subreddit: Option<String>,

    /// Look up a single post by id instead of reading the newest page
    #[arg(long)]
    post_id: Option<String>,

    /// Also print posts the sale filter rejects
    #[arg(long, default_value_t = false)]
    show_rejected: bool,
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
    let client = RedditClient::from_config(cfg.require_reddit()?)?;

    let posts = match &args.post_id {
        Some(id) => match client.fetch_post(id).await? {
            Some(post) => vec![post],
            None => {
                println!("post {} not found", id);
                return Ok(());
            }
        },
        None => {
            let channel = args.subreddit.as_deref().unwrap_or(&cfg.app.subreddit);
            client.fetch_page(channel, None, cfg.app.fetch_limit()).await?
        }
    };

    let mut accepted = 0usize;
    for post in &posts {
        print_post(post, args.show_rejected, &mut accepted)?;
    }
    println!("accepted {} of {} posts", accepted, posts.len());
    Ok(())
}

fn print_post(post: &RawPost, show_rejected: bool, accepted: &mut usize) -> Result<()> {
    match filter::to_work_item(post) {
        Some(item) => {
            *accepted += 1;
            let payload = queue::encode(&item)?;
            println!(
                "[{} {}] {}",
                post.created_time.to_rfc3339(),
                post.id,
                String::from_utf8_lossy(&payload)
            );
        }
        None if show_rejected => {
            println!(
                "[{} {}] rejected: {}",
                post.created_time.to_rfc3339(),
                post.id,
                post.title
            );
        }
        None => {}
    }
    Ok(())
}
