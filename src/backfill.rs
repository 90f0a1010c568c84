//! Paginated backfill: walk a subreddit newest-first and publish sale posts.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::config::DEFAULT_PAGE_DELAY_MS;
use crate::filter;
use crate::queue::Publisher;
use crate::reddit::ContentSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The source returned an empty page.
    Exhausted,
    /// A post older than the cutoff was reached.
    Cutoff,
    /// `max_items` posts were published.
    VolumeCap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillSummary {
    pub published: u64,
    pub rejected: u64,
    pub publish_failures: u64,
    pub pages: u64,
    pub stop: StopReason,
}

pub struct BackfillController<'a> {
    source: &'a dyn ContentSource,
    publisher: &'a dyn Publisher,
    page_delay: Duration,
}

impl<'a> BackfillController<'a> {
    pub fn new(source: &'a dyn ContentSource, publisher: &'a dyn Publisher) -> Self {
        Self {
            source,
            publisher,
            page_delay: Duration::from_millis(DEFAULT_PAGE_DELAY_MS),
        }
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    /// Publish sale posts from `channel` until the source runs dry, a post
    /// older than `cutoff` shows up, or `max_items` have been published.
    /// Posts are assumed newest-first, so the first post past the cutoff ends
    /// the run.
    #[instrument(skip_all, fields(channel = %channel))]
    pub async fn run(
        &self,
        channel: &str,
        cutoff: DateTime<Utc>,
        max_items: u64,
        page_size: u32,
    ) -> Result<BackfillSummary> {
        let mut cursor: Option<String> = None;
        let mut summary = BackfillSummary {
            published: 0,
            rejected: 0,
            publish_failures: 0,
            pages: 0,
            stop: StopReason::Exhausted,
        };

        info!(%cutoff, max_items, page_size, "starting backfill");
        'pages: loop {
            if summary.published >= max_items {
                summary.stop = StopReason::VolumeCap;
                break;
            }

            let page = self
                .source
                .fetch_page(channel, cursor.as_deref(), page_size)
                .await
                .with_context(|| format!("failed to fetch page after {:?}", cursor))?;
            summary.pages += 1;
            if page.is_empty() {
                summary.stop = StopReason::Exhausted;
                break;
            }
            debug!(page = summary.pages, posts = page.len(), "fetched page");

            for post in &page {
                if post.created_time < cutoff {
                    info!(post_id = %post.id, created = %post.created_time, "reached cutoff");
                    summary.stop = StopReason::Cutoff;
                    break 'pages;
                }
                if summary.published >= max_items {
                    summary.stop = StopReason::VolumeCap;
                    break 'pages;
                }
                let Some(item) = filter::to_work_item(post) else {
                    summary.rejected += 1;
                    continue;
                };
                match self.publisher.publish(&item).await {
                    Ok(()) => {
                        summary.published += 1;
                        debug!(post_id = %item.post_id, "queued sale post");
                    }
                    Err(err) => {
                        summary.publish_failures += 1;
                        warn!(post_id = %item.post_id, %err, "publish failed; skipping post");
                    }
                }
            }

            cursor = page.last().map(|p| p.id.clone());
            if !self.page_delay.is_zero() {
                tokio::time::sleep(self.page_delay).await;
            }
        }

        info!(
            published = summary.published,
            rejected = summary.rejected,
            publish_failures = summary.publish_failures,
            pages = summary.pages,
            stop = ?summary.stop,
            "backfill finished"
        );
        Ok(summary)
    }
}
