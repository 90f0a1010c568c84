//! Queue consumer: dedupe, extract, persist, settle.
use anyhow::{anyhow, Result};
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::config::DEFAULT_PERSIST_RETRY_SECS;
use crate::db::Repository;
use crate::extract::Extractor;
use crate::queue::{self, Consumer, Delivery, Rejection};

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Extracted, persisted and acknowledged.
    Stored { post_id: String, line_items: usize },
    /// Already in the store; acknowledged without extraction.
    Skipped { post_id: String },
    /// Payload could not be decoded; dropped for good.
    Dropped,
    /// Transient failure before persistence; returned to the queue.
    Requeued { post_id: String },
    /// The transaction failed; returned to the queue after a delay.
    PersistFailed { post_id: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub stored: u64,
    pub skipped: u64,
    pub dropped: u64,
    pub requeued: u64,
    pub persist_failed: u64,
    pub consume_errors: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Stored { .. } => self.stored += 1,
            Outcome::Skipped { .. } => self.skipped += 1,
            Outcome::Dropped => self.dropped += 1,
            Outcome::Requeued { .. } => self.requeued += 1,
            Outcome::PersistFailed { .. } => self.persist_failed += 1,
        }
    }
}

pub struct Worker {
    repo: Repository,
    extractor: Arc<dyn Extractor>,
    persist_retry_delay: Duration,
}

impl Worker {
    pub fn new(repo: Repository, extractor: Arc<dyn Extractor>) -> Self {
        Self {
            repo,
            extractor,
            persist_retry_delay: Duration::from_secs(DEFAULT_PERSIST_RETRY_SECS),
        }
    }

    pub fn with_persist_retry_delay(mut self, delay: Duration) -> Self {
        self.persist_retry_delay = delay;
        self
    }

    /// Drain deliveries one at a time until the stream ends or shutdown is
    /// signalled. Shutdown is only observed between messages.
    pub async fn run(
        &self,
        consumer: &dyn Consumer,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<WorkerStats> {
        let mut stats = WorkerStats::default();
        if *shutdown.borrow() {
            return Ok(stats);
        }
        let mut deliveries = consumer.deliveries().await?;
        info!("worker waiting for messages");

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown requested; worker stopping");
                        break;
                    }
                }
                next = deliveries.next() => {
                    match next {
                        None => {
                            info!("delivery stream ended");
                            break;
                        }
                        Some(Err(err)) => {
                            stats.consume_errors += 1;
                            warn!(%err, "failed to receive message");
                        }
                        Some(Ok(delivery)) => {
                            let outcome = self.handle(delivery).await;
                            stats.record(&outcome);
                        }
                    }
                }
            }
        }

        info!(
            stored = stats.stored,
            skipped = stats.skipped,
            dropped = stats.dropped,
            requeued = stats.requeued,
            persist_failed = stats.persist_failed,
            "worker stopped"
        );
        Ok(stats)
    }

    /// Run on a spawned task until it finishes or `shutdown` resolves. After
    /// shutdown the in-flight message gets `grace` to finish; past that the
    /// task is aborted and `Ok(None)` is returned. A worker that fails or
    /// panics is reported as an error.
    pub async fn supervise<S>(
        self,
        consumer: Arc<dyn Consumer>,
        shutdown: S,
        grace: Duration,
    ) -> Result<Option<WorkerStats>>
    where
        S: Future<Output = ()>,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut handle = tokio::spawn(async move { self.run(consumer.as_ref(), stop_rx).await });
        tokio::pin!(shutdown);

        let joined = tokio::select! {
            res = &mut handle => res,
            _ = &mut shutdown => {
                info!(grace_secs = grace.as_secs(), "shutting down; waiting for in-flight message");
                let _ = stop_tx.send(true);
                match tokio::time::timeout(grace, &mut handle).await {
                    Ok(res) => res,
                    Err(_) => {
                        warn!("grace period elapsed; abandoning in-flight message");
                        handle.abort();
                        return Ok(None);
                    }
                }
            }
        };

        match joined {
            Ok(Ok(stats)) => Ok(Some(stats)),
            Ok(Err(err)) => {
                error!(error = %format!("{err:#}"), "worker failed");
                Err(err.context("worker failed"))
            }
            Err(err) => {
                error!(%err, "worker task panicked");
                Err(anyhow!("worker task panicked: {err}"))
            }
        }
    }

    /// Process one delivery and settle it.
    #[instrument(skip_all)]
    pub async fn handle(&self, delivery: Delivery) -> Outcome {
        let item = match queue::decode(delivery.payload()) {
            Ok(item) => item,
            Err(err) => {
                warn!(%err, stage = "deserialize", "bad payload; dropping");
                settle(delivery.reject(Rejection::Drop).await, "", "drop");
                return Outcome::Dropped;
            }
        };
        let post_id = item.post_id.clone();

        match self.repo.post_exists(&post_id).await {
            Ok(true) => {
                info!(post_id = %post_id, "already processed; skipping");
                settle(delivery.ack().await, &post_id, "ack");
                return Outcome::Skipped { post_id };
            }
            Ok(false) => {}
            Err(err) => {
                warn!(
                    post_id = %post_id,
                    stage = "idempotency",
                    error = %format!("{err:#}"),
                    "lookup failed; requeueing"
                );
                settle(
                    delivery
                        .reject(Rejection::RequeueAfter(self.persist_retry_delay))
                        .await,
                    &post_id,
                    "requeue",
                );
                return Outcome::Requeued { post_id };
            }
        }

        info!(post_id = %post_id, title = %item.title, "extracting listing");
        let listing = match self.extractor.extract(&item.extraction_input()).await {
            Ok(listing) => listing,
            Err(err) => {
                warn!(post_id = %post_id, stage = "extract", %err, "extraction failed; requeueing");
                settle(delivery.reject(Rejection::Requeue).await, &post_id, "requeue");
                return Outcome::Requeued { post_id };
            }
        };

        match self.repo.upsert_post_and_listing(&item, &listing).await {
            Ok(stored) => {
                info!(post_id = %post_id, line_items = stored.line_items, "stored listing");
                settle(delivery.ack().await, &post_id, "ack");
                Outcome::Stored {
                    post_id,
                    line_items: stored.line_items,
                }
            }
            Err(err) => {
                error!(
                    post_id = %post_id,
                    stage = "persist",
                    error = %format!("{err:#}"),
                    "failed to store listing"
                );
                settle(
                    delivery
                        .reject(Rejection::RequeueAfter(self.persist_retry_delay))
                        .await,
                    &post_id,
                    "requeue",
                );
                Outcome::PersistFailed { post_id }
            }
        }
    }
}

fn settle(result: Result<(), queue::QueueError>, post_id: &str, action: &str) {
    if let Err(err) = result {
        error!(post_id, action, %err, "failed to settle message");
    }
}
