use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use fragwatch::backfill::{BackfillController, StopReason};
use fragwatch::model::WorkItem;
use fragwatch::queue::{MemoryQueue, Publisher, QueueError};
use fragwatch::reddit::{ContentSource, RawPost};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

fn post(id: &str, title: &str, hours_ago: i64) -> RawPost {
    RawPost {
        id: id.into(),
        title: title.into(),
        body: format!("body of {id}"),
        author: "seller".into(),
        url: format!("https://www.reddit.com/r/fragranceswap/comments/{id}/"),
        created_time: now() - ChronoDuration::hours(hours_ago),
    }
}

#[derive(Debug, Clone, PartialEq)]
struct PageCall {
    channel: String,
    after: Option<String>,
    limit: u32,
}

#[derive(Clone, Default)]
struct PagedSource {
    pages: Arc<Mutex<VecDeque<Result<Vec<RawPost>>>>>,
    calls: Arc<Mutex<Vec<PageCall>>>,
}

impl PagedSource {
    fn with_pages(pages: Vec<Result<Vec<RawPost>>>) -> Self {
        Self {
            pages: Arc::new(Mutex::new(VecDeque::from(pages))),
            ..Default::default()
        }
    }

    async fn calls(&self) -> Vec<PageCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl ContentSource for PagedSource {
    async fn fetch_page(
        &self,
        channel: &str,
        after: Option<&str>,
        limit: u32,
    ) -> Result<Vec<RawPost>> {
        self.calls.lock().await.push(PageCall {
            channel: channel.to_string(),
            after: after.map(str::to_string),
            limit,
        });
        self.pages
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn fetch_post(&self, _id: &str) -> Result<Option<RawPost>> {
        Ok(None)
    }
}

/// Publisher that fails for selected post ids and records the rest.
#[derive(Clone, Default)]
struct FlakyPublisher {
    failing: HashSet<String>,
    published: Arc<Mutex<Vec<WorkItem>>>,
}

impl FlakyPublisher {
    fn failing_for(ids: &[&str]) -> Self {
        Self {
            failing: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    async fn published_ids(&self) -> Vec<String> {
        self.published
            .lock()
            .await
            .iter()
            .map(|i| i.post_id.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl Publisher for FlakyPublisher {
    async fn publish(&self, item: &WorkItem) -> Result<(), QueueError> {
        if self.failing.contains(&item.post_id) {
            return Err(QueueError::Publish("broker unavailable".into()));
        }
        self.published.lock().await.push(item.clone());
        Ok(())
    }
}

fn cutoff() -> DateTime<Utc> {
    now() - ChronoDuration::days(14)
}

#[tokio::test]
async fn publishes_only_sale_posts_until_source_is_exhausted() {
    let source = PagedSource::with_pages(vec![Ok(vec![
        post("a1", "[WTS] Creed Aventus", 1),
        post("a2", "[WTB] Looking for Oud Wood", 2),
        post("a3", "[wts] decants", 3),
    ])]);
    let queue = MemoryQueue::new();

    let summary = BackfillController::new(&source, &queue)
        .with_page_delay(Duration::ZERO)
        .run("fragranceswap", cutoff(), 500, 25)
        .await
        .unwrap();

    assert_eq!(summary.stop, StopReason::Exhausted);
    assert_eq!(summary.published, 2);
    assert_eq!(summary.rejected, 1);
    assert_eq!(summary.pages, 2);
    let ids: Vec<String> = queue
        .pending_items()
        .into_iter()
        .map(|i| i.post_id)
        .collect();
    assert_eq!(ids, vec!["a1".to_string(), "a3".to_string()]);

    let item = &queue.pending_items()[0];
    assert_eq!(item.title, "[WTS] Creed Aventus");
    assert_eq!(item.body, "body of a1");
    assert_eq!(item.seller_username, "seller");
    assert_eq!(item.url, "https://www.reddit.com/r/fragranceswap/comments/a1/");
}

#[tokio::test]
async fn cursor_advances_to_last_post_of_each_page() {
    let source = PagedSource::with_pages(vec![
        Ok(vec![post("p1", "[WTS] one", 1), post("p2", "[WTS] two", 2)]),
        Ok(vec![post("p3", "[WTS] three", 3)]),
    ]);
    let queue = MemoryQueue::new();

    BackfillController::new(&source, &queue)
        .with_page_delay(Duration::ZERO)
        .run("fragranceswap", cutoff(), 500, 2)
        .await
        .unwrap();

    let calls = source.calls().await;
    assert_eq!(
        calls,
        vec![
            PageCall {
                channel: "fragranceswap".into(),
                after: None,
                limit: 2
            },
            PageCall {
                channel: "fragranceswap".into(),
                after: Some("p2".into()),
                limit: 2
            },
            PageCall {
                channel: "fragranceswap".into(),
                after: Some("p3".into()),
                limit: 2
            },
        ]
    );
}

#[tokio::test]
async fn stops_at_first_post_older_than_cutoff() {
    let source = PagedSource::with_pages(vec![
        Ok(vec![
            post("new1", "[WTS] fresh", 1),
            post("old1", "[WTS] stale", 24 * 20),
            post("new2", "[WTS] out of order", 2),
        ]),
        Ok(vec![post("never", "[WTS] unreachable", 3)]),
    ]);
    let queue = MemoryQueue::new();

    let summary = BackfillController::new(&source, &queue)
        .with_page_delay(Duration::ZERO)
        .run("fragranceswap", cutoff(), 500, 25)
        .await
        .unwrap();

    assert_eq!(summary.stop, StopReason::Cutoff);
    assert_eq!(summary.published, 1);
    assert_eq!(summary.pages, 1);
    assert_eq!(source.calls().await.len(), 1);
    assert_eq!(queue.pending_len(), 1);
}

#[tokio::test]
async fn volume_cap_spans_pages() {
    let source = PagedSource::with_pages(vec![
        Ok(vec![post("c1", "[WTS] 1", 1), post("c2", "[WTS] 2", 2)]),
        Ok(vec![post("c3", "[WTS] 3", 3), post("c4", "[WTS] 4", 4)]),
        Ok(vec![post("c5", "[WTS] 5", 5)]),
    ]);
    let queue = MemoryQueue::new();

    let summary = BackfillController::new(&source, &queue)
        .with_page_delay(Duration::ZERO)
        .run("fragranceswap", cutoff(), 3, 2)
        .await
        .unwrap();

    assert_eq!(summary.stop, StopReason::VolumeCap);
    assert_eq!(summary.published, 3);
    assert_eq!(summary.pages, 2);
    assert_eq!(queue.pending_len(), 3);
}

#[tokio::test]
async fn volume_cap_reached_on_page_boundary_skips_next_fetch() {
    let source = PagedSource::with_pages(vec![
        Ok(vec![post("d1", "[WTS] 1", 1), post("d2", "[WTS] 2", 2)]),
        Ok(vec![post("d3", "[WTS] 3", 3)]),
    ]);
    let queue = MemoryQueue::new();

    let summary = BackfillController::new(&source, &queue)
        .with_page_delay(Duration::ZERO)
        .run("fragranceswap", cutoff(), 2, 2)
        .await
        .unwrap();

    assert_eq!(summary.stop, StopReason::VolumeCap);
    assert_eq!(summary.published, 2);
    assert_eq!(source.calls().await.len(), 1);
}

#[tokio::test]
async fn rejected_posts_do_not_count_toward_cap() {
    let source = PagedSource::with_pages(vec![Ok(vec![
        post("r1", "Selling stuff", 1),
        post("r2", "[WTT] trades", 2),
        post("r3", "[WTS] real sale", 3),
    ])]);
    let queue = MemoryQueue::new();

    let summary = BackfillController::new(&source, &queue)
        .with_page_delay(Duration::ZERO)
        .run("fragranceswap", cutoff(), 1, 25)
        .await
        .unwrap();

    assert_eq!(summary.published, 1);
    assert_eq!(summary.rejected, 2);
    assert_eq!(summary.stop, StopReason::VolumeCap);
}

#[tokio::test]
async fn publish_failure_is_skipped_and_run_continues() {
    let source = PagedSource::with_pages(vec![Ok(vec![
        post("f1", "[WTS] one", 1),
        post("f2", "[WTS] two", 2),
        post("f3", "[WTS] three", 3),
    ])]);
    let publisher = FlakyPublisher::failing_for(&["f2"]);

    let summary = BackfillController::new(&source, &publisher)
        .with_page_delay(Duration::ZERO)
        .run("fragranceswap", cutoff(), 500, 25)
        .await
        .unwrap();

    assert_eq!(summary.published, 2);
    assert_eq!(summary.publish_failures, 1);
    assert_eq!(summary.stop, StopReason::Exhausted);
    assert_eq!(
        publisher.published_ids().await,
        vec!["f1".to_string(), "f3".to_string()]
    );
}

#[tokio::test]
async fn fetch_error_aborts_the_run() {
    let source = PagedSource::with_pages(vec![
        Ok(vec![post("e1", "[WTS] one", 1)]),
        Err(anyhow!("reddit returned 503")),
    ]);
    let queue = MemoryQueue::new();

    let err = BackfillController::new(&source, &queue)
        .with_page_delay(Duration::ZERO)
        .run("fragranceswap", cutoff(), 500, 25)
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("503"));
    assert_eq!(queue.pending_len(), 1);
}

#[tokio::test]
async fn zero_cap_publishes_nothing() {
    let source = PagedSource::with_pages(vec![Ok(vec![post("z1", "[WTS] one", 1)])]);
    let queue = MemoryQueue::new();

    let summary = BackfillController::new(&source, &queue)
        .with_page_delay(Duration::ZERO)
        .run("fragranceswap", cutoff(), 0, 25)
        .await
        .unwrap();

    assert_eq!(summary.stop, StopReason::VolumeCap);
    assert_eq!(summary.pages, 0);
    assert!(source.calls().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn waits_between_pages() {
    let source = PagedSource::with_pages(vec![
        Ok(vec![post("w1", "[WTS] one", 1)]),
        Ok(vec![post("w2", "[WTS] two", 2)]),
    ]);
    let queue = MemoryQueue::new();
    let started = tokio::time::Instant::now();

    BackfillController::new(&source, &queue)
        .with_page_delay(Duration::from_millis(2000))
        .run("fragranceswap", cutoff(), 500, 25)
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(4000));
}
