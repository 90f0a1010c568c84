use super::model::{LineItemRow, PersistedPost};
use crate::model::{Listing, Offer, WorkItem};
use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info, instrument, warn};

pub type Pool = SqlitePool;

/// Rows per multi-row INSERT; four binds each keeps us under SQLite's
/// default limit of 999 bound parameters.
const INSERT_CHUNK: usize = 200;

/// Owns the connection pool. Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: Pool,
}

impl Repository {
    /// Open (creating if needed) the database at `database_url`.
    /// In-memory URLs get a single long-lived connection so every query sees
    /// the same database.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let url = prepare_sqlite_url(database_url);
        let in_memory = url.contains(":memory:");
        let options = SqliteConnectOptions::from_str(&url)
            .with_context(|| format!("invalid database URL {url}"))?
            .create_if_missing(true)
            .journal_mode(if in_memory {
                SqliteJournalMode::Memory
            } else {
                SqliteJournalMode::Wal
            })
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(true);
        let mut pool_options = SqlitePoolOptions::new();
        if in_memory {
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options
            .connect_with(options)
            .await
            .context("failed to open database")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Idempotency check: has this post already been stored?
    #[instrument(skip_all, fields(post_id = %reddit_id))]
    pub async fn post_exists(&self, reddit_id: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM posts WHERE reddit_id = ?")
            .bind(reddit_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Upsert the post and insert all of its offers in one transaction.
    /// Nothing is written unless every statement succeeds.
    #[instrument(skip_all, fields(post_id = %item.post_id))]
    pub async fn upsert_post_and_listing(
        &self,
        item: &WorkItem,
        listing: &Listing,
    ) -> Result<PersistedPost> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;

        let post_id: i64 = sqlx::query_scalar(
            "INSERT INTO posts (reddit_id, url, seller_username) VALUES (?, ?, ?) \
             ON CONFLICT (reddit_id) DO UPDATE SET \
                url = excluded.url, \
                seller_username = excluded.seller_username, \
                updated_at = CURRENT_TIMESTAMP \
             RETURNING id",
        )
        .bind(&item.post_id)
        .bind(&item.url)
        .bind(&item.seller_username)
        .fetch_one(&mut *tx)
        .await
        .context("failed to upsert post")?;

        if listing.dropped > 0 {
            warn!(dropped = listing.dropped, "listing had unpaired sizes or prices");
        }

        let rows: Vec<(&str, &Offer)> = listing
            .entries
            .iter()
            .flat_map(|e| e.offers.iter().map(move |o| (e.name.as_str(), o)))
            .collect();

        if rows.is_empty() {
            info!(url = %item.url, "no line items found; storing post only");
            tx.commit().await.context("failed to commit post")?;
            return Ok(PersistedPost {
                id: post_id,
                line_items: 0,
            });
        }

        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO listings (post_id, name, size, price) ");
            qb.push_values(chunk, |mut b, &(name, offer)| {
                b.push_bind(post_id)
                    .push_bind(name)
                    .push_bind(offer.size.as_str())
                    .push_bind(offer.price.as_str());
            });
            qb.build()
                .execute(&mut *tx)
                .await
                .context("failed to insert line items")?;
        }

        tx.commit().await.context("failed to commit listing")?;
        debug!(post = post_id, line_items = rows.len(), "stored listing");
        Ok(PersistedPost {
            id: post_id,
            line_items: rows.len(),
        })
    }

    #[instrument(skip_all)]
    pub async fn line_items_for(&self, reddit_id: &str) -> Result<Vec<LineItemRow>> {
        let rows = sqlx::query_as::<_, LineItemRow>(
            "SELECT l.post_id, l.name, l.size, l.price FROM listings l \
             JOIN posts p ON p.id = l.post_id WHERE p.reddit_id = ? ORDER BY l.id",
        )
        .bind(reddit_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Number of line items stored for one post; zero for unknown posts.
    pub async fn listing_count(&self, reddit_id: &str) -> Result<i64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(l.id) FROM listings l \
             JOIN posts p ON p.id = l.post_id WHERE p.reddit_id = ?",
        )
        .bind(reddit_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }

    pub async fn count_posts(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn count_line_items(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM listings")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

/// Normalize a SQLite URL: expand a leading `~/` and create the parent
/// directory of file-backed databases. Other schemes and in-memory URLs pass
/// through unchanged.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{}?{}", path, q),
        None => format!("sqlite://{}", path),
    }
}
