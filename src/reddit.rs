use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Reddit as RedditConfig;

const REDDIT_AUTH_BASE: &str = "https://www.reddit.com/";
const REDDIT_API_BASE: &str = "https://oauth.reddit.com/";
const REDDIT_WEB_BASE: &str = "https://www.reddit.com";
/// Refresh the bearer token this long before Reddit says it expires.
const TOKEN_SLACK: Duration = Duration::from_secs(60);

/// A post as returned by the content source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPost {
    pub id: String,
    pub title: String,
    pub body: String,
    pub author: String,
    pub url: String,
    pub created_time: DateTime<Utc>,
}

/// Paginated access to a single content channel. Pages are newest-first.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Fetch up to `limit` posts older than the post with id `after`
    /// (or the newest posts when `after` is `None`).
    async fn fetch_page(&self, channel: &str, after: Option<&str>, limit: u32)
        -> Result<Vec<RawPost>>;

    /// Fetch a single post by id as it looks right now.
    async fn fetch_post(&self, id: &str) -> Result<Option<RawPost>>;
}

#[derive(Clone)]
struct Credentials {
    client_id: String,
    client_secret: String,
    username: String,
    password: String,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

pub struct RedditClient {
    http: Client,
    auth_url: Url,
    api_url: Url,
    credentials: Credentials,
    token: Mutex<Option<CachedToken>>,
}

impl fmt::Debug for RedditClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedditClient")
            .field("api_url", &self.api_url)
            .field("username", &self.credentials.username)
            .finish_non_exhaustive()
    }
}

impl RedditClient {
    pub fn from_config(cfg: &RedditConfig) -> Result<Self> {
        let auth_url = Url::parse(REDDIT_AUTH_BASE).context("invalid Reddit auth URL")?;
        let api_url = Url::parse(REDDIT_API_BASE).context("invalid Reddit API URL")?;
        Self::with_base_urls(cfg, auth_url, api_url)
    }

    pub fn with_base_urls(cfg: &RedditConfig, auth_url: Url, api_url: Url) -> Result<Self> {
        let http = Client::builder()
            .user_agent(cfg.user_agent.clone())
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self {
            http,
            auth_url,
            api_url,
            credentials: Credentials {
                client_id: cfg.client_id.clone(),
                client_secret: cfg.client_secret.clone(),
                username: cfg.username.clone(),
                password: cfg.password.clone(),
            },
            token: Mutex::new(None),
        })
    }

    /// URL for one page of `/r/{channel}/new`.
    pub fn page_url(&self, channel: &str, after: Option<&str>, limit: u32) -> Result<Url> {
        let mut url = self
            .api_url
            .join(&format!("r/{}/new", channel))
            .context("invalid subreddit path")?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("limit", &limit.to_string());
            q.append_pair("raw_json", "1");
            if let Some(id) = after.filter(|id| !id.is_empty()) {
                q.append_pair("after", &fullname(id));
            }
        }
        Ok(url)
    }

    pub fn post_url(&self, id: &str) -> Result<Url> {
        let mut url = self
            .api_url
            .join(&format!("by_id/{}", fullname(id)))
            .context("invalid post id")?;
        url.query_pairs_mut().append_pair("raw_json", "1");
        Ok(url)
    }

    async fn bearer_token(&self) -> Result<String> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let endpoint = self
            .auth_url
            .join("api/v1/access_token")
            .context("invalid Reddit auth URL")?;
        let res = self
            .http
            .post(endpoint)
            .basic_auth(
                &self.credentials.client_id,
                Some(&self.credentials.client_secret),
            )
            .form(&[
                ("grant_type", "password"),
                ("username", self.credentials.username.as_str()),
                ("password", self.credentials.password.as_str()),
            ])
            .send()
            .await
            .context("failed to reach Reddit auth")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("reddit auth error {}: {}", status, body));
        }
        let token: TokenResponse = res.json().await.context("invalid Reddit token JSON")?;
        if token.access_token.is_empty() {
            return Err(anyhow!("reddit auth returned an empty token"));
        }
        let ttl = Duration::from_secs(token.expires_in.max(0) as u64);
        info!(expires_in = token.expires_in, "obtained Reddit access token");
        let value = token.access_token.clone();
        *guard = Some(CachedToken {
            value: token.access_token,
            refresh_at: Instant::now() + ttl.saturating_sub(TOKEN_SLACK),
        });
        Ok(value)
    }

    async fn get_listing(&self, url: Url) -> Result<Vec<RawPost>> {
        let token = self.bearer_token().await?;
        debug!(%url, "fetching Reddit listing");
        let res = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .context("failed to reach Reddit")?;
        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!("Rate limited by Reddit: {}", body);
            return Err(anyhow!("received 429 from Reddit: {}", body));
        }
        if res.status() == StatusCode::UNAUTHORIZED {
            self.token.lock().await.take();
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("reddit error {}: {}", status, body));
        }
        let body = res.text().await.context("failed to read Reddit response")?;
        parse_listing(&body)
    }
}

#[async_trait]
impl ContentSource for RedditClient {
    async fn fetch_page(
        &self,
        channel: &str,
        after: Option<&str>,
        limit: u32,
    ) -> Result<Vec<RawPost>> {
        let url = self.page_url(channel, after, limit)?;
        self.get_listing(url).await
    }

    async fn fetch_post(&self, id: &str) -> Result<Option<RawPost>> {
        let url = self.post_url(id)?;
        Ok(self.get_listing(url).await?.into_iter().next())
    }
}

/// `abc123` -> `t3_abc123`; already-prefixed ids pass through.
fn fullname(id: &str) -> String {
    if id.starts_with("t3_") {
        id.to_string()
    } else {
        format!("t3_{}", id)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: i64,
}

#[derive(Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<Thing>,
}

#[derive(Deserialize)]
struct Thing {
    kind: String,
    data: LinkData,
}

#[derive(Deserialize)]
struct LinkData {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    selftext: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    permalink: String,
    #[serde(default)]
    created_utc: f64,
}

/// Parse a Reddit listing document into posts, skipping non-link things.
pub fn parse_listing(body: &str) -> Result<Vec<RawPost>> {
    let listing: Listing = serde_json::from_str(body).context("invalid Reddit listing JSON")?;
    let mut posts = Vec::with_capacity(listing.data.children.len());
    for thing in listing.data.children {
        if thing.kind != "t3" {
            continue;
        }
        let d = thing.data;
        let created_time = Utc
            .timestamp_opt(d.created_utc as i64, 0)
            .single()
            .ok_or_else(|| anyhow!("post {} has invalid created_utc {}", d.id, d.created_utc))?;
        posts.push(RawPost {
            url: format!("{}{}", REDDIT_WEB_BASE, d.permalink),
            id: d.id,
            title: d.title,
            body: d.selftext,
            author: d.author,
            created_time,
        });
    }
    Ok(posts)
}
