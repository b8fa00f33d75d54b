//! Remote review source: the public App Store customer-review feed.

use arv_core::{validate_app_id, RepositoryError, Review, ReviewRepository};
use arv_storage::HttpFetcher;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "arv-adapters";

pub const DEFAULT_FEED_BASE_URL: &str = "https://itunes.apple.com";

/// Upstream review ids are URLs; the local id is whatever follows this prefix.
pub const REVIEW_ID_PREFIX: &str = "https://itunes.apple.com/us/reviews/";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("invalid feed payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("feed entry list has unexpected shape: {0}")]
    UnexpectedEntryShape(&'static str),
}

/// Read-only review source backed by the first page of the customer-review feed.
#[derive(Debug, Clone)]
pub struct AppStoreFeed {
    http: HttpFetcher,
    base_url: String,
}

impl AppStoreFeed {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn with_default_base_url(http: HttpFetcher) -> Self {
        Self::new(http, DEFAULT_FEED_BASE_URL)
    }

    pub fn feed_url(&self, app_id: &str) -> String {
        format!(
            "{}/us/rss/customerreviews/id={app_id}/sortBy=mostRecent/page=1/json",
            self.base_url
        )
    }
}

#[async_trait]
impl ReviewRepository for AppStoreFeed {
    async fn find_since(
        &self,
        app_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Review>, RepositoryError> {
        validate_app_id(app_id)?;
        let url = self.feed_url(app_id);
        let page = self
            .http
            .fetch_bytes(app_id, &url)
            .await
            .map_err(|err| RepositoryError::fetch(app_id, err))?;
        let reviews =
            parse_feed(app_id, &page.body, since).map_err(|err| RepositoryError::fetch(app_id, err))?;
        debug!(app_id, kept = reviews.len(), "parsed review feed");
        Ok(reviews)
    }

    async fn merge(&self, _reviews: Vec<Review>) -> Result<(), RepositoryError> {
        Err(RepositoryError::ReadOnly)
    }
}

/// Normalize one feed page into reviews submitted at or after `since`.
///
/// Entries whose rating or timestamp does not parse are skipped; a feed with no
/// entries yields an empty list. `retrieved_at` is stamped per entry.
pub fn parse_feed(
    app_id: &str,
    body: &[u8],
    since: DateTime<Utc>,
) -> Result<Vec<Review>, FeedError> {
    let payload: JsonValue = serde_json::from_slice(body)?;
    let entries: Vec<&JsonValue> = match payload.get("feed").and_then(|feed| feed.get("entry")) {
        None | Some(JsonValue::Null) => return Ok(Vec::new()),
        Some(JsonValue::Array(items)) => items.iter().collect(),
        // The feed collapses a single entry into a bare object.
        Some(entry @ JsonValue::Object(_)) => vec![entry],
        Some(JsonValue::String(_)) => return Err(FeedError::UnexpectedEntryShape("string")),
        Some(JsonValue::Number(_)) => return Err(FeedError::UnexpectedEntryShape("number")),
        Some(JsonValue::Bool(_)) => return Err(FeedError::UnexpectedEntryShape("bool")),
    };

    let mut reviews = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(review) = entry_to_review(app_id, entry) else {
            continue;
        };
        if review.submitted_at < since {
            continue;
        }
        reviews.push(review);
    }
    Ok(reviews)
}

fn entry_to_review(app_id: &str, entry: &JsonValue) -> Option<Review> {
    let raw_id = json_str(entry, &["id", "label"]).unwrap_or_default();

    let Some(score) = json_str(entry, &["im:rating", "label"]).and_then(|s| s.parse::<i32>().ok())
    else {
        debug!(app_id, entry_id = raw_id, "skipping entry without numeric rating");
        return None;
    };
    let Some(submitted_at) = json_str(entry, &["updated", "label"]).and_then(parse_timestamp) else {
        debug!(app_id, entry_id = raw_id, "skipping entry without valid timestamp");
        return None;
    };

    Some(Review {
        id: normalize_review_id(raw_id),
        app_id: app_id.to_string(),
        author: json_str(entry, &["author", "name", "label"])
            .unwrap_or_default()
            .to_string(),
        content: json_str(entry, &["content", "label"])
            .unwrap_or_default()
            .to_string(),
        score,
        submitted_at,
        retrieved_at: Utc::now(),
    })
}

pub fn normalize_review_id(raw: &str) -> String {
    raw.strip_prefix(REVIEW_ID_PREFIX).unwrap_or(raw).to_string()
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}
