//! Core domain model, recency policy and repository contracts for ARV.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "arv-core";

/// Lookback that defines "recent" for both the remote fetch and the local read path.
pub const RECENT_REVIEW_WINDOW_HOURS: i64 = 48;

pub fn recent_review_window() -> Duration {
    Duration::hours(RECENT_REVIEW_WINDOW_HOURS)
}

/// Inclusive lower bound for "recent" reviews as seen at `now`.
pub fn recent_threshold(now: DateTime<Utc>) -> DateTime<Utc> {
    now - recent_review_window()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("app id is required")]
    EmptyAppId,
    #[error("app id {0:?} contains characters that are not allowed")]
    InvalidAppId(String),
    #[error("merge batch mixes app ids {expected:?} and {found:?}")]
    MixedAppBatch { expected: String, found: String },
}

/// Application registered for periodic review reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TrackedApp {
    id: String,
}

impl TrackedApp {
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        validate_app_id(&id)?;
        Ok(Self { id })
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// App ids end up inside storage file names, so anything that could escape the
/// data directory is refused along with the empty id.
pub fn validate_app_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::EmptyAppId);
    }
    if id.contains(['/', '\\']) || id.contains("..") || id.chars().any(char::is_control) {
        return Err(ValidationError::InvalidAppId(id.to_string()));
    }
    Ok(())
}

/// A single customer review. Identity is `(app_id, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub id: String,
    pub app_id: String,
    pub author: String,
    pub content: String,
    pub score: i32,
    pub submitted_at: DateTime<Utc>,
    pub retrieved_at: DateTime<Utc>,
}

impl Review {
    pub fn is_recent_since(&self, since: DateTime<Utc>) -> bool {
        self.submitted_at >= since
    }
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("fetching reviews for app {app_id}: {source}")]
    Fetch {
        app_id: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("storage i/o on {}: {source}", .path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("stored data in {} is corrupt: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding data for {}: {source}", .path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("this repository is read-only")]
    ReadOnly,
}

impl RepositoryError {
    pub fn fetch(
        app_id: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Fetch {
            app_id: app_id.into(),
            source: source.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// Review storage capability shared by the local store and the remote feed.
///
/// The remote implementation is a source only: its `merge` always fails with
/// [`RepositoryError::ReadOnly`] so both variants can sit behind the same handle.
#[async_trait]
pub trait ReviewRepository: Send + Sync {
    /// Reviews for `app_id` submitted at or after `since`.
    async fn find_since(
        &self,
        app_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Review>, RepositoryError>;

    /// Upsert by review id. All reviews in one call belong to the same app.
    async fn merge(&self, reviews: Vec<Review>) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait AppRegistry: Send + Sync {
    async fn list_all(&self) -> Result<Vec<TrackedApp>, RepositoryError>;
    async fn register(&self, app: TrackedApp) -> Result<(), RepositoryError>;
}
