//! File-backed review store, app registry and HTTP fetch utilities for ARV.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use arv_core::{
    validate_app_id, AppRegistry, RepositoryError, Review, ReviewRepository, TrackedApp,
    ValidationError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "arv-storage";

pub const APPS_FILE_NAME: &str = "apps.json";

/// One mutex per key, created on first use. Holders of a key's guard have
/// exclusive access to that key's read-modify-write cycle.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().await;
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> RepositoryError + '_ {
    move |source| RepositoryError::Persistence {
        path: path.to_path_buf(),
        source,
    }
}

/// Read a complete JSON array snapshot. `Ok(None)` means the file does not exist yet;
/// a file that exists but does not parse is reported as corrupt.
pub async fn read_snapshot<T: DeserializeOwned>(
    path: &Path,
) -> Result<Option<Vec<T>>, RepositoryError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_error(path)(err)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| RepositoryError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Replace `path` with a pretty-printed snapshot using a temp file in the same
/// directory and an atomic rename, so readers never observe a partial write.
pub async fn write_snapshot<T: Serialize>(path: &Path, items: &[T]) -> Result<(), RepositoryError> {
    let bytes = serde_json::to_vec_pretty(items).map_err(|source| RepositoryError::Encode {
        path: path.to_path_buf(),
        source,
    })?;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await.map_err(io_error(parent))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let written = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if let Err(source) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(RepositoryError::Persistence {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

/// Local review store: one `{app_id}_reviews.json` snapshot per application.
#[derive(Debug)]
pub struct FileReviewStore {
    root: PathBuf,
    locks: KeyedLocks,
}

impl FileReviewStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: KeyedLocks::new(),
        }
    }

    /// Create the data directory if needed and return a store rooted there.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let store = Self::new(root);
        fs::create_dir_all(&store.root)
            .await
            .map_err(io_error(&store.root))?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_path(&self, app_id: &str) -> PathBuf {
        self.root.join(format!("{app_id}_reviews.json"))
    }
}

#[async_trait]
impl ReviewRepository for FileReviewStore {
    async fn find_since(
        &self,
        app_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Review>, RepositoryError> {
        validate_app_id(app_id)?;
        let path = self.file_path(app_id);
        let stored: Vec<Review> = read_snapshot(&path).await?.unwrap_or_default();
        Ok(stored
            .into_iter()
            .filter(|r| r.app_id == app_id && r.is_recent_since(since))
            .collect())
    }

    async fn merge(&self, reviews: Vec<Review>) -> Result<(), RepositoryError> {
        let Some(first) = reviews.first() else {
            return Ok(());
        };
        let app_id = first.app_id.clone();
        validate_app_id(&app_id)?;
        if let Some(other) = reviews.iter().find(|r| r.app_id != app_id) {
            return Err(ValidationError::MixedAppBatch {
                expected: app_id,
                found: other.app_id.clone(),
            }
            .into());
        }

        let path = self.file_path(&app_id);
        let _guard = self.locks.lock(&app_id).await;

        let existing: Vec<Review> = read_snapshot(&path).await?.unwrap_or_default();
        let mut by_id: BTreeMap<String, Review> = existing
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        let incoming = reviews.len();
        for review in reviews {
            by_id.insert(review.id.clone(), review);
        }

        let merged: Vec<Review> = by_id.into_values().collect();
        write_snapshot(&path, &merged).await?;
        debug!(app_id = %app_id, incoming, stored = merged.len(), "merged reviews");
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AppRecord {
    id: String,
}

/// Registry of tracked applications persisted as a single `apps.json` snapshot.
#[derive(Debug)]
pub struct FileAppRegistry {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileAppRegistry {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            path: root.as_ref().join(APPS_FILE_NAME),
            write_lock: Mutex::new(()),
        }
    }

    pub async fn open(root: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let root = root.as_ref();
        fs::create_dir_all(root).await.map_err(io_error(root))?;
        Ok(Self::new(root))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AppRegistry for FileAppRegistry {
    async fn list_all(&self) -> Result<Vec<TrackedApp>, RepositoryError> {
        let records: Vec<AppRecord> = read_snapshot(&self.path).await?.unwrap_or_default();
        Ok(records
            .into_iter()
            .filter_map(|record| match TrackedApp::new(record.id) {
                Ok(app) => Some(app),
                Err(err) => {
                    warn!(error = %err, "skipping invalid tracked app entry");
                    None
                }
            })
            .collect())
    }

    async fn register(&self, app: TrackedApp) -> Result<(), RepositoryError> {
        let _guard = self.write_lock.lock().await;

        let existing: Vec<AppRecord> = read_snapshot(&self.path).await?.unwrap_or_default();
        let mut by_id: BTreeMap<String, AppRecord> = existing
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        by_id.insert(
            app.id().to_string(),
            AppRecord {
                id: app.id().to_string(),
            },
        );

        let records: Vec<AppRecord> = by_id.into_values().collect();
        write_snapshot(&self.path, &records).await?;
        debug!(app_id = app.id(), tracked = records.len(), "registered app");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

/// Single-shot HTTP GET client with a bounded request timeout. Retrying is left
/// to whoever schedules the next fetch.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, app_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", app_id, url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
