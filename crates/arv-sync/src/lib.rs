//! Reconciliation runs, the periodic scheduler and the use-case services built on them.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use arv_adapters::{AppStoreFeed, DEFAULT_FEED_BASE_URL};
use arv_core::{
    recent_threshold, AppRegistry, RepositoryError, Review, ReviewRepository, TrackedApp,
};
use arv_storage::{FileAppRegistry, FileReviewStore, HttpClientConfig, HttpFetcher};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "arv-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub feed_base_url: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub sync_interval_secs: u64,
    pub scheduler_enabled: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            feed_base_url: DEFAULT_FEED_BASE_URL.to_string(),
            http_timeout_secs: 30,
            user_agent: "arv-bot/0.1".to_string(),
            sync_interval_secs: 60,
            scheduler_enabled: true,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("ARV_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            feed_base_url: std::env::var("ARV_FEED_BASE_URL").unwrap_or(defaults.feed_base_url),
            http_timeout_secs: std::env::var("ARV_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: std::env::var("ARV_USER_AGENT").unwrap_or(defaults.user_agent),
            sync_interval_secs: std::env::var("ARV_SYNC_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(defaults.sync_interval_secs),
            scheduler_enabled: std::env::var("ARV_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Fetch,
    Merge,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppFailure {
    pub app_id: String,
    pub stage: FailureStage,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub apps: usize,
    pub fetched_reviews: usize,
    pub merged_reviews: usize,
    pub failures: Vec<AppFailure>,
}

impl ReconcileSummary {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Pulls recent reviews for every tracked app from the remote source and
/// merges them into the local store.
///
/// A failure for one app is recorded in the summary and does not stop the
/// others. Only a failure to list the tracked apps aborts the run.
pub struct Reconciler {
    registry: Arc<dyn AppRegistry>,
    remote: Arc<dyn ReviewRepository>,
    local: Arc<dyn ReviewRepository>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<dyn AppRegistry>,
        remote: Arc<dyn ReviewRepository>,
        local: Arc<dyn ReviewRepository>,
    ) -> Self {
        Self {
            registry,
            remote,
            local,
        }
    }

    pub async fn reconcile(&self) -> Result<ReconcileSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile", %run_id);

        async move {
            let apps = self
                .registry
                .list_all()
                .await
                .context("listing tracked apps")?;
            let since = recent_threshold(started_at);

            let mut fetched_reviews = 0usize;
            let mut merged_reviews = 0usize;
            let mut failures = Vec::new();

            for app in &apps {
                let reviews = match self.remote.find_since(app.id(), since).await {
                    Ok(reviews) => reviews,
                    Err(err) => {
                        warn!(app_id = app.id(), error = %err, "fetching remote reviews failed");
                        failures.push(AppFailure {
                            app_id: app.id().to_string(),
                            stage: FailureStage::Fetch,
                            message: err.to_string(),
                        });
                        continue;
                    }
                };

                let count = reviews.len();
                fetched_reviews += count;

                if let Err(err) = self.local.merge(reviews).await {
                    warn!(app_id = app.id(), error = %err, "merging reviews failed");
                    failures.push(AppFailure {
                        app_id: app.id().to_string(),
                        stage: FailureStage::Merge,
                        message: err.to_string(),
                    });
                    continue;
                }
                merged_reviews += count;
            }

            let summary = ReconcileSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                apps: apps.len(),
                fetched_reviews,
                merged_reviews,
                failures,
            };
            info!(
                apps = summary.apps,
                fetched = summary.fetched_reviews,
                merged = summary.merged_reviews,
                failed = summary.failures.len(),
                "reconcile finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }
}

enum SchedulerState {
    Idle,
    Running {
        cancel: CancellationToken,
        handle: JoinHandle<()>,
    },
}

/// Runs [`Reconciler::reconcile`] on a fixed period until stopped.
pub struct Scheduler {
    reconciler: Arc<Reconciler>,
    period: Duration,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub const DEFAULT_PERIOD: Duration = Duration::from_secs(60);

    pub fn new(reconciler: Arc<Reconciler>, period: Duration) -> Self {
        Self {
            reconciler,
            period,
            state: Mutex::new(SchedulerState::Idle),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        matches!(*state, SchedulerState::Running { .. })
    }

    /// Spawns the tick loop on the current runtime. The first run happens one
    /// period after this call. Calling it while running does nothing.
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, SchedulerState::Running { .. }) {
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_ticks(
            Arc::clone(&self.reconciler),
            self.period,
            cancel.clone(),
        ));
        *state = SchedulerState::Running { cancel, handle };
        info!(period_secs = self.period.as_secs(), "scheduler started");
    }

    /// Cancels the tick loop and waits for it to exit. A reconciliation that is
    /// already underway finishes first.
    pub async fn stop(&self) {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *state, SchedulerState::Idle)
        };
        let SchedulerState::Running { cancel, handle } = previous else {
            return;
        };

        cancel.cancel();
        if let Err(err) = handle.await {
            error!(error = %err, "scheduler task ended abnormally");
        }
        info!("scheduler stopped");
    }
}

async fn run_ticks(reconciler: Arc<Reconciler>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = reconciler.reconcile().await {
                    error!(error = %format!("{err:#}"), "scheduled reconcile failed");
                }
            }
        }
    }
}

/// Entry points used by the HTTP layer and the CLI.
pub struct ReviewService {
    registry: Arc<dyn AppRegistry>,
    local: Arc<dyn ReviewRepository>,
    reconciler: Arc<Reconciler>,
}

impl ReviewService {
    pub fn new(
        registry: Arc<dyn AppRegistry>,
        local: Arc<dyn ReviewRepository>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        Self {
            registry,
            local,
            reconciler,
        }
    }

    /// Registers `app_id` and kicks off a reconciliation. The reconciliation is
    /// best-effort: its failure is logged and the registration still stands.
    pub async fn add_app(&self, app_id: &str) -> Result<TrackedApp, RepositoryError> {
        let app = TrackedApp::new(app_id)?;
        self.registry.register(app.clone()).await?;
        info!(app_id = app.id(), "app registered");

        match self.reconciler.reconcile().await {
            Ok(summary) if !summary.is_clean() => {
                warn!(
                    app_id = app.id(),
                    failed = summary.failures.len(),
                    "reconcile after registration had failures"
                );
            }
            Ok(_) => {}
            Err(err) => {
                warn!(app_id = app.id(), error = %format!("{err:#}"), "reconcile after registration failed");
            }
        }
        Ok(app)
    }

    pub async fn recent_reviews(&self, app_id: &str) -> Result<Vec<Review>, RepositoryError> {
        self.local
            .find_since(app_id, recent_threshold(Utc::now()))
            .await
    }

    pub async fn apps(&self) -> Result<Vec<TrackedApp>, RepositoryError> {
        self.registry.list_all().await
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }
}

/// Everything a process needs, wired against the data directory and the
/// App Store feed.
pub struct SyncRuntime {
    pub service: Arc<ReviewService>,
    pub reconciler: Arc<Reconciler>,
    pub scheduler: Arc<Scheduler>,
    pub scheduler_enabled: bool,
}

impl SyncRuntime {
    pub async fn build(config: &SyncConfig) -> Result<Self> {
        let store = FileReviewStore::open(&config.data_dir)
            .await
            .with_context(|| format!("opening review store at {}", config.data_dir.display()))?;
        let registry = FileAppRegistry::open(&config.data_dir)
            .await
            .with_context(|| format!("opening app registry at {}", config.data_dir.display()))?;
        let http = HttpFetcher::new(config.http_client_config())?;
        let feed = AppStoreFeed::new(http, config.feed_base_url.clone());

        let registry: Arc<dyn AppRegistry> = Arc::new(registry);
        let local: Arc<dyn ReviewRepository> = Arc::new(store);
        let remote: Arc<dyn ReviewRepository> = Arc::new(feed);

        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&registry),
            remote,
            Arc::clone(&local),
        ));
        let service = Arc::new(ReviewService::new(registry, local, Arc::clone(&reconciler)));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&reconciler),
            config.sync_interval(),
        ));

        Ok(Self {
            service,
            reconciler,
            scheduler,
            scheduler_enabled: config.scheduler_enabled,
        })
    }

    pub async fn from_env() -> Result<Self> {
        Self::build(&SyncConfig::from_env()).await
    }
}

pub async fn run_sync_once_from_env() -> Result<ReconcileSummary> {
    let runtime = SyncRuntime::from_env().await?;
    runtime.reconciler.reconcile().await
}
