//! JSON API over the review service.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use arv_core::{RepositoryError, Review, TrackedApp, ValidationError};
use arv_sync::ReviewService;
use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "arv-web";
pub const DEFAULT_WEB_PORT: u16 = 8080;

const ALLOWED_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";
const ALLOWED_HEADERS: &str = "Content-Type, Authorization";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ReviewService>,
}

impl AppState {
    pub fn new(service: Arc<ReviewService>) -> Self {
        Self { service }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReviewBody {
    id: String,
    content: String,
    score: i32,
    author: String,
    submitted_at: DateTime<Utc>,
    app_id: String,
}

impl From<Review> for ReviewBody {
    fn from(review: Review) -> Self {
        Self {
            id: review.id,
            content: review.content,
            score: review.score,
            author: review.author,
            submitted_at: review.submitted_at,
            app_id: review.app_id,
        }
    }
}

#[derive(Debug, Serialize)]
struct RecentReviewsBody {
    reviews: Vec<ReviewBody>,
}

#[derive(Debug, Serialize)]
struct AppBody {
    id: String,
}

#[derive(Debug, Serialize)]
struct AppsBody {
    apps: Vec<AppBody>,
}

#[derive(Debug, Deserialize)]
struct AddAppRequest {
    #[serde(rename = "appId", default)]
    app_id: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/app", get(list_apps_handler).post(add_app_handler))
        .route(
            "/api/v1/app/{app_id}/reviews/recent",
            get(recent_reviews_handler),
        )
        .with_state(Arc::new(state))
        .layer(middleware::from_fn(cors))
}

pub fn port_from_env() -> u16 {
    std::env::var("ARV_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_WEB_PORT)
}

/// Serves the API on `listener` until `shutdown` resolves, then drains
/// in-flight requests.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "http server listening");
    }
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("running http server")?;
    info!("http server stopped");
    Ok(())
}

async fn cors(request: Request, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOWED_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOWED_HEADERS),
    );
    response
}

async fn recent_reviews_handler(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
) -> Response {
    match state.service.recent_reviews(&app_id).await {
        Ok(reviews) => Json(RecentReviewsBody {
            reviews: reviews.into_iter().map(ReviewBody::from).collect(),
        })
        .into_response(),
        Err(err) => repository_error(err),
    }
}

async fn add_app_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let Ok(request) = serde_json::from_slice::<AddAppRequest>(&body) else {
        return (StatusCode::BAD_REQUEST, "Invalid request body").into_response();
    };

    match state.service.add_app(&request.app_id).await {
        Ok(_) => (StatusCode::CREATED, Json(serde_json::json!({}))).into_response(),
        Err(err) => repository_error(err),
    }
}

async fn list_apps_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.apps().await {
        Ok(apps) => Json(AppsBody {
            apps: apps.iter().map(app_body).collect(),
        })
        .into_response(),
        Err(err) => repository_error(err),
    }
}

fn app_body(app: &TrackedApp) -> AppBody {
    AppBody {
        id: app.id().to_string(),
    }
}

fn repository_error(err: RepositoryError) -> Response {
    match err {
        RepositoryError::Validation(ValidationError::EmptyAppId) => {
            (StatusCode::BAD_REQUEST, "AppID is required").into_response()
        }
        RepositoryError::Validation(err) => {
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
        err => server_error(err),
    }
}

fn server_error(err: RepositoryError) -> Response {
    error!(error = %err, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, format!("Server error: {err}")).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arv_core::{AppRegistry, ReviewRepository};
    use arv_storage::{FileAppRegistry, FileReviewStore};
    use arv_sync::Reconciler;
    use async_trait::async_trait;
    use axum::body::Body;
    use chrono::Duration;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct EmptyFeed;

    #[async_trait]
    impl ReviewRepository for EmptyFeed {
        async fn find_since(
            &self,
            _app_id: &str,
            _since: DateTime<Utc>,
        ) -> Result<Vec<Review>, RepositoryError> {
            Ok(Vec::new())
        }

        async fn merge(&self, _reviews: Vec<Review>) -> Result<(), RepositoryError> {
            Err(RepositoryError::ReadOnly)
        }
    }

    struct Fixture {
        dir: TempDir,
        store: Arc<FileReviewStore>,
        state: AppState,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileReviewStore::open(dir.path()).await.unwrap());
        let registry: Arc<dyn AppRegistry> =
            Arc::new(FileAppRegistry::open(dir.path()).await.unwrap());
        let reconciler = Arc::new(Reconciler::new(
            registry.clone(),
            Arc::new(EmptyFeed),
            store.clone(),
        ));
        let service = Arc::new(ReviewService::new(registry, store.clone(), reconciler));
        Fixture {
            dir,
            store,
            state: AppState::new(service),
        }
    }

    fn review(id: &str, age_hours: i64) -> Review {
        let now = Utc::now();
        Review {
            id: id.into(),
            app_id: "595068606".into(),
            author: "Jane".into(),
            content: "Great app".into(),
            score: 5,
            submitted_at: now - Duration::hours(age_hours),
            retrieved_at: now,
        }
    }

    async fn body_text(resp: Response) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn post_app(body: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri("/api/v1/app")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn recent_reviews_for_unknown_app_is_empty_list() {
        let fx = fixture().await;
        let resp = app(fx.state)
            .oneshot(get("/api/v1/app/595068606/reviews/recent"))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
        assert_eq!(body_text(resp).await, r#"{"reviews":[]}"#);
    }

    #[tokio::test]
    async fn recent_reviews_returns_only_last_48_hours() {
        let fx = fixture().await;
        fx.store
            .merge(vec![review("old", 50), review("fresh", 10)])
            .await
            .unwrap();

        let resp = app(fx.state)
            .oneshot(get("/api/v1/app/595068606/reviews/recent"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        let reviews = json["reviews"].as_array().unwrap();
        assert_eq!(reviews.len(), 1);
        let first = &reviews[0];
        assert_eq!(first["id"], "fresh");
        assert_eq!(first["content"], "Great app");
        assert_eq!(first["score"], 5);
        assert_eq!(first["author"], "Jane");
        assert_eq!(first["appId"], "595068606");
        assert!(first["submittedAt"].as_str().unwrap().ends_with('Z'));
        assert!(first.get("retrievedAt").is_none());
    }

    #[tokio::test]
    async fn add_app_returns_created_and_is_listed() {
        let fx = fixture().await;
        let router = app(fx.state);

        let resp = router
            .clone()
            .oneshot(post_app(r#"{"appId":"595068606"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(body_text(resp).await, "{}");

        let resp = router.oneshot(get("/api/v1/app")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, r#"{"apps":[{"id":"595068606"}]}"#);
        assert!(fx.dir.path().join("apps.json").exists());
    }

    #[tokio::test]
    async fn add_app_rejects_malformed_body() {
        let fx = fixture().await;
        let resp = app(fx.state).oneshot(post_app("{not json")).await.unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(resp).await, "Invalid request body");
    }

    #[tokio::test]
    async fn add_app_requires_an_app_id() {
        let fx = fixture().await;
        let router = app(fx.state);

        for body in [r#"{"appId":""}"#, "{}"] {
            let resp = router.clone().oneshot(post_app(body)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
            assert_eq!(body_text(resp).await, "AppID is required");
        }
        assert!(!fx.dir.path().join("apps.json").exists());
    }

    #[tokio::test]
    async fn add_app_rejects_path_like_ids() {
        let fx = fixture().await;
        let resp = app(fx.state)
            .oneshot(post_app(r#"{"appId":"../etc"}"#))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn corrupt_registry_is_a_server_error() {
        let fx = fixture().await;
        std::fs::write(fx.dir.path().join("apps.json"), "[{").unwrap();

        let resp = app(fx.state).oneshot(get("/api/v1/app")).await.unwrap();

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_text(resp).await.starts_with("Server error:"));
    }

    #[tokio::test]
    async fn responses_carry_cors_headers() {
        let fx = fixture().await;
        let resp = app(fx.state).oneshot(get("/api/v1/app")).await.unwrap();

        let headers = resp.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], ALLOWED_METHODS);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], ALLOWED_HEADERS);
    }

    #[tokio::test]
    async fn options_preflight_short_circuits() {
        let fx = fixture().await;
        let resp = app(fx.state)
            .oneshot(
                axum::http::Request::builder()
                    .method("OPTIONS")
                    .uri("/api/v1/app")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(body_text(resp).await.is_empty());
        assert!(!fx.dir.path().join("apps.json").exists());
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown_signal() {
        let fx = fixture().await;
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let server = tokio::spawn(serve(listener, fx.state, async move {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();

        server.await.unwrap().unwrap();
    }
}
