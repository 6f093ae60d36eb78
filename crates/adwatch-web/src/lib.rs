//! Axum JSON API over the listing corpus and the ingestion runner.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use adwatch_core::Listing;
use adwatch_storage::CorpusStats;
use adwatch_sync::{
    export_listings, CycleError, CycleReport, ExportFormat, IngestionRunner, RunnerState, Trigger,
    TriggerOutcome,
};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "adwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<IngestionRunner>,
    pub export_dir: PathBuf,
}

impl AppState {
    pub fn new(runner: Arc<IngestionRunner>, export_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            export_dir: export_dir.into(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ListingsQuery {
    #[serde(default = "default_true")]
    include_seen: bool,
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    format: Option<String>,
    #[serde(default = "default_true")]
    include_seen: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MarkSeenResponse {
    pub marked: usize,
    pub requested: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScrapeResponse {
    pub new_listings: usize,
    pub total_listings: usize,
    pub unseen_listings: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExportResponse {
    pub message: String,
    pub path: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub state: RunnerState,
    pub last_report: Option<CycleReport>,
    pub last_error: Option<String>,
    pub corpus: CorpusStats,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/listings", get(listings_handler))
        .route("/listings/mark-seen", post(mark_seen_handler))
        .route("/listings/export", post(export_handler))
        .route("/scrape", post(scrape_handler))
        .route("/status", get(status_handler))
        .with_state(Arc::new(state))
}

/// Serve the API on `port` until `shutdown` resolves.
pub async fn serve<F>(state: AppState, port: u16, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn listings_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListingsQuery>,
) -> Json<Vec<Listing>> {
    let store = state.runner.store();
    let listings = if query.include_seen {
        store.listings().await
    } else {
        store.unseen().await
    };
    Json(listings)
}

async fn mark_seen_handler(
    State(state): State<Arc<AppState>>,
    Json(ids): Json<Vec<String>>,
) -> Response {
    match state.runner.store().mark_seen(&ids).await {
        Ok(marked) => Json(MarkSeenResponse {
            marked,
            requested: ids.len(),
        })
        .into_response(),
        Err(err) => {
            error!(error = %err, "mark-seen failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn scrape_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.runner.try_run_cycle(Trigger::OnDemand).await {
        TriggerOutcome::Completed(report) => Json(ScrapeResponse {
            new_listings: report.new_listings,
            total_listings: report.total_listings,
            unseen_listings: report.unseen_listings,
        })
        .into_response(),
        TriggerOutcome::Skipped => json_error(
            StatusCode::CONFLICT,
            "an ingestion cycle is already running",
        ),
        TriggerOutcome::Failed(err) => {
            let message = match &err {
                CycleError::Store(_) => format!("corpus could not be persisted: {err}"),
                CycleError::Aborted(_) => err.to_string(),
            };
            json_error(StatusCode::INTERNAL_SERVER_ERROR, message)
        }
    }
}

async fn export_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExportQuery>,
) -> Response {
    let format: ExportFormat = match query.format.as_deref().unwrap_or("csv").parse() {
        Ok(format) => format,
        Err(err) => return json_error(StatusCode::BAD_REQUEST, format!("{err}")),
    };

    let listings = state.runner.store().listings().await;
    let dir = state.export_dir.clone();
    let include_seen = query.include_seen;
    let written =
        tokio::task::spawn_blocking(move || export_listings(&listings, format, &dir, include_seen))
            .await;

    match written {
        Ok(Ok(Some(path))) => Json(ExportResponse {
            message: "Export completed".to_string(),
            path: Some(path.display().to_string()),
        })
        .into_response(),
        Ok(Ok(None)) => Json(ExportResponse {
            message: "No listings to export".to_string(),
            path: None,
        })
        .into_response(),
        Ok(Err(err)) => {
            error!(error = %err, "export failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        state: state.runner.state(),
        last_report: state.runner.last_report().await,
        last_error: state.runner.last_error().await,
        corpus: state.runner.store().stats().await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use adwatch_adapters::{AdapterError, FixturePageFetcher, PageFetcher};
    use adwatch_core::{assign_id, RawListing};
    use adwatch_storage::CorpusStore;
    use adwatch_sync::PaginationConfig;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::Notify;
    use tower::ServiceExt;

    fn pagination() -> PaginationConfig {
        PaginationConfig {
            max_pages: 2,
            page_timeout: Duration::from_secs(5),
            page_delay: Duration::ZERO,
        }
    }

    async fn fixture_state(dir: &Path) -> AppState {
        let pages = dir.join("pages");
        std::fs::create_dir_all(&pages).unwrap();
        std::fs::write(
            pages.join("page-1.json"),
            r#"[
                {"title":"Bike","price":"100€","link":"https://x/1"},
                {"title":"Bike","price":"100€","link":"https://x/1"},
                {"title":"Chair","price":"20€","link":"https://x/2"}
            ]"#,
        )
        .unwrap();
        let store = Arc::new(CorpusStore::open(dir.join("data.json")).await.unwrap());
        let runner = Arc::new(IngestionRunner::new(
            store,
            Arc::new(FixturePageFetcher::new(pages)),
            pagination(),
        ));
        AppState::new(runner, dir.join("exports"))
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_empty(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn scrape_then_list_and_mark_seen() {
        let dir = tempdir().unwrap();
        let app = app(fixture_state(dir.path()).await);

        let (status, scrape) = send(&app, post_empty("/scrape")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(scrape["new_listings"], 2);
        assert_eq!(scrape["total_listings"], 2);

        let (_, again) = send(&app, post_empty("/scrape")).await;
        assert_eq!(again["new_listings"], 0);

        let (status, all) = send(&app, get("/listings")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(all.as_array().unwrap().len(), 2);

        let bike = assign_id("Bike", "100€");
        let (status, marked) = send(
            &app,
            post_json("/listings/mark-seen", serde_json::json!([bike, "unknown"])),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(marked["marked"], 1);
        assert_eq!(marked["requested"], 2);

        let (_, unseen) = send(&app, get("/listings?include_seen=false")).await;
        let unseen = unseen.as_array().unwrap();
        assert_eq!(unseen.len(), 1);
        assert_eq!(unseen[0]["title"], "Chair");

        let (_, status_body) = send(&app, get("/status")).await;
        assert_eq!(status_body["state"], "idle");
        assert_eq!(status_body["corpus"]["total"], 2);
        assert_eq!(status_body["corpus"]["unseen"], 1);
        assert_eq!(status_body["last_report"]["trigger"], "on_demand");
    }

    #[tokio::test]
    async fn export_validates_format_and_reports_empty_exports() {
        let dir = tempdir().unwrap();
        let app = app(fixture_state(dir.path()).await);

        let (status, _) = send(&app, post_empty("/listings/export?format=pdf")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, empty) = send(&app, post_empty("/listings/export?format=csv")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(empty["path"].is_null());

        send(&app, post_empty("/scrape")).await;
        let (status, written) =
            send(&app, post_empty("/listings/export?format=excel&include_seen=false")).await;
        assert_eq!(status, StatusCode::OK);
        let path = written["path"].as_str().expect("export path");
        assert!(path.ends_with("unseen_listings.xlsx"));
        assert!(Path::new(path).exists());
    }

    struct GatedFetcher {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl PageFetcher for GatedFetcher {
        async fn fetch_page(&self, page: u32) -> Result<Vec<RawListing>, AdapterError> {
            if page > 1 {
                return Ok(Vec::new());
            }
            self.entered.notify_one();
            self.release.notified().await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn scrape_while_cycle_running_is_conflict() {
        let dir: TempDir = tempdir().unwrap();
        let store = Arc::new(CorpusStore::open(dir.path().join("data.json")).await.unwrap());
        let fetcher = Arc::new(GatedFetcher {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let runner = Arc::new(IngestionRunner::new(store, fetcher.clone(), pagination()));
        let app = app(AppState::new(Arc::clone(&runner), dir.path().join("exports")));

        let first = tokio::spawn({
            let app = app.clone();
            async move { send(&app, post_empty("/scrape")).await }
        });
        fetcher.entered.notified().await;

        let (status, body) = send(&app, post_empty("/scrape")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("already running"));

        let (_, status_body) = send(&app, get("/status")).await;
        assert_eq!(status_body["state"], "running");

        fetcher.release.notify_one();
        let (status, _) = first.await.unwrap();
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn scrape_store_failure_is_server_error() {
        let dir = tempdir().unwrap();
        let state = fixture_state(dir.path()).await;
        std::fs::remove_file(dir.path().join("data.json")).unwrap();
        std::fs::create_dir(dir.path().join("data.json")).unwrap();
        let app = app(state);

        let (status, body) = send(&app, post_empty("/scrape")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().is_some());

        let (_, listings) = send(&app, get("/listings")).await;
        assert_eq!(listings.as_array().unwrap().len(), 0);
    }
}
