use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_stream::wrappers::ReceiverStream;
use tracing::error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::db::{self, JobRow};
use crate::job;
use crate::progress::{ProgressSnapshot, StreamEmit, StreamState};
use crate::worker::MAX_WORKERS;

pub const MAX_PAGE_LIMIT: u32 = 50;
pub const DEFAULT_PAGE_LIMIT: u32 = 3;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ScrapeRequest {
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// When true the response returns immediately and progress is consumed
    /// via the SSE endpoint; otherwise the request blocks until the job
    /// finishes.
    #[serde(default)]
    pub stream: bool,
}

fn default_page_limit() -> u32 {
    DEFAULT_PAGE_LIMIT
}

fn default_concurrency() -> usize {
    1
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize, ToSchema)]
pub struct JobAccepted {
    pub job_id: Uuid,
    pub status: String,
}

#[derive(Serialize, ToSchema)]
pub struct JobCompleted {
    pub job_id: Uuid,
    pub status: String,
    pub listings_found: usize,
    pub new_count: usize,
    pub updated_count: usize,
    pub pages_scraped: u32,
    pub keywords_processed: Vec<String>,
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn internal_error(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse { error: message }),
    )
        .into_response()
}

/// Start a scrape job.
#[utoipa::path(
    post,
    path = "/api/v1/scraper/jobs",
    request_body = ScrapeRequest,
    responses(
        (status = 201, description = "Job finished (synchronous mode)", body = JobCompleted),
        (status = 202, description = "Job accepted (streaming mode)", body = JobAccepted),
        (status = 400, description = "Invalid parameters", body = ErrorResponse)
    ),
    tag = "scraper"
)]
pub async fn trigger_scrape(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ScrapeRequest>,
) -> Response {
    // Validate before creating any job row.
    if payload.page_limit < 1 || payload.page_limit > MAX_PAGE_LIMIT {
        return bad_request(&format!("page_limit must be between 1 and {}", MAX_PAGE_LIMIT));
    }
    if payload.concurrency < 1 || payload.concurrency > MAX_WORKERS {
        return bad_request(&format!("concurrency must be between 1 and {}", MAX_WORKERS));
    }

    let job_id = Uuid::new_v4();
    if let Err(e) = db::create_job(&state.pool, job_id, payload.page_limit, payload.concurrency).await
    {
        return internal_error(format!("could not create job: {}", e));
    }
    let initial = ProgressSnapshot::running("Job queued");
    if let Err(e) = db::save_progress(&state.pool, job_id, &initial).await {
        error!("Could not save initial snapshot for job {}: {}", job_id, e);
    }

    if payload.stream {
        let pool = state.pool.clone();
        tokio::spawn(async move {
            if let Err(e) =
                job::run_scraper_job(pool.clone(), job_id, payload.page_limit, payload.concurrency)
                    .await
            {
                job::fail_job(&pool, job_id, &e.to_string()).await;
            }
        });
        return (
            StatusCode::ACCEPTED,
            Json(JobAccepted {
                job_id,
                status: "running".to_string(),
            }),
        )
            .into_response();
    }

    match job::run_scraper_job(
        state.pool.clone(),
        job_id,
        payload.page_limit,
        payload.concurrency,
    )
    .await
    {
        Ok(summary) => (
            StatusCode::CREATED,
            Json(JobCompleted {
                job_id,
                status: "completed".to_string(),
                listings_found: summary.listings_found,
                new_count: summary.new_count,
                updated_count: summary.updated_count,
                pages_scraped: summary.pages_scraped,
                keywords_processed: summary.keywords_processed,
            }),
        )
            .into_response(),
        Err(e) => {
            job::fail_job(&state.pool, job_id, &e.to_string()).await;
            internal_error(e.to_string())
        }
    }
}

/// Fetch one job's row, including its latest progress snapshot.
#[utoipa::path(
    get,
    path = "/api/v1/scraper/jobs/{job_id}",
    params(("job_id" = Uuid, Path, description = "Job id")),
    responses(
        (status = 200, description = "Job found", body = JobRow),
        (status = 404, description = "No such job", body = ErrorResponse)
    ),
    tag = "scraper"
)]
pub async fn get_job_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Response {
    match db::get_job(&state.pool, job_id).await {
        Ok(Some(row)) => Json(row).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("no job {}", job_id),
            }),
        )
            .into_response(),
        Err(e) => internal_error(e.to_string()),
    }
}

/// List recent jobs, newest first.
#[utoipa::path(
    get,
    path = "/api/v1/scraper/jobs",
    responses((status = 200, description = "Recent jobs", body = [JobRow])),
    tag = "scraper"
)]
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> Response {
    match db::list_jobs(&state.pool, 50).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => internal_error(e.to_string()),
    }
}

/// Stream a job's progress as server-sent events.
///
/// Emits `connected` once, then `progress` whenever the stored snapshot
/// changes, `ping` after 30 idle seconds, and a final `complete` (or
/// `error`) before closing.
#[utoipa::path(
    get,
    path = "/api/v1/scraper/jobs/{job_id}/progress",
    params(("job_id" = Uuid, Path, description = "Job id")),
    responses(
        (status = 200, description = "SSE progress stream"),
        (status = 404, description = "No such job", body = ErrorResponse)
    ),
    tag = "scraper"
)]
pub async fn stream_progress(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Response> {
    match db::get_job(&state.pool, job_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return Err((
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: format!("no job {}", job_id),
                }),
            )
                .into_response())
        }
        Err(e) => return Err(internal_error(e.to_string())),
    }

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(16);
    let pool = state.pool.clone();

    tokio::spawn(async move {
        let connected = Event::default()
            .event("connected")
            .data(format!(r#"{{"job_id":"{}"}}"#, job_id));
        if tx.send(Ok(connected)).await.is_err() {
            return;
        }

        // A missing snapshot means the job has not reported yet; a stable
        // synthesized payload avoids emitting it more than once.
        let waiting = r#"{"status":"waiting"}"#.to_string();
        let mut stream = StreamState::new(Instant::now());

        loop {
            let job = match db::get_job(&pool, job_id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    let _ = tx
                        .send(Ok(Event::default().event("error").data(r#"{"error":"job disappeared"}"#)))
                        .await;
                    return;
                }
                Err(e) => {
                    error!("Progress poll for job {} failed: {}", job_id, e);
                    let _ = tx
                        .send(Ok(Event::default().event("error").data(r#"{"error":"storage error"}"#)))
                        .await;
                    return;
                }
            };

            let payload = job.progress_json.unwrap_or_else(|| waiting.clone());
            let terminal = job.status != "running"
                || serde_json::from_str::<ProgressSnapshot>(&payload)
                    .map(|s| s.is_terminal())
                    .unwrap_or(false);

            match stream.observe(&payload, terminal, Instant::now()) {
                StreamEmit::Event { name, payload } => {
                    if tx.send(Ok(Event::default().event(name).data(payload))).await.is_err() {
                        return;
                    }
                    if terminal {
                        return;
                    }
                }
                StreamEmit::Ping => {
                    if tx.send(Ok(Event::default().event("ping").data("{}"))).await.is_err() {
                        return;
                    }
                }
                StreamEmit::Idle => {}
            }

            sleep(Duration::from_secs(1)).await;
        }
    });

    Ok(Sse::new(ReceiverStream::new(rx)))
}

/// Liveness probe.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up")),
    tag = "scraper"
)]
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
