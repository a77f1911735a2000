use std::env;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use dotenv::dotenv;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use listing_scraper::{api, db};

#[derive(OpenApi)]
#[openapi(
    paths(
        api::trigger_scrape,
        api::get_job_status,
        api::list_jobs,
        api::stream_progress,
        api::health
    ),
    components(
        schemas(
            api::ScrapeRequest,
            api::JobAccepted,
            api::JobCompleted,
            api::ErrorResponse,
            db::JobRow
        )
    ),
    tags(
        (name = "scraper", description = "Scrape job management API")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    let db_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    // The database container often comes up after us; retry before giving up.
    info!("Connecting to database");
    let pool = {
        let mut attempts = 0;
        loop {
            match PgPoolOptions::new().max_connections(5).connect(&db_url).await {
                Ok(p) => {
                    info!("Database connected");
                    break p;
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= 15 {
                        return Err(e.into());
                    }
                    warn!("Database connect failed ({}), retrying in 2s (attempt {}/15)", e, attempts);
                    tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
                }
            }
        }
    };

    db::init_db(&pool).await?;

    let state = Arc::new(api::AppState { pool });

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route(
            "/api/v1/scraper/jobs",
            post(api::trigger_scrape).get(api::list_jobs),
        )
        .route("/api/v1/scraper/jobs/:job_id", get(api::get_job_status))
        .route(
            "/api/v1/scraper/jobs/:job_id/progress",
            get(api::stream_progress),
        )
        .route("/health", get(api::health))
        .with_state(state);

    let port = env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
