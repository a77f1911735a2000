use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sqlx::PgPool;
use tracing::{error, info};
use uuid::Uuid;

use crate::classify::{classify_item_type, extract_tags};
use crate::config::ScraperConfig;
use crate::db::{self, UpsertOutcome};
use crate::driver::ChromeDriverFactory;
use crate::planner::plan_tasks;
use crate::progress::{ProgressSnapshot, DbProgressSink, ProgressSink};
use crate::proxy::ProxyPool;
use crate::worker::run_tasks;

/// Final counts reported when a job completes.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub listings_found: usize,
    pub new_count: usize,
    pub updated_count: usize,
    pub pages_scraped: u32,
    pub keywords_processed: Vec<String>,
}

/// Run one scrape job end to end: plan tasks, scrape, classify, persist,
/// and finalize the job row.
///
/// Callers are expected to route an `Err` through [`fail_job`] so the job
/// row and snapshot reach their failed terminal state exactly once.
pub async fn run_scraper_job(
    pool: PgPool,
    job_id: Uuid,
    page_limit: u32,
    concurrency: usize,
) -> Result<JobSummary> {
    let config = ScraperConfig::from_env();
    let tasks = plan_tasks(&config.categories, &config.keywords);
    info!(
        "Job {} starting: {} task(s), page limit {}, concurrency {}",
        job_id,
        tasks.len(),
        page_limit,
        concurrency
    );

    let proxies = ProxyPool::resolve(&config).await;
    let factory = Arc::new(ChromeDriverFactory::new(&config));
    let sink: Arc<dyn ProgressSink> = Arc::new(DbProgressSink::new(pool.clone(), job_id));

    let outcome = run_tasks(
        &config,
        page_limit,
        concurrency,
        tasks,
        &proxies,
        factory,
        Arc::clone(&sink),
    )
    .await?;

    let pages_scraped = outcome.pages_scraped;
    let keywords_processed = outcome.keywords_processed;
    let merged = outcome.merger.into_listings();
    let listings_found = merged.len();

    let mut new_count = 0usize;
    let mut updated_count = 0usize;
    for listing in &merged {
        let description = listing.data.description.as_deref().unwrap_or("");
        let item_type = classify_item_type(&listing.data.title, description);
        let tags = extract_tags(&listing.data.title, description);
        let tags_json = serde_json::to_string(&tags)?;
        match db::upsert_listing(&pool, listing, item_type.as_str(), &tags_json).await? {
            UpsertOutcome::New => new_count += 1,
            UpsertOutcome::Updated => updated_count += 1,
        }
    }

    db::mark_completed(&pool, job_id, new_count, updated_count).await?;
    sink.record(&ProgressSnapshot {
        status: "completed".to_string(),
        completed: Some(true),
        listings_found: Some(listings_found),
        new_count: Some(new_count),
        updated_count: Some(updated_count),
        message: Some(format!(
            "Scraped {} listing(s) across {} page(s)",
            listings_found, pages_scraped
        )),
        timestamp: Utc::now().to_rfc3339(),
        ..Default::default()
    })
    .await;

    info!(
        "Job {} completed: {} listings ({} new, {} updated)",
        job_id, listings_found, new_count, updated_count
    );

    Ok(JobSummary {
        listings_found,
        new_count,
        updated_count,
        pages_scraped,
        keywords_processed,
    })
}

/// Move a job to its failed terminal state. Best-effort: persistence
/// problems here are logged, not propagated.
pub async fn fail_job(pool: &PgPool, job_id: Uuid, reason: &str) {
    error!("Job {} failed: {}", job_id, reason);
    if let Err(e) = db::mark_failed(pool, job_id, reason).await {
        error!("Could not mark job {} as failed: {}", job_id, e);
    }
    let snapshot = ProgressSnapshot {
        status: "failed".to_string(),
        completed: Some(true),
        error: Some(reason.to_string()),
        timestamp: Utc::now().to_rfc3339(),
        ..Default::default()
    };
    if let Err(e) = db::save_progress(pool, job_id, &snapshot).await {
        error!("Could not save failure snapshot for job {}: {}", job_id, e);
    }
}
