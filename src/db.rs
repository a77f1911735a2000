use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgPool;
use sqlx::Row;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::merge::MergedListing;
use crate::progress::ProgressSnapshot;

pub async fn init_db(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scrape_jobs (
            id UUID PRIMARY KEY,
            status VARCHAR NOT NULL,
            page_limit INT NOT NULL,
            concurrency INT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
            finished_at TIMESTAMPTZ,
            progress_json TEXT,
            new_count INT,
            updated_count INT,
            error TEXT
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS listings (
            external_id VARCHAR PRIMARY KEY,
            url TEXT NOT NULL,
            title TEXT NOT NULL,
            price_cents BIGINT,
            price_negotiable BOOLEAN NOT NULL DEFAULT FALSE,
            city TEXT NOT NULL DEFAULT '',
            state TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            condition TEXT,
            posted_at TIMESTAMP,
            image_url TEXT,
            seller_type TEXT NOT NULL DEFAULT '',
            item_type VARCHAR NOT NULL DEFAULT 'other',
            keywords TEXT NOT NULL DEFAULT '',
            tags_json TEXT NOT NULL DEFAULT '[]',
            first_seen_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
            last_seen_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// One row of the scrape_jobs table.
#[derive(Debug, Clone, Serialize, ToSchema, sqlx::FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub status: String,
    pub page_limit: i32,
    pub concurrency: i32,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub progress_json: Option<String>,
    pub new_count: Option<i32>,
    pub updated_count: Option<i32>,
    pub error: Option<String>,
}

pub async fn create_job(pool: &PgPool, id: Uuid, page_limit: u32, concurrency: usize) -> Result<()> {
    sqlx::query("INSERT INTO scrape_jobs (id, status, page_limit, concurrency) VALUES ($1, 'running', $2, $3)")
        .bind(id)
        .bind(page_limit as i32)
        .bind(concurrency as i32)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_job(pool: &PgPool, id: Uuid) -> Result<Option<JobRow>> {
    let row = sqlx::query_as::<_, JobRow>("SELECT * FROM scrape_jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn list_jobs(pool: &PgPool, limit: i64) -> Result<Vec<JobRow>> {
    let rows = sqlx::query_as::<_, JobRow>(
        "SELECT * FROM scrape_jobs ORDER BY created_at DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Transition a running job to completed with its final counts. The status
/// guard makes the terminal transition happen at most once.
pub async fn mark_completed(
    pool: &PgPool,
    id: Uuid,
    new_count: usize,
    updated_count: usize,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE scrape_jobs
        SET status = 'completed', finished_at = CURRENT_TIMESTAMP,
            new_count = $2, updated_count = $3
        WHERE id = $1 AND status = 'running'
        "#,
    )
    .bind(id)
    .bind(new_count as i32)
    .bind(updated_count as i32)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_failed(pool: &PgPool, id: Uuid, error: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE scrape_jobs
        SET status = 'failed', finished_at = CURRENT_TIMESTAMP, error = $2
        WHERE id = $1 AND status = 'running'
        "#,
    )
    .bind(id)
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}

/// Overwrite the job's current progress snapshot.
pub async fn save_progress(pool: &PgPool, id: Uuid, snapshot: &ProgressSnapshot) -> Result<()> {
    let payload = serde_json::to_string(snapshot)?;
    sqlx::query("UPDATE scrape_jobs SET progress_json = $2 WHERE id = $1")
        .bind(id)
        .bind(payload)
        .execute(pool)
        .await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    New,
    Updated,
}

/// Insert or refresh a merged listing.
///
/// On update the scraped fields are latest-wins while the stored keyword
/// set only grows (union with the incoming provenance keywords).
pub async fn upsert_listing(
    pool: &PgPool,
    listing: &MergedListing,
    item_type: &str,
    tags_json: &str,
) -> Result<UpsertOutcome> {
    let data = &listing.data;
    let price_cents = data.price.map(|p| (p * 100.0).round() as i64);

    let existing = sqlx::query("SELECT keywords FROM listings WHERE external_id = $1")
        .bind(&data.external_id)
        .fetch_optional(pool)
        .await?;

    match existing {
        None => {
            let keywords = join_keywords(listing.keywords.iter().map(String::as_str));
            sqlx::query(
                r#"
                INSERT INTO listings (
                    external_id, url, title, price_cents, price_negotiable,
                    city, state, description, condition, posted_at, image_url,
                    seller_type, item_type, keywords, tags_json
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                "#,
            )
            .bind(&data.external_id)
            .bind(&data.url)
            .bind(&data.title)
            .bind(price_cents)
            .bind(data.price_negotiable)
            .bind(data.city.as_deref().unwrap_or(""))
            .bind(data.state.as_deref().unwrap_or(""))
            .bind(data.description.as_deref().unwrap_or(""))
            .bind(&data.condition)
            .bind(data.posted_at)
            .bind(&data.image_url)
            .bind(data.seller_type.as_deref().unwrap_or(""))
            .bind(item_type)
            .bind(keywords)
            .bind(tags_json)
            .execute(pool)
            .await?;
            Ok(UpsertOutcome::New)
        }
        Some(row) => {
            let stored: String = row.try_get("keywords")?;
            let mut union: Vec<&str> = stored
                .split(',')
                .filter(|k| !k.is_empty())
                .collect();
            for keyword in &listing.keywords {
                if !union.contains(&keyword.as_str()) {
                    union.push(keyword);
                }
            }
            let keywords = join_keywords(union.into_iter());

            sqlx::query(
                r#"
                UPDATE listings
                SET url = $2, title = $3, price_cents = $4, price_negotiable = $5,
                    city = $6, state = $7, description = $8, condition = $9,
                    posted_at = $10, image_url = $11, seller_type = $12,
                    item_type = $13, keywords = $14, tags_json = $15,
                    last_seen_at = CURRENT_TIMESTAMP
                WHERE external_id = $1
                "#,
            )
            .bind(&data.external_id)
            .bind(&data.url)
            .bind(&data.title)
            .bind(price_cents)
            .bind(data.price_negotiable)
            .bind(data.city.as_deref().unwrap_or(""))
            .bind(data.state.as_deref().unwrap_or(""))
            .bind(data.description.as_deref().unwrap_or(""))
            .bind(&data.condition)
            .bind(data.posted_at)
            .bind(&data.image_url)
            .bind(data.seller_type.as_deref().unwrap_or(""))
            .bind(item_type)
            .bind(keywords)
            .bind(tags_json)
            .execute(pool)
            .await?;
            Ok(UpsertOutcome::Updated)
        }
    }
}

fn join_keywords<'a>(keywords: impl Iterator<Item = &'a str>) -> String {
    keywords.collect::<Vec<_>>().join(",")
}
