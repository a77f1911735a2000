use thiserror::Error;

/// Failure taxonomy for the scrape orchestration.
///
/// Transient navigation problems are handled (with backoff) inside
/// `page::PageScraper` and degrade to empty page results; only the variants
/// below escape a task or a job.
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// A page navigation failed (timeout, connection reset, DNS).
    /// Retried locally; never fatal on its own.
    #[error("navigation failed: {0}")]
    Navigation(String),

    /// The browsing session itself is broken (launch failure, crashed
    /// browser process). Triggers proxy fallback at session open, or a
    /// task error mid-run.
    #[error("browser session error: {0}")]
    Session(String),

    /// Every proxy candidate, including the direct connection, failed to
    /// produce a working session.
    #[error("all proxy attempts failed: {0}")]
    SessionExhausted(String),

    /// robots.txt disallows the job's root search path. Fatal for the
    /// whole job, checked before any listing page is fetched.
    #[error("robots.txt disallows scraping {0}")]
    RobotsDisallowed(String),

    #[error("invalid scraper parameter: {0}")]
    Config(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}
