use std::env;
use std::time::Duration;

/// Minimum polite delay between page fetches. Configured values below this
/// are bumped up, matching the site's tolerance for repeated requests.
const MIN_DELAY_SECONDS: f64 = 2.0;

/// Environment-driven scraper settings, read once at job start.
#[derive(Debug, Clone)]
pub struct ScraperConfig {
    /// Comma-separated search keywords. Empty means "no keyword filter".
    pub keywords: String,
    /// Comma-separated category codes (e.g. "c278,c225").
    pub categories: String,
    /// Optional city slug inserted into the search path.
    pub city: String,
    pub page_limit: u32,
    pub concurrency: usize,
    /// Delay between listing pages within a task.
    pub delay: Duration,
    /// Per-navigation timeout handed to the browser session.
    pub nav_timeout: Duration,
    /// Comma-separated proxy URLs (highest priority proxy source).
    pub proxy_urls: String,
    /// URL returning a newline-delimited proxy list (second priority).
    pub proxy_list_url: String,
    /// Single fallback proxy from HTTPS_PROXY / HTTP_PROXY.
    pub single_proxy: Option<String>,
}

impl ScraperConfig {
    pub fn from_env() -> Self {
        let delay_seconds: f64 = env::var("SCRAPER_DELAY_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3.0);

        let page_limit: u32 = env::var("SCRAPER_PAGE_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);

        let concurrency: usize = env::var("SCRAPER_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);

        ScraperConfig {
            keywords: env::var("SCRAPER_KEYWORDS").unwrap_or_default(),
            categories: env::var("SCRAPER_CATEGORIES").unwrap_or_default(),
            city: env::var("SCRAPER_CITY").unwrap_or_default(),
            page_limit,
            concurrency,
            delay: Duration::from_secs_f64(delay_seconds.max(MIN_DELAY_SECONDS)),
            nav_timeout: Duration::from_secs(60),
            proxy_urls: env::var("SCRAPER_PROXY_URLS").unwrap_or_default(),
            proxy_list_url: env::var("SCRAPER_PROXY_LIST_URL").unwrap_or_default(),
            single_proxy: env::var("HTTPS_PROXY")
                .or_else(|_| env::var("HTTP_PROXY"))
                .ok()
                .filter(|v| !v.trim().is_empty()),
        }
    }
}

impl Default for ScraperConfig {
    fn default() -> Self {
        ScraperConfig {
            keywords: String::new(),
            categories: String::new(),
            city: String::new(),
            page_limit: 5,
            concurrency: 1,
            delay: Duration::from_secs(3),
            nav_timeout: Duration::from_secs(60),
            proxy_urls: String::new(),
            proxy_list_url: String::new(),
            single_proxy: None,
        }
    }
}
