use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::ScraperConfig;
use crate::driver::PageDriver;
use crate::error::ScrapeError;
use crate::listing::{extract_listings, RawListing};
use crate::robots::RobotsGate;

pub const SITE_BASE: &str = "https://www.kleinanzeigen.de";

/// Category code -> URL slug. Unknown codes fall back to the notebooks slug.
const CATEGORY_SLUGS: &[(&str, &str)] = &[
    ("c278", "notebooks"),
    ("c225", "pcs"),
    ("c285", "tablets"),
    ("c161", "elektronik"),
    ("c228", "pc-zubehoer-software"),
];

const DEFAULT_SLUG: &str = "notebooks";

/// Markers indicating an anti-automation block or challenge page. We never
/// try to get past these; they are treated like rate limiting and backed
/// off from.
const BLOCK_MARKERS: &[&str] = &[
    "captcha",
    "robot",
    "zugriff verweigert",
    "access denied",
    "unusual traffic",
    "bot detection",
];

const MAX_RETRIES: u32 = 3;

/// Scrapes one search task page by page, with per-page retry/backoff and an
/// early-stop heuristic for exhausted result sets.
#[derive(Debug, Clone)]
pub struct PageScraper {
    delay: Duration,
    page_limit: u32,
    /// Stop a task after this many consecutive pages without a single new
    /// unique id. Fixed heuristic; tune if the target's page stability
    /// characteristics differ.
    no_new_page_limit: u32,
}

/// Result of scraping one task: the listing batch and how many pages were
/// actually fetched.
#[derive(Debug, Default)]
pub struct TaskPages {
    pub listings: Vec<RawListing>,
    pub pages_scraped: u32,
}

impl PageScraper {
    pub fn new(delay: Duration, page_limit: u32) -> Self {
        PageScraper {
            delay,
            page_limit,
            no_new_page_limit: 2,
        }
    }

    pub fn from_config(config: &ScraperConfig, page_limit: u32) -> Self {
        Self::new(config.delay, page_limit)
    }

    /// Scrape all pages of one search URL.
    ///
    /// A robots denial of the task path is a soft skip (empty result); only
    /// the job-level root check is fatal, and that happens before tasks run.
    pub async fn scrape_task(
        &self,
        driver: &dyn PageDriver,
        gate: &RobotsGate,
        seen_ids: &Mutex<HashSet<String>>,
        search_url: &str,
    ) -> Result<TaskPages, ScrapeError> {
        if !gate.is_allowed(&url_path(search_url)) {
            warn!("Skipping path disallowed by robots.txt: {}", search_url);
            return Ok(TaskPages::default());
        }

        let mut result = TaskPages::default();
        let mut no_new_pages = 0u32;

        for page_num in 1..=self.page_limit {
            let page_url = build_page_url(search_url, page_num);
            let page_listings = self.scrape_page(driver, &page_url).await?;
            result.pages_scraped += 1;

            // Membership check, insert and delta must happen under one lock
            // so concurrent workers get a correct new-id count.
            let new_count = {
                let mut seen = seen_ids.lock().unwrap();
                let before = seen.len();
                seen.extend(page_listings.iter().map(|l| l.external_id.clone()));
                seen.len() - before
            };

            if new_count == 0 {
                no_new_pages += 1;
            } else {
                no_new_pages = 0;
            }

            let empty_page = page_listings.is_empty();
            result.listings.extend(page_listings);

            // Stop early once pages yield nothing, or nothing new twice in
            // a row; later pages are assumed to contain only duplicates.
            if empty_page || no_new_pages >= self.no_new_page_limit {
                break;
            }

            if page_num < self.page_limit {
                sleep(self.delay + jitter()).await;
            }
        }

        Ok(result)
    }

    /// Fetch and parse a single result page with retry logic.
    ///
    /// Exhausted retries degrade to an empty page; only a broken session
    /// escapes as an error (the worker reports it as a task error).
    pub async fn scrape_page(
        &self,
        driver: &dyn PageDriver,
        url: &str,
    ) -> Result<Vec<RawListing>, ScrapeError> {
        let mut attempt = 0u32;

        loop {
            if attempt > 0 {
                info!("Scraping page: {} (retry {})", url, attempt);
            } else {
                info!("Scraping page: {}", url);
            }

            let response = match driver.navigate(url).await {
                Ok(resp) => resp,
                Err(ScrapeError::Navigation(e)) => {
                    error!("Navigation error for {}: {}", url, e);
                    if attempt < MAX_RETRIES {
                        sleep(self.delay * 2).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(Vec::new());
                }
                Err(other) => return Err(other),
            };

            if response.status == 429 {
                let backoff = self.delay * 2u32.pow(attempt + 1);
                warn!("Rate limited (429) on {}. Backing off {:?}", url, backoff);
                sleep(backoff).await;
                if attempt < MAX_RETRIES {
                    attempt += 1;
                    continue;
                }
                return Ok(Vec::new());
            }

            if response.status >= 500 {
                error!("Server error HTTP {} for {}", response.status, url);
                if attempt < MAX_RETRIES {
                    sleep(self.delay * 2).await;
                    attempt += 1;
                    continue;
                }
                return Ok(Vec::new());
            }

            if response.status >= 400 {
                error!("Client error HTTP {} for {}", response.status, url);
                return Ok(Vec::new());
            }

            if looks_like_blocked_page(&response.html) {
                warn!("Page content looks like a block/challenge page: {}", url);
                if attempt < MAX_RETRIES {
                    sleep(self.delay * 2u32.pow(attempt + 1)).await;
                    attempt += 1;
                    continue;
                }
                return Ok(Vec::new());
            }

            let listings = extract_listings(&response.html, url);
            info!("Found {} listings on page", listings.len());

            // A page with zero articles is sometimes a rendering hiccup;
            // give it one more chance on the first attempt.
            if listings.is_empty() && attempt < 1 {
                warn!("No listings found on {}, retrying page", url);
                sleep(self.delay).await;
                attempt += 1;
                continue;
            }

            return Ok(listings);
        }
    }
}

fn jitter() -> Duration {
    let millis = rand::thread_rng().gen_range(0..500);
    Duration::from_millis(millis)
}

/// Heuristic detection of block/challenge pages. This does not try to get
/// around access controls; it only lets us back off instead of parsing
/// garbage.
pub fn looks_like_blocked_page(html: &str) -> bool {
    let lower = html.to_lowercase();
    BLOCK_MARKERS.iter().any(|m| lower.contains(m))
}

/// Pagination URL: page 1 is the base URL itself; later pages get a
/// `/seite:{n}/` path segment inserted before any query string.
pub fn build_page_url(base_url: &str, page_num: u32) -> String {
    if page_num <= 1 {
        return base_url.to_string();
    }

    match base_url.split_once('?') {
        Some((path, query)) => {
            format!("{}/seite:{}/?{}", path.trim_end_matches('/'), page_num, query)
        }
        None => format!("{}/seite:{}/", base_url.trim_end_matches('/'), page_num),
    }
}

/// Search URL for one (category, keyword) task. The keyword goes into the
/// query string percent-encoded; the city slug, when configured, becomes a
/// path segment.
pub fn build_search_url(category: &str, keyword: &str, city: &str) -> String {
    let slug = CATEGORY_SLUGS
        .iter()
        .find(|(code, _)| *code == category)
        .map(|(_, slug)| *slug)
        .unwrap_or(DEFAULT_SLUG);

    let base = if city.is_empty() {
        format!("{}/s-{}/{}", SITE_BASE, slug, category)
    } else {
        format!("{}/s-{}/{}/{}", SITE_BASE, slug, city, category)
    };

    if keyword.is_empty() {
        base
    } else {
        format!("{}?keywords={}", base, urlencoding::encode(keyword))
    }
}

pub fn url_path(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(u) => u.path().to_string(),
        Err(_) => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::PageResponse;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scraper() -> PageScraper {
        PageScraper::new(Duration::from_millis(1), 5)
    }

    fn page_html(ids: &[u64]) -> String {
        let mut html = String::from("<html><body>");
        for id in ids {
            html.push_str(&format!(
                r#"<article class="aditem"><a class="ellipsis" href="/s-anzeige/item/{id}-278-1">Item {id}</a></article>"#
            ));
        }
        html.push_str("</body></html>");
        html
    }

    /// Driver scripted with a fixed sequence of responses.
    struct ScriptedDriver {
        responses: Mutex<Vec<Result<PageResponse, ScrapeError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedDriver {
        fn new(responses: Vec<Result<PageResponse, ScrapeError>>) -> Self {
            let mut reversed = responses;
            reversed.reverse();
            ScriptedDriver {
                responses: Mutex::new(reversed),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PageDriver for ScriptedDriver {
        async fn navigate(&self, _url: &str) -> Result<PageResponse, ScrapeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(PageResponse { status: 200, html: page_html(&[]) }))
        }
    }

    fn ok(status: u16, html: String) -> Result<PageResponse, ScrapeError> {
        Ok(PageResponse { status, html })
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let driver = ScriptedDriver::new(vec![ok(404, String::new())]);
        let listings = scraper().scrape_page(&driver, "http://x/p").await.unwrap();
        assert!(listings.is_empty());
        assert_eq!(driver.calls(), 1);
    }

    #[tokio::test]
    async fn rate_limit_retries_up_to_three_times() {
        let driver = ScriptedDriver::new(vec![
            ok(429, String::new()),
            ok(429, String::new()),
            ok(429, String::new()),
            ok(200, page_html(&[1111111111])),
        ]);
        let listings = scraper().scrape_page(&driver, "http://x/p").await.unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(driver.calls(), 4);
    }

    #[tokio::test]
    async fn navigation_errors_degrade_to_empty_page() {
        let driver = ScriptedDriver::new(vec![
            Err(ScrapeError::Navigation("timeout".into())),
            Err(ScrapeError::Navigation("timeout".into())),
            Err(ScrapeError::Navigation("timeout".into())),
            Err(ScrapeError::Navigation("timeout".into())),
        ]);
        let listings = scraper().scrape_page(&driver, "http://x/p").await.unwrap();
        assert!(listings.is_empty());
        assert_eq!(driver.calls(), 4);
    }

    #[tokio::test]
    async fn server_error_retries_then_gives_up_empty() {
        let driver = ScriptedDriver::new(vec![
            ok(503, String::new()),
            ok(503, String::new()),
            ok(503, String::new()),
            ok(503, String::new()),
        ]);
        let listings = scraper().scrape_page(&driver, "http://x/p").await.unwrap();
        assert!(listings.is_empty());
        assert_eq!(driver.calls(), 4);
    }

    #[tokio::test]
    async fn blocked_page_is_backed_off_like_rate_limiting() {
        let driver = ScriptedDriver::new(vec![
            ok(200, "<html><body>please solve this captcha</body></html>".into()),
            ok(200, page_html(&[1111111111])),
        ]);
        let listings = scraper().scrape_page(&driver, "http://x/p").await.unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(driver.calls(), 2);
    }

    #[tokio::test]
    async fn empty_first_attempt_gets_one_extra_retry() {
        let driver = ScriptedDriver::new(vec![
            ok(200, page_html(&[])),
            ok(200, page_html(&[1111111111])),
        ]);
        let listings = scraper().scrape_page(&driver, "http://x/p").await.unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(driver.calls(), 2);
    }

    #[tokio::test]
    async fn session_error_propagates() {
        let driver = ScriptedDriver::new(vec![Err(ScrapeError::Session("gone".into()))]);
        let result = scraper().scrape_page(&driver, "http://x/p").await;
        assert!(matches!(result, Err(ScrapeError::Session(_))));
    }

    /// Driver keyed on the `/seite:{n}/` page number.
    struct PagedDriver {
        pages: Vec<Vec<u64>>,
        fetched: Mutex<Vec<u32>>,
    }

    impl PagedDriver {
        fn new(pages: Vec<Vec<u64>>) -> Self {
            PagedDriver {
                pages,
                fetched: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageDriver for PagedDriver {
        async fn navigate(&self, url: &str) -> Result<PageResponse, ScrapeError> {
            let page_num: u32 = url
                .split("seite:")
                .nth(1)
                .and_then(|rest| rest.split('/').next())
                .and_then(|n| n.parse().ok())
                .unwrap_or(1);
            self.fetched.lock().unwrap().push(page_num);
            let ids = self
                .pages
                .get(page_num as usize - 1)
                .cloned()
                .unwrap_or_default();
            Ok(PageResponse {
                status: 200,
                html: page_html(&ids),
            })
        }
    }

    fn ten_ids(offset: u64) -> Vec<u64> {
        (0..10).map(|i| 1_000_000_000 + offset * 100 + i).collect()
    }

    #[tokio::test]
    async fn stops_after_empty_page() {
        let driver = PagedDriver::new(vec![ten_ids(1), ten_ids(2), vec![]]);
        let seen = Mutex::new(HashSet::new());
        let gate = RobotsGate::new(SITE_BASE);
        let result = scraper()
            .scrape_task(&driver, &gate, &seen, "http://x/s-notebooks/c278")
            .await
            .unwrap();
        assert_eq!(result.pages_scraped, 3);
        assert_eq!(result.listings.len(), 20);
        // Empty-page retry fetches page 3 twice, but pages stay in order.
        assert_eq!(*driver.fetched.lock().unwrap(), vec![1, 2, 3, 3]);
    }

    #[tokio::test]
    async fn stops_after_two_consecutive_duplicate_only_pages() {
        // Pages 2 and 3 repeat page 1's ids: two no-new pages in a row.
        let driver = PagedDriver::new(vec![ten_ids(1), ten_ids(1), ten_ids(1), ten_ids(9)]);
        let seen = Mutex::new(HashSet::new());
        let gate = RobotsGate::new(SITE_BASE);
        let result = scraper()
            .scrape_task(&driver, &gate, &seen, "http://x/s-notebooks/c278")
            .await
            .unwrap();
        assert_eq!(result.pages_scraped, 3);
    }

    #[tokio::test]
    async fn one_new_id_resets_the_duplicate_counter() {
        let mut page3 = ten_ids(1);
        page3.push(1_999_999_999); // a single fresh id on page 3
        let driver = PagedDriver::new(vec![ten_ids(1), ten_ids(1), page3, ten_ids(4), ten_ids(5)]);
        let seen = Mutex::new(HashSet::new());
        let gate = RobotsGate::new(SITE_BASE);
        let result = scraper()
            .scrape_task(&driver, &gate, &seen, "http://x/s-notebooks/c278")
            .await
            .unwrap();
        assert!(result.pages_scraped >= 4);
    }

    #[tokio::test]
    async fn disallowed_task_path_is_a_soft_skip() {
        let driver = PagedDriver::new(vec![ten_ids(1)]);
        let seen = Mutex::new(HashSet::new());
        let gate =
            RobotsGate::with_rules_from(SITE_BASE, "User-agent: *\nDisallow: /s-notebooks\n");
        let result = scraper()
            .scrape_task(&driver, &gate, &seen, "http://x/s-notebooks/c278")
            .await
            .unwrap();
        assert_eq!(result.pages_scraped, 0);
        assert!(result.listings.is_empty());
        assert!(driver.fetched.lock().unwrap().is_empty());
    }

    #[test]
    fn page_url_for_first_page_is_unchanged() {
        assert_eq!(
            build_page_url("https://x.de/s-notebooks/c278", 1),
            "https://x.de/s-notebooks/c278"
        );
    }

    #[test]
    fn page_url_appends_page_segment() {
        assert_eq!(
            build_page_url("https://x.de/s-notebooks/c278", 3),
            "https://x.de/s-notebooks/c278/seite:3/"
        );
    }

    #[test]
    fn page_url_preserves_query_string() {
        assert_eq!(
            build_page_url("https://x.de/s-notebooks/c278?keywords=thinkpad", 2),
            "https://x.de/s-notebooks/c278/seite:2/?keywords=thinkpad"
        );
    }

    #[test]
    fn search_url_encodes_keyword() {
        let url = build_search_url("c278", "thinkpad t480", "");
        assert_eq!(
            url,
            "https://www.kleinanzeigen.de/s-notebooks/c278?keywords=thinkpad%20t480"
        );
    }

    #[test]
    fn search_url_with_city_and_unknown_category() {
        let url = build_search_url("c999", "", "berlin");
        assert_eq!(url, "https://www.kleinanzeigen.de/s-notebooks/berlin/c999");
    }

    #[test]
    fn block_markers_are_detected() {
        assert!(looks_like_blocked_page("<html>Unusual Traffic detected</html>"));
        assert!(!looks_like_blocked_page("<html>ThinkPad T480</html>"));
    }
}
