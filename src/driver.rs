use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use rand::Rng;
use tokio::time::sleep;
use tracing::debug;

use crate::config::ScraperConfig;
use crate::error::ScrapeError;
use crate::proxy::ProxyEndpoint;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:124.0) Gecko/20100101 Firefox/124.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
];

/// Response from one page navigation.
#[derive(Debug, Clone)]
pub struct PageResponse {
    pub status: u16,
    pub html: String,
}

/// Page-driving capability injected into the scraper.
///
/// Keeping this a trait isolates retry/backoff logic from the automation
/// engine and lets tests script responses per URL.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<PageResponse, ScrapeError>;
}

/// Opens one browsing session per (worker, proxy attempt). The returned
/// driver owns the session; dropping it closes the browser.
pub trait DriverFactory: Send + Sync {
    fn open(&self, proxy: Option<&ProxyEndpoint>) -> Result<Box<dyn PageDriver>, ScrapeError>;
}

/// Headless Chrome session factory.
pub struct ChromeDriverFactory {
    nav_timeout: Duration,
}

impl ChromeDriverFactory {
    pub fn new(config: &ScraperConfig) -> Self {
        ChromeDriverFactory {
            nav_timeout: config.nav_timeout,
        }
    }
}

impl DriverFactory for ChromeDriverFactory {
    fn open(&self, proxy: Option<&ProxyEndpoint>) -> Result<Box<dyn PageDriver>, ScrapeError> {
        let user_agent = {
            let mut rng = rand::thread_rng();
            USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())]
        };

        let ua_arg = format!("--user-agent={}", user_agent);
        let proxy_arg = proxy.map(|p| format!("--proxy-server={}", p.to_chrome_arg()));

        let mut args: Vec<&OsStr> = vec![
            OsStr::new("--disable-blink-features=AutomationControlled"),
            OsStr::new("--no-sandbox"),
            OsStr::new("--disable-dev-shm-usage"),
            OsStr::new("--disable-infobars"),
            OsStr::new("--ignore-certificate-errors"),
            OsStr::new("--lang=de-DE"),
        ];
        args.push(OsStr::new(&ua_arg));
        if let Some(ref arg) = proxy_arg {
            args.push(OsStr::new(arg));
        }

        let browser = Browser::new(LaunchOptions {
            headless: true,
            window_size: Some((1920, 1080)),
            args,
            ..Default::default()
        })
        .map_err(|e| ScrapeError::Session(e.to_string()))?;

        let tab = browser
            .new_tab()
            .map_err(|e| ScrapeError::Session(e.to_string()))?;
        tab.set_default_timeout(self.nav_timeout);
        tab.set_user_agent(user_agent, Some("de-DE,de;q=0.9,en;q=0.8"), None)
            .map_err(|e| ScrapeError::Session(e.to_string()))?;

        debug!(
            "Opened Chrome session (proxy: {})",
            proxy.map(|p| p.label()).unwrap_or("direct")
        );

        Ok(Box::new(ChromeDriver {
            _browser: browser,
            tab,
        }))
    }
}

/// One live Chrome session. The browser process is torn down when this is
/// dropped, which covers every worker exit path.
pub struct ChromeDriver {
    _browser: Browser,
    tab: Arc<Tab>,
}

#[async_trait]
impl PageDriver for ChromeDriver {
    async fn navigate(&self, url: &str) -> Result<PageResponse, ScrapeError> {
        self.tab
            .navigate_to(url)
            .map_err(|e| ScrapeError::Navigation(e.to_string()))?;
        self.tab
            .wait_until_navigated()
            .map_err(|e| ScrapeError::Navigation(e.to_string()))?;

        // Let dynamic content settle, with a little jitter.
        let jitter = {
            let mut rng = rand::thread_rng();
            rng.gen_range(0..750)
        };
        sleep(Duration::from_millis(1500 + jitter)).await;

        let html = self
            .tab
            .get_content()
            .map_err(|e| ScrapeError::Navigation(e.to_string()))?;

        // Chrome does not surface the document's HTTP status without CDP
        // network interception; rate-limit and block pages are caught by the
        // content heuristics in `page::looks_like_blocked_page` instead.
        Ok(PageResponse { status: 200, html })
    }
}
