use chrono::{Datelike, Duration as ChronoDuration, Local, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

// Centralized CSS selectors for Kleinanzeigen result pages.
// Update these when the site markup changes.
pub const SEL_LISTING_ITEM: &str = "article.aditem";
const SEL_TITLE: &str = "a.ellipsis";
const SEL_PRICE: &str = ".aditem-main--middle--price-shipping--price";
const SEL_LOCATION: &str = ".aditem-main--top--left";
const SEL_DESCRIPTION: &str = ".aditem-main--middle--description";
const SEL_IMAGE: &str = ".imagebox img, .galleryimage img";
const SEL_POSTED_DATE: &str = ".aditem-main--top--right";
const SEL_CONDITION: &str = ".aditem-main--middle--tags .simpletag";

static EXTERNAL_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/(\d{9,})(?:-[\d-]+)?(?:/|$|\?)").unwrap());
static PRICE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d[\d\.,\s]*)").unwrap());
static NEGOTIABLE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bVB\b").unwrap());
static POSTAL_CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{5}\s*").unwrap());
static LOCATION_SPLIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[,\-]").unwrap());
static TIME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{1,2}):(\d{2})").unwrap());
static FULL_DATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{2})\.(\d{2})\.(\d{4})").unwrap());
static SHORT_DATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{2})\.(\d{2})\.").unwrap());

/// One raw listing as extracted from a result page. `external_id` is the
/// dedup key across all tasks of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub external_id: String,
    pub url: String,
    pub title: String,
    /// Price in euros; None for "VB"-only or giveaway-without-number text.
    pub price: Option<f64>,
    pub price_negotiable: bool,
    pub city: Option<String>,
    pub state: Option<String>,
    pub description: Option<String>,
    pub condition: Option<String>,
    pub posted_at: Option<NaiveDateTime>,
    pub image_url: Option<String>,
    pub seller_type: Option<String>,
}

/// Parse every listing article out of a rendered result page.
pub fn extract_listings(html: &str, base_url: &str) -> Vec<RawListing> {
    let document = Html::parse_document(html);
    let item_sel = Selector::parse(SEL_LISTING_ITEM).unwrap();
    document
        .select(&item_sel)
        .filter_map(|article| parse_listing(&article, base_url))
        .collect()
}

fn parse_listing(article: &ElementRef, base_url: &str) -> Option<RawListing> {
    let title_sel = Selector::parse(SEL_TITLE).unwrap();
    let title_elem = match article.select(&title_sel).next() {
        Some(el) => el,
        None => {
            warn!("Could not find title element in listing article");
            return None;
        }
    };

    let title = collect_text(&title_elem);
    let href = title_elem.value().attr("href").unwrap_or_default();
    let url = resolve_url(base_url, href)?;

    let external_id = extract_external_id(&url);

    let price_sel = Selector::parse(SEL_PRICE).unwrap();
    let price_text = article
        .select(&price_sel)
        .next()
        .map(|el| collect_text(&el))
        .unwrap_or_default();
    let (price, price_negotiable) = parse_price(&price_text);

    let location_sel = Selector::parse(SEL_LOCATION).unwrap();
    let location_text = article
        .select(&location_sel)
        .next()
        .map(|el| collect_text(&el))
        .unwrap_or_default();
    let (city, state) = parse_location(&location_text);

    let desc_sel = Selector::parse(SEL_DESCRIPTION).unwrap();
    let description = article
        .select(&desc_sel)
        .next()
        .map(|el| collect_text(&el))
        .filter(|t| !t.is_empty());

    let image_sel = Selector::parse(SEL_IMAGE).unwrap();
    let image_url = article.select(&image_sel).next().and_then(|el| {
        el.value()
            .attr("src")
            .or_else(|| el.value().attr("data-src"))
            .map(String::from)
    });

    let date_sel = Selector::parse(SEL_POSTED_DATE).unwrap();
    let posted_at = article
        .select(&date_sel)
        .next()
        .and_then(|el| parse_posted_date(&collect_text(&el)));

    let condition_sel = Selector::parse(SEL_CONDITION).unwrap();
    let condition = article.select(&condition_sel).find_map(|tag| {
        let text = collect_text(&tag);
        let lower = text.to_lowercase();
        if lower.contains("neu") || lower.contains("gebraucht") {
            Some(text)
        } else {
            None
        }
    });

    Some(RawListing {
        external_id,
        url,
        title,
        price,
        price_negotiable,
        city,
        state,
        description,
        condition,
        posted_at,
        image_url,
        // Seller type only appears on the detail page, which we do not fetch.
        seller_type: None,
    })
}

fn collect_text(el: &ElementRef) -> String {
    el.text().collect::<String>().trim().to_string()
}

fn resolve_url(base_url: &str, href: &str) -> Option<String> {
    if href.is_empty() {
        warn!("Could not extract listing URL");
        return None;
    }
    reqwest::Url::parse(base_url)
        .ok()?
        .join(href)
        .ok()
        .map(|u| u.to_string())
}

/// Extract the site's numeric listing id from a URL. URLs without the
/// expected pattern get a stable hash of the URL instead, so the id is
/// deterministic across runs.
pub fn extract_external_id(url: &str) -> String {
    if let Some(caps) = EXTERNAL_ID_RE.captures(url) {
        return caps[1].to_string();
    }
    let digest = Sha256::digest(url.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..32].to_string()
}

/// Parse price text like "450 € VB", "1.200 €" or "VB" into euros plus the
/// negotiable flag. German number formatting: "." groups thousands, ","
/// separates decimals.
pub fn parse_price(price_text: &str) -> (Option<f64>, bool) {
    let text = price_text.trim();
    if text.is_empty() {
        return (None, false);
    }

    let upper = text.to_uppercase();
    let negotiable = NEGOTIABLE_RE.is_match(&upper) || upper.contains("VERHANDLUNGSBASIS");

    if upper.contains("ZU VERSCHENKEN") || upper.contains("VERSCHENKE") {
        return (Some(0.0), negotiable);
    }

    let Some(caps) = PRICE_RE.captures(&upper) else {
        return (None, negotiable);
    };
    let numeric = caps[1].replace(' ', "").replace('.', "").replace(',', ".");
    (numeric.parse::<f64>().ok(), negotiable)
}

/// Split a location string like "10115 Berlin - Mitte" into (city, state).
pub fn parse_location(location_text: &str) -> (Option<String>, Option<String>) {
    let trimmed = location_text.trim();
    if trimmed.is_empty() {
        return (None, None);
    }

    let cleaned = POSTAL_CODE_RE.replace(trimmed, "").to_string();
    let mut parts = LOCATION_SPLIT_RE.splitn(&cleaned, 2);
    let city = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from);
    let state = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from);
    (city, state)
}

/// Parse German posting dates: "Heute, 14:30", "Gestern, 09:15",
/// "01.12.2024" or "01.12." (current year).
pub fn parse_posted_date(date_text: &str) -> Option<NaiveDateTime> {
    let now = Local::now().naive_local();
    parse_posted_date_at(date_text, now)
}

fn parse_posted_date_at(date_text: &str, now: NaiveDateTime) -> Option<NaiveDateTime> {
    let text = date_text.trim().to_lowercase();
    if text.is_empty() {
        return None;
    }

    let time = TIME_RE.captures(&text).and_then(|caps| {
        let hour: u32 = caps[1].parse().ok()?;
        let minute: u32 = caps[2].parse().ok()?;
        Some((hour, minute))
    });

    if text.contains("heute") {
        return match time {
            Some((h, m)) => now.date().and_hms_opt(h, m, 0),
            None => Some(now),
        };
    }
    if text.contains("gestern") {
        let yesterday = now.date() - ChronoDuration::days(1);
        return match time {
            Some((h, m)) => yesterday.and_hms_opt(h, m, 0),
            None => yesterday.and_hms_opt(0, 0, 0),
        };
    }

    if let Some(caps) = FULL_DATE_RE.captures(&text) {
        let day: u32 = caps[1].parse().ok()?;
        let month: u32 = caps[2].parse().ok()?;
        let year: i32 = caps[3].parse().ok()?;
        if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
            return date.and_hms_opt(0, 0, 0);
        }
    }

    if let Some(caps) = SHORT_DATE_RE.captures(&text) {
        let day: u32 = caps[1].parse().ok()?;
        let month: u32 = caps[2].parse().ok()?;
        if let Some(date) = NaiveDate::from_ymd_opt(now.year(), month, day) {
            return date.and_hms_opt(0, 0, 0);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn external_id_from_numeric_url() {
        let url = "https://www.kleinanzeigen.de/s-anzeige/laptop-dell-xps/2345678901-278-1234";
        assert_eq!(extract_external_id(url), "2345678901");
    }

    #[test]
    fn external_id_fallback_is_stable() {
        let url = "https://www.kleinanzeigen.de/s-anzeige/some-old-listing";
        let a = extract_external_id(url);
        let b = extract_external_id(url);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, extract_external_id("https://www.kleinanzeigen.de/other"));
    }

    #[test]
    fn price_with_thousands_separator() {
        assert_eq!(parse_price("1.200 €"), (Some(1200.0), false));
    }

    #[test]
    fn price_negotiable() {
        let (price, negotiable) = parse_price("450 € VB");
        assert_eq!(price, Some(450.0));
        assert!(negotiable);
    }

    #[test]
    fn price_vb_only() {
        assert_eq!(parse_price("VB"), (None, true));
    }

    #[test]
    fn price_giveaway() {
        assert_eq!(parse_price("Zu verschenken"), (Some(0.0), false));
    }

    #[test]
    fn location_with_postal_code_and_district() {
        let (city, state) = parse_location("10115 Berlin - Mitte");
        assert_eq!(city.as_deref(), Some("Berlin"));
        assert_eq!(state.as_deref(), Some("Mitte"));
    }

    #[test]
    fn location_city_only() {
        let (city, state) = parse_location("München");
        assert_eq!(city.as_deref(), Some("München"));
        assert_eq!(state, None);
    }

    #[test]
    fn posted_date_heute_with_time() {
        let now = NaiveDate::from_ymd_opt(2025, 6, 15)
            .unwrap()
            .and_hms_opt(18, 0, 0)
            .unwrap();
        let parsed = parse_posted_date_at("Heute, 14:30", now).unwrap();
        assert_eq!(parsed.date(), now.date());
        assert_eq!((parsed.hour(), parsed.minute()), (14, 30));
    }

    #[test]
    fn posted_date_gestern() {
        let now = NaiveDate::from_ymd_opt(2025, 6, 15)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        let parsed = parse_posted_date_at("Gestern, 09:15", now).unwrap();
        assert_eq!(parsed.date(), NaiveDate::from_ymd_opt(2025, 6, 14).unwrap());
    }

    #[test]
    fn posted_date_absolute() {
        let now = NaiveDate::from_ymd_opt(2025, 6, 15)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        let parsed = parse_posted_date_at("01.12.2024", now).unwrap();
        assert_eq!(parsed.date(), NaiveDate::from_ymd_opt(2024, 12, 1).unwrap());
    }

    #[test]
    fn extracts_listings_from_page() {
        let html = r#"
            <html><body>
            <article class="aditem">
                <a class="ellipsis" href="/s-anzeige/thinkpad-t480/2345678901-278-1">ThinkPad T480</a>
                <div class="aditem-main--middle--price-shipping--price">350 € VB</div>
                <div class="aditem-main--top--left">10115 Berlin</div>
                <p class="aditem-main--middle--description">i5, 16GB RAM</p>
                <div class="aditem-main--top--right">Heute, 12:00</div>
            </article>
            <article class="aditem">
                <a class="ellipsis" href="/s-anzeige/macbook-air/2345678902-278-2">MacBook Air</a>
                <div class="aditem-main--middle--price-shipping--price">800 €</div>
            </article>
            </body></html>
        "#;
        let listings = extract_listings(html, "https://www.kleinanzeigen.de/s-notebooks/c278");
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].external_id, "2345678901");
        assert_eq!(listings[0].title, "ThinkPad T480");
        assert_eq!(listings[0].price, Some(350.0));
        assert!(listings[0].price_negotiable);
        assert_eq!(listings[0].city.as_deref(), Some("Berlin"));
        assert_eq!(listings[1].price, Some(800.0));
        assert!(!listings[1].price_negotiable);
    }

    #[test]
    fn article_without_title_is_skipped() {
        let html = r#"<article class="aditem"><div>junk</div></article>"#;
        let listings = extract_listings(html, "https://www.kleinanzeigen.de/s-notebooks/c278");
        assert!(listings.is_empty());
    }
}
