use scraper::{Html, Selector};
use tracing::{info, warn};

use crate::driver::PageDriver;

const AGENT_TOKEN: &str = "listing-scraper";

/// robots.txt compliance gate, fetched once per browsing session.
///
/// Fails open: if the rules cannot be fetched or parsed they stay unknown
/// and every path is treated as allowed.
#[derive(Debug, Clone)]
pub struct RobotsGate {
    scheme: String,
    host: String,
    rules: Option<RobotsRules>,
}

#[derive(Debug, Clone, Default)]
struct RobotsRules {
    allow: Vec<String>,
    disallow: Vec<String>,
}

impl RobotsGate {
    pub fn new(base_url: &str) -> Self {
        let (scheme, host) = match reqwest::Url::parse(base_url) {
            Ok(u) => (
                u.scheme().to_string(),
                u.host_str().unwrap_or_default().to_string(),
            ),
            Err(_) => ("https".to_string(), base_url.to_string()),
        };
        RobotsGate {
            scheme,
            host,
            rules: None,
        }
    }

    pub fn robots_url(&self) -> String {
        format!("{}://{}/robots.txt", self.scheme, self.host)
    }

    /// Navigate to robots.txt via the session's driver and parse the rules.
    /// Any failure leaves the rules unknown.
    pub async fn fetch_rules(&mut self, driver: &dyn PageDriver) {
        let url = self.robots_url();
        match driver.navigate(&url).await {
            Ok(resp) if (200..300).contains(&resp.status) => {
                let text = plain_text_body(&resp.html);
                self.rules = Some(parse_robots(&text));
                info!("Fetched robots.txt from {}", url);
            }
            Ok(resp) => {
                warn!("Could not fetch robots.txt: HTTP {} from {}", resp.status, url);
            }
            Err(e) => {
                warn!("Error fetching robots.txt from {}: {}", url, e);
            }
        }
    }

    #[cfg(test)]
    pub fn with_rules_from(base_url: &str, robots_txt: &str) -> Self {
        let mut gate = Self::new(base_url);
        gate.rules = Some(parse_robots(robots_txt));
        gate
    }

    /// Check whether a path may be fetched. Unknown rules mean allowed.
    /// Precedence is longest-match; Allow wins ties.
    pub fn is_allowed(&self, path: &str) -> bool {
        let Some(rules) = &self.rules else {
            warn!("robots.txt not fetched, assuming allowed");
            return true;
        };

        let disallow_len = rules
            .disallow
            .iter()
            .filter(|p| path.starts_with(p.as_str()))
            .map(|p| p.len())
            .max();
        let allow_len = rules
            .allow
            .iter()
            .filter(|p| path.starts_with(p.as_str()))
            .map(|p| p.len())
            .max();

        let allowed = match (allow_len, disallow_len) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(a), Some(d)) => a >= d,
        };
        if !allowed {
            warn!("Disallowed by robots.txt: {}", path);
        }
        allowed
    }
}

/// Chrome renders text files wrapped in an HTML document with a single
/// `<pre>` element; unwrap it when present.
fn plain_text_body(body: &str) -> String {
    if !body.contains("<pre") {
        return body.to_string();
    }
    let doc = Html::parse_document(body);
    let pre = Selector::parse("pre").unwrap();
    match doc.select(&pre).next() {
        Some(el) => el.text().collect::<String>(),
        None => body.to_string(),
    }
}

/// Parse standard allow/disallow directives for the wildcard agent or our
/// own token. Other agents' sections are ignored.
fn parse_robots(content: &str) -> RobotsRules {
    let mut rules = RobotsRules::default();
    let mut section_applies = false;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((directive, value)) = line.split_once(':') else {
            continue;
        };
        let directive = directive.trim().to_lowercase();
        let value = value.trim();

        match directive.as_str() {
            "user-agent" => {
                section_applies = value == "*" || value.to_lowercase().contains(AGENT_TOKEN);
            }
            "disallow" if section_applies => {
                if !value.is_empty() {
                    rules.disallow.push(value.to_string());
                }
            }
            "allow" if section_applies => {
                if !value.is_empty() {
                    rules.allow.push(value.to_string());
                }
            }
            _ => {}
        }
    }

    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://www.kleinanzeigen.de/s-notebooks/c278";

    #[test]
    fn robots_url_uses_scheme_and_host() {
        let gate = RobotsGate::new(BASE);
        assert_eq!(gate.robots_url(), "https://www.kleinanzeigen.de/robots.txt");
    }

    #[test]
    fn unknown_rules_fail_open() {
        let gate = RobotsGate::new(BASE);
        assert!(gate.is_allowed("/s-notebooks/c278"));
        assert!(gate.is_allowed("/anything"));
    }

    #[test]
    fn disallow_blocks_matching_prefix() {
        let gate = RobotsGate::with_rules_from(
            BASE,
            "User-agent: *\nDisallow: /s-suchen\nDisallow: /admin\n",
        );
        assert!(!gate.is_allowed("/s-suchen/laptop"));
        assert!(!gate.is_allowed("/admin"));
        assert!(gate.is_allowed("/s-notebooks/c278"));
    }

    #[test]
    fn longer_allow_overrides_disallow() {
        let gate = RobotsGate::with_rules_from(
            BASE,
            "User-agent: *\nDisallow: /s-\nAllow: /s-notebooks\n",
        );
        assert!(gate.is_allowed("/s-notebooks/c278"));
        assert!(!gate.is_allowed("/s-suchen/laptop"));
    }

    #[test]
    fn other_agent_sections_are_ignored() {
        let gate = RobotsGate::with_rules_from(
            BASE,
            "User-agent: GoogleBot\nDisallow: /\n\nUser-agent: *\nDisallow: /admin\n",
        );
        assert!(gate.is_allowed("/s-notebooks/c278"));
        assert!(!gate.is_allowed("/admin/config"));
    }

    #[test]
    fn pre_wrapped_body_is_unwrapped() {
        let body = "<html><head></head><body><pre>User-agent: *\nDisallow: /blocked\n</pre></body></html>";
        let rules = parse_robots(&plain_text_body(body));
        assert_eq!(rules.disallow, vec!["/blocked".to_string()]);
    }
}
