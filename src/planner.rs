use serde::{Deserialize, Serialize};

/// One unit of scraping work: a single (category, keyword) search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeTask {
    pub category: String,
    pub keyword: String,
}

pub const DEFAULT_CATEGORY: &str = "c278";

/// Expand raw comma-separated category and keyword lists into the full
/// cross product of tasks, in category-major order.
///
/// Entries are trimmed and empties dropped. No categories means the default
/// notebooks category; no keywords means one keywordless (browse-all) task
/// per category.
pub fn plan_tasks(categories_raw: &str, keywords_raw: &str) -> Vec<ScrapeTask> {
    let mut categories: Vec<String> = split_list(categories_raw);
    if categories.is_empty() {
        categories.push(DEFAULT_CATEGORY.to_string());
    }

    let mut keywords: Vec<String> = split_list(keywords_raw);
    if keywords.is_empty() {
        keywords.push(String::new());
    }

    let mut tasks = Vec::with_capacity(categories.len() * keywords.len());
    for category in &categories {
        for keyword in &keywords {
            tasks.push(ScrapeTask {
                category: category.clone(),
                keyword: keyword.clone(),
            });
        }
    }
    tasks
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
