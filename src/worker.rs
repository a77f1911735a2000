use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::ScraperConfig;
use crate::driver::{DriverFactory, PageDriver};
use crate::error::ScrapeError;
use crate::events::WorkerEvent;
use crate::merge::ResultMerger;
use crate::page::{build_search_url, url_path, PageScraper, SITE_BASE};
use crate::planner::ScrapeTask;
use crate::progress::{ProgressSink, ProgressSnapshot};
use crate::proxy::{ProxyEndpoint, ProxyPool};
use crate::robots::RobotsGate;

pub const MAX_WORKERS: usize = 4;

/// Everything a finished scrape hands back to the job layer.
#[derive(Debug)]
pub struct JobOutcome {
    pub merger: ResultMerger,
    pub pages_scraped: u32,
    pub keywords_processed: Vec<String>,
    pub tasks_total: usize,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
}

enum QueueItem {
    Task(usize, ScrapeTask),
    Stop,
}

/// Run all tasks to completion, in single-session or multi-worker mode
/// depending on the effective concurrency.
///
/// Fatal errors are limited to two cases checked before any listing fetch:
/// robots denying the job's root search path, and no session opening on any
/// proxy (or direct). Everything after that degrades per task or per
/// worker.
pub async fn run_tasks(
    config: &ScraperConfig,
    page_limit: u32,
    concurrency: usize,
    tasks: Vec<ScrapeTask>,
    proxies: &ProxyPool,
    factory: Arc<dyn DriverFactory>,
    sink: Arc<dyn ProgressSink>,
) -> Result<JobOutcome, ScrapeError> {
    let started = Instant::now();
    let concurrency = concurrency.clamp(1, MAX_WORKERS);
    let scraper = PageScraper::from_config(config, page_limit);
    let seen_ids = Arc::new(Mutex::new(HashSet::new()));

    // Preflight session on worker 0's proxy chain. Total exhaustion here is
    // job-fatal, as is a robots denial of the root search path.
    let (driver, _proxy) = open_session(factory.as_ref(), &proxies.attempts_for_worker(0), None)?;
    let mut gate = RobotsGate::new(SITE_BASE);
    gate.fetch_rules(driver.as_ref()).await;

    let root_category = tasks
        .first()
        .map(|t| t.category.as_str())
        .unwrap_or(crate::planner::DEFAULT_CATEGORY);
    let root_path = url_path(&build_search_url(root_category, "", &config.city));
    if !gate.is_allowed(&root_path) {
        return Err(ScrapeError::RobotsDisallowed(root_path));
    }

    if concurrency <= 1 || tasks.len() <= 1 {
        run_single_session(
            config, scraper, tasks, proxies, factory, sink, driver, gate, seen_ids, started,
        )
        .await
    } else {
        // The preflight session is only for the fatal checks; each worker
        // opens its own.
        drop(driver);
        run_multi_worker(
            config, scraper, tasks, proxies, factory, sink, seen_ids, started, concurrency,
        )
        .await
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_single_session(
    config: &ScraperConfig,
    scraper: PageScraper,
    tasks: Vec<ScrapeTask>,
    proxies: &ProxyPool,
    factory: Arc<dyn DriverFactory>,
    sink: Arc<dyn ProgressSink>,
    mut driver: Box<dyn PageDriver>,
    gate: RobotsGate,
    seen_ids: Arc<Mutex<HashSet<String>>>,
    started: Instant,
) -> Result<JobOutcome, ScrapeError> {
    let total = tasks.len();
    let mut outcome = JobOutcome {
        merger: ResultMerger::new(),
        pages_scraped: 0,
        keywords_processed: Vec::new(),
        tasks_total: total,
        tasks_completed: 0,
        tasks_failed: 0,
    };

    for (index, task) in tasks.into_iter().enumerate() {
        sink.record(&running_snapshot(
            task_label(&task.category, &task.keyword),
            index + 1,
            total,
            &outcome,
            1,
            started,
            None,
        ))
        .await;

        let url = build_search_url(&task.category, &task.keyword, &config.city);
        match scraper.scrape_task(driver.as_ref(), &gate, &seen_ids, &url).await {
            Ok(pages) => {
                outcome.pages_scraped += pages.pages_scraped;
                record_completed(&mut outcome, &task, pages.listings);
            }
            Err(e @ (ScrapeError::Session(_) | ScrapeError::SessionExhausted(_))) => {
                warn!("Session lost on task '{}': {}. Reopening", task.keyword, e);
                outcome.tasks_failed += 1;
                match open_session(factory.as_ref(), &proxies.attempts_for_worker(0), None) {
                    Ok((new_driver, _)) => driver = new_driver,
                    Err(e) => {
                        error!("Could not reopen a session, stopping early: {}", e);
                        break;
                    }
                }
            }
            Err(e) => {
                warn!("Task '{}' failed: {}", task.keyword, e);
                outcome.tasks_failed += 1;
            }
        }
    }

    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
async fn run_multi_worker(
    config: &ScraperConfig,
    scraper: PageScraper,
    tasks: Vec<ScrapeTask>,
    proxies: &ProxyPool,
    factory: Arc<dyn DriverFactory>,
    sink: Arc<dyn ProgressSink>,
    seen_ids: Arc<Mutex<HashSet<String>>>,
    started: Instant,
    concurrency: usize,
) -> Result<JobOutcome, ScrapeError> {
    let total = tasks.len();
    let mut outcome = JobOutcome {
        merger: ResultMerger::new(),
        pages_scraped: 0,
        keywords_processed: Vec::new(),
        tasks_total: total,
        tasks_completed: 0,
        tasks_failed: 0,
    };

    let mut items: VecDeque<QueueItem> = tasks
        .into_iter()
        .enumerate()
        .map(|(i, t)| QueueItem::Task(i, t))
        .collect();
    for _ in 0..concurrency {
        items.push_back(QueueItem::Stop);
    }
    let queue = Arc::new(Mutex::new(items));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut handles = Vec::with_capacity(concurrency);
    for worker_id in 0..concurrency {
        handles.push(tokio::spawn(run_worker(
            worker_id,
            scraper.clone(),
            config.city.clone(),
            Arc::clone(&factory),
            proxies.attempts_for_worker(worker_id),
            Arc::clone(&queue),
            Arc::clone(&seen_ids),
            tx.clone(),
        )));
    }
    drop(tx);

    let mut workers_done = 0usize;
    while let Some(event) = rx.recv().await {
        match event {
            WorkerEvent::TaskStarted {
                task_index,
                category,
                keyword,
                worker_id,
                proxy,
            } => {
                info!(
                    "Worker {} ({}) started task {}: {}/{}",
                    worker_id, proxy, task_index, category, keyword
                );
                let done = outcome.tasks_completed + outcome.tasks_failed;
                sink.record(&running_snapshot(
                    task_label(&category, &keyword),
                    done + 1,
                    total,
                    &outcome,
                    concurrency,
                    started,
                    None,
                ))
                .await;
            }
            WorkerEvent::TaskCompleted {
                task_index,
                category,
                keyword,
                worker_id,
                proxy,
                pages_scraped,
                listings,
            } => {
                info!(
                    "Worker {} ({}) completed task {} ({} listings over {} pages)",
                    worker_id,
                    proxy,
                    task_index,
                    listings.len(),
                    pages_scraped
                );
                outcome.pages_scraped += pages_scraped;
                let task = ScrapeTask { category, keyword };
                record_completed(&mut outcome, &task, listings);
                let done = outcome.tasks_completed + outcome.tasks_failed;
                sink.record(&running_snapshot(
                    task_label(&task.category, &task.keyword),
                    done,
                    total,
                    &outcome,
                    concurrency,
                    started,
                    Some(format!("Completed {}/{} tasks", done, total)),
                ))
                .await;
            }
            WorkerEvent::TaskError {
                task_index,
                category,
                keyword,
                worker_id,
                error,
                ..
            } => {
                warn!("Worker {} failed task {} ('{}'): {}", worker_id, task_index, keyword, error);
                outcome.tasks_failed += 1;
                let done = outcome.tasks_completed + outcome.tasks_failed;
                sink.record(&running_snapshot(
                    task_label(&category, &keyword),
                    done,
                    total,
                    &outcome,
                    concurrency,
                    started,
                    Some(format!("Task '{}' failed: {}", task_label(&category, &keyword), error)),
                ))
                .await;
            }
            WorkerEvent::ProxyFailed { worker_id, proxy, error } => {
                warn!("Worker {} proxy {} failed: {}", worker_id, proxy, error);
            }
            WorkerEvent::WorkerError { worker_id, error } => {
                error!("Worker {} gave up: {}", worker_id, error);
            }
            WorkerEvent::WorkerDone { worker_id } => {
                info!("Worker {} done", worker_id);
                workers_done += 1;
                if workers_done == concurrency {
                    break;
                }
            }
        }
    }

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Worker task panicked: {}", e);
        }
    }

    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    worker_id: usize,
    scraper: PageScraper,
    city: String,
    factory: Arc<dyn DriverFactory>,
    attempts: Vec<Option<ProxyEndpoint>>,
    queue: Arc<Mutex<VecDeque<QueueItem>>>,
    seen_ids: Arc<Mutex<HashSet<String>>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let session = open_session(factory.as_ref(), &attempts, Some((worker_id, &events)));
    let (mut driver, mut proxy_label) = match session {
        Ok((driver, proxy)) => {
            let label = proxy.unwrap_or_else(|| "direct".to_string());
            info!("Worker {} session up (proxy: {})", worker_id, label);
            (driver, label)
        }
        Err(e) => {
            let _ = events.send(WorkerEvent::WorkerError {
                worker_id,
                error: e.to_string(),
            });
            let _ = events.send(WorkerEvent::WorkerDone { worker_id });
            return;
        }
    };

    // Workers fetch robots rules on their own session; the fatal root check
    // already happened before any worker was spawned.
    let mut gate = RobotsGate::new(SITE_BASE);
    gate.fetch_rules(driver.as_ref()).await;

    loop {
        let item = queue.lock().unwrap().pop_front();
        let (task_index, task) = match item {
            Some(QueueItem::Task(i, t)) => (i, t),
            Some(QueueItem::Stop) | None => break,
        };

        let _ = events.send(WorkerEvent::TaskStarted {
            task_index,
            category: task.category.clone(),
            keyword: task.keyword.clone(),
            worker_id,
            proxy: proxy_label.clone(),
        });

        let url = build_search_url(&task.category, &task.keyword, &city);
        match scraper.scrape_task(driver.as_ref(), &gate, &seen_ids, &url).await {
            Ok(pages) => {
                let _ = events.send(WorkerEvent::TaskCompleted {
                    task_index,
                    category: task.category,
                    keyword: task.keyword,
                    worker_id,
                    proxy: proxy_label.clone(),
                    pages_scraped: pages.pages_scraped,
                    listings: pages.listings,
                });
            }
            Err(e) => {
                let session_lost =
                    matches!(e, ScrapeError::Session(_) | ScrapeError::SessionExhausted(_));
                let _ = events.send(WorkerEvent::TaskError {
                    task_index,
                    category: task.category,
                    keyword: task.keyword,
                    worker_id,
                    proxy: proxy_label.clone(),
                    error: e.to_string(),
                });
                if session_lost {
                    match open_session(factory.as_ref(), &attempts, Some((worker_id, &events))) {
                        Ok((new_driver, new_proxy)) => {
                            driver = new_driver;
                            proxy_label = new_proxy.unwrap_or_else(|| "direct".to_string());
                        }
                        Err(e) => {
                            let _ = events.send(WorkerEvent::WorkerError {
                                worker_id,
                                error: e.to_string(),
                            });
                            break;
                        }
                    }
                }
            }
        }
    }

    let _ = events.send(WorkerEvent::WorkerDone { worker_id });
}

/// Walk one proxy fallback chain until a session opens. The chain always
/// ends with `None` (direct connection); exhausting it is an error.
fn open_session(
    factory: &dyn DriverFactory,
    attempts: &[Option<ProxyEndpoint>],
    events: Option<(usize, &mpsc::UnboundedSender<WorkerEvent>)>,
) -> Result<(Box<dyn PageDriver>, Option<String>), ScrapeError> {
    let mut last_error = String::from("no proxy candidates");

    for attempt in attempts {
        match factory.open(attempt.as_ref()) {
            Ok(driver) => {
                return Ok((driver, attempt.as_ref().map(|p| p.label().to_string())));
            }
            Err(e) => {
                let label = attempt
                    .as_ref()
                    .map(|p| p.label().to_string())
                    .unwrap_or_else(|| "direct".to_string());
                warn!("Could not open session via {}: {}", label, e);
                if let Some((worker_id, tx)) = events {
                    let _ = tx.send(WorkerEvent::ProxyFailed {
                        worker_id,
                        proxy: label,
                        error: e.to_string(),
                    });
                }
                last_error = e.to_string();
            }
        }
    }

    Err(ScrapeError::SessionExhausted(last_error))
}

fn record_completed(
    outcome: &mut JobOutcome,
    task: &ScrapeTask,
    listings: Vec<crate::listing::RawListing>,
) {
    outcome.tasks_completed += 1;
    if !task.keyword.is_empty() && !outcome.keywords_processed.contains(&task.keyword) {
        outcome.keywords_processed.push(task.keyword.clone());
    }
    outcome.merger.merge_batch(&task.keyword, listings);
}

fn task_label(category: &str, keyword: &str) -> String {
    if keyword.is_empty() {
        format!("{} (all)", category)
    } else {
        keyword.to_string()
    }
}

fn running_snapshot(
    label: String,
    index: usize,
    total: usize,
    outcome: &JobOutcome,
    concurrency: usize,
    started: Instant,
    message: Option<String>,
) -> ProgressSnapshot {
    ProgressSnapshot {
        status: "running".to_string(),
        current_keyword: Some(label),
        keyword_index: Some(index),
        total_keywords: Some(total),
        listings_found: Some(outcome.merger.len()),
        elapsed_seconds: Some(started.elapsed().as_secs()),
        concurrency: Some(concurrency),
        message,
        timestamp: Utc::now().to_rfc3339(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::PageResponse;
    use async_trait::async_trait;
    use std::time::Duration;

    struct EmptyDriver;

    #[async_trait]
    impl PageDriver for EmptyDriver {
        async fn navigate(&self, _url: &str) -> Result<PageResponse, ScrapeError> {
            Ok(PageResponse {
                status: 200,
                html: "<html><body></body></html>".to_string(),
            })
        }
    }

    struct EmptyFactory;

    impl DriverFactory for EmptyFactory {
        fn open(
            &self,
            _proxy: Option<&ProxyEndpoint>,
        ) -> Result<Box<dyn PageDriver>, ScrapeError> {
            Ok(Box::new(EmptyDriver))
        }
    }

    #[tokio::test]
    async fn worker_events_carry_the_active_proxy_label() {
        let queue = Arc::new(Mutex::new(VecDeque::from([
            QueueItem::Task(
                0,
                ScrapeTask {
                    category: "c278".to_string(),
                    keyword: "alpha".to_string(),
                },
            ),
            QueueItem::Stop,
        ])));
        let seen_ids = Arc::new(Mutex::new(HashSet::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let attempts = vec![
            Some(ProxyEndpoint::parse("http://p0:3128").unwrap()),
            None,
        ];

        run_worker(
            1,
            PageScraper::new(Duration::from_millis(1), 1),
            String::new(),
            Arc::new(EmptyFactory),
            attempts,
            queue,
            seen_ids,
            tx,
        )
        .await;

        let mut saw_started = false;
        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                WorkerEvent::TaskStarted { proxy, .. } => {
                    assert_eq!(proxy, "http://p0:3128");
                    saw_started = true;
                }
                WorkerEvent::TaskCompleted { proxy, .. } => {
                    assert_eq!(proxy, "http://p0:3128");
                    saw_completed = true;
                }
                _ => {}
            }
        }
        assert!(saw_started && saw_completed);
    }
}
