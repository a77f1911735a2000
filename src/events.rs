use crate::listing::RawListing;

/// Events workers push to the job aggregator over the result channel.
///
/// `WorkerDone` is sent exactly once per worker, last; the aggregator exits
/// once it has collected one per spawned worker.
#[derive(Debug)]
pub enum WorkerEvent {
    TaskStarted {
        task_index: usize,
        category: String,
        keyword: String,
        worker_id: usize,
        /// Proxy server the worker's session is riding on, "direct" when
        /// none.
        proxy: String,
    },
    TaskCompleted {
        task_index: usize,
        category: String,
        keyword: String,
        worker_id: usize,
        proxy: String,
        pages_scraped: u32,
        listings: Vec<RawListing>,
    },
    TaskError {
        task_index: usize,
        category: String,
        keyword: String,
        worker_id: usize,
        proxy: String,
        error: String,
    },
    /// A worker's session on one proxy broke down; it is falling back to the
    /// next candidate. Informational only.
    ProxyFailed {
        worker_id: usize,
        proxy: String,
        error: String,
    },
    /// A worker died outside of any single task (e.g. every session attempt
    /// failed). The job continues with the remaining workers.
    WorkerError {
        worker_id: usize,
        error: String,
    },
    WorkerDone {
        worker_id: usize,
    },
}
