//! Queue-based worker pool for startup connects.
//!
//! A fixed number of workers drain a primary queue of first attempts;
//! failures are requeued (with exponential inter-round backoff) onto a
//! retry queue that workers only touch when the primary queue is empty, so
//! one broken or slow upstream can never stall fresh starts.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::client::ManagedClient;

const IDLE_WORKER_POLL: Duration = Duration::from_millis(50);
const DEFAULT_RETRY_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Aggregate outcome of one scheduler run.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// Number of requeue events (not distinct servers).
    pub retried: usize,
    #[serde(skip)]
    pub duration: Duration,
}

pub struct ConnectionScheduler {
    workers: usize,
    max_retries: u32,
    max_backoff: Duration,
    deadline: Duration,
    retry_backoff_base: Duration,
}

struct Job {
    client: Arc<ManagedClient>,
    attempt: u32,
    not_before: Option<Instant>,
}

struct Queues {
    primary: std::sync::Mutex<VecDeque<Job>>,
    retry: std::sync::Mutex<VecDeque<Job>>,
    /// Woken when work is queued or the run completes.
    work: Notify,
    outstanding: AtomicUsize,
    successful: AtomicUsize,
    failed: AtomicUsize,
    retried: AtomicUsize,
}

impl ConnectionScheduler {
    pub fn new(
        workers: usize,
        max_retries: u32,
        max_backoff: Duration,
        deadline: Duration,
    ) -> Self {
        Self {
            workers: workers.max(1),
            max_retries,
            max_backoff,
            deadline,
            retry_backoff_base: DEFAULT_RETRY_BACKOFF_BASE,
        }
    }

    /// Shrink the inter-round backoff base (tests, aggressive startups).
    pub fn with_retry_backoff_base(mut self, base: Duration) -> Self {
        self.retry_backoff_base = base;
        self
    }

    /// Connect every client, retrying failures up to `max_retries` times,
    /// until all jobs are terminal or the overall deadline elapses.
    pub async fn run(&self, clients: Vec<Arc<ManagedClient>>) -> ConnectSummary {
        let started = Instant::now();
        let total = clients.len();
        if total == 0 {
            return ConnectSummary {
                total: 0,
                successful: 0,
                failed: 0,
                retried: 0,
                duration: started.elapsed(),
            };
        }

        let queues = Arc::new(Queues {
            primary: std::sync::Mutex::new(clients.into_iter().map(Job::first_attempt).collect()),
            retry: std::sync::Mutex::new(VecDeque::new()),
            work: Notify::new(),
            outstanding: AtomicUsize::new(total),
            successful: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            retried: AtomicUsize::new(0),
        });

        let mut workers = JoinSet::new();
        for worker_id in 0..self.workers.min(total) {
            let queues = queues.clone();
            let max_retries = self.max_retries;
            let max_backoff = self.max_backoff;
            let backoff_base = self.retry_backoff_base;
            workers.spawn(async move {
                worker_loop(worker_id, queues, max_retries, max_backoff, backoff_base).await;
            });
        }

        let drained = tokio::time::timeout(self.deadline, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                deadline_secs = self.deadline.as_secs(),
                "startup scheduler deadline elapsed with connects still outstanding"
            );
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }

        let summary = ConnectSummary {
            total,
            successful: queues.successful.load(Ordering::SeqCst),
            failed: queues.failed.load(Ordering::SeqCst),
            retried: queues.retried.load(Ordering::SeqCst),
            duration: started.elapsed(),
        };
        info!(
            total = summary.total,
            successful = summary.successful,
            failed = summary.failed,
            retried = summary.retried,
            duration_ms = summary.duration.as_millis() as u64,
            "startup connects finished"
        );
        summary
    }

    fn retry_delay(base: Duration, max_backoff: Duration, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(16);
        base.saturating_mul(1u32 << exponent).min(max_backoff)
    }
}

impl Job {
    fn first_attempt(client: Arc<ManagedClient>) -> Self {
        Self {
            client,
            attempt: 0,
            not_before: None,
        }
    }
}

impl Queues {
    /// Strict priority: retry jobs are only handed out when the primary
    /// queue is empty.
    fn pop(&self) -> Option<Job> {
        if let Some(job) = lock(&self.primary).pop_front() {
            return Some(job);
        }
        lock(&self.retry).pop_front()
    }

    fn finish_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Last terminal outcome; wake every idle worker so they exit.
            self.work.notify_waiters();
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    queues: Arc<Queues>,
    max_retries: u32,
    max_backoff: Duration,
    backoff_base: Duration,
) {
    loop {
        if queues.outstanding.load(Ordering::SeqCst) == 0 {
            return;
        }
        let Some(job) = queues.pop() else {
            // Jobs are in flight on other workers; wait for a requeue or
            // completion.
            tokio::select! {
                _ = queues.work.notified() => {}
                _ = tokio::time::sleep(IDLE_WORKER_POLL) => {}
            }
            continue;
        };

        if let Some(not_before) = job.not_before {
            let now = Instant::now();
            if not_before > now {
                tokio::time::sleep_until(tokio::time::Instant::from_std(not_before)).await;
            }
        }

        let server = job.client.name().to_string();
        debug!(worker = worker_id, server = %server, attempt = job.attempt, "dispatching connect");

        match job.client.connect().await {
            Ok(()) => {
                queues.successful.fetch_add(1, Ordering::SeqCst);
                queues.finish_one();
            }
            Err(error) => {
                if job.attempt < max_retries {
                    debug!(
                        server = %server,
                        attempt = job.attempt,
                        error = %format!("{error:#}"),
                        "connect failed, requeueing"
                    );
                    let attempt = job.attempt + 1;
                    let delay =
                        ConnectionScheduler::retry_delay(backoff_base, max_backoff, attempt);
                    lock(&queues.retry).push_back(Job {
                        client: job.client,
                        attempt,
                        not_before: Some(Instant::now() + delay),
                    });
                    queues.retried.fetch_add(1, Ordering::SeqCst);
                    queues.work.notify_one();
                } else {
                    debug!(
                        server = %server,
                        attempts = job.attempt + 1,
                        "connect failed terminally"
                    );
                    queues.failed.fetch_add(1, Ordering::SeqCst);
                    queues.finish_one();
                }
            }
        }
    }
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
