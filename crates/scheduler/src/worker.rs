//! Fetch worker pool
//!
//! Worker threads pull jobs from a shared [`FetchScheduler`], run them
//! against a [`TextureSource`] and send every result over a channel. Workers
//! never touch texture records; the main loop drains the channel during a
//! later frame.
//!
//! [`InlineFetcher`] runs the same job logic on the caller's thread, which
//! keeps tests and simulations deterministic.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, trace, warn};

use crate::cancel::CancellationToken;
use crate::fetch::{FetchCompletion, FetchError, TextureSource};
use crate::priority::FetchJob;
use crate::scheduler::FetchScheduler;

/// Retry behaviour for transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each further retry
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Retry immediately, `max_retries` times
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1u32 << shift)
    }
}

/// Run one job to completion, retrying transient failures
///
/// Returns `None` if the job was cancelled before a result was produced.
pub fn run_job(
    job: &FetchJob,
    source: &dyn TextureSource,
    token: &CancellationToken,
    retry: &RetryPolicy,
) -> Option<FetchCompletion> {
    let mut attempts = 0u32;
    loop {
        if token.is_cancelled() {
            trace!(job_id = job.id, "fetch cancelled");
            return None;
        }
        attempts += 1;
        let result = source.fetch(&job.request, token);

        if let Err(FetchError::Transient(reason)) = &result {
            if attempts <= retry.max_retries && !token.is_cancelled() {
                let delay = retry.delay(attempts);
                debug!(
                    texture_id = %job.request.texture_id,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    %reason,
                    "retrying fetch"
                );
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                continue;
            }
        }

        if token.is_cancelled() {
            return None;
        }
        return Some(FetchCompletion {
            job_id: job.id,
            request: job.request.clone(),
            result,
            attempts,
        });
    }
}

/// Configuration for the fetch worker pool
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker threads to spawn
    pub num_workers: usize,
    /// How long an idle worker sleeps before polling the queue again
    pub poll_interval: Duration,
    /// Retry behaviour for transient failures
    pub retry: RetryPolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            poll_interval: Duration::from_millis(5),
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a configuration with `num_workers` threads
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers: num_workers.max(1),
            ..Self::default()
        }
    }

    /// Set the idle poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Pool of threads executing fetch jobs
///
/// Dropping the pool signals shutdown and waits for the workers to finish
/// their current job.
pub struct FetchWorkerPool {
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl FetchWorkerPool {
    /// Spawn the workers
    ///
    /// # Errors
    /// Returns an error if a thread cannot be spawned; workers started so far
    /// are stopped again.
    pub fn start(
        scheduler: Arc<FetchScheduler>,
        source: Arc<dyn TextureSource>,
        completions: Sender<FetchCompletion>,
        config: WorkerPoolConfig,
    ) -> io::Result<Self> {
        let mut pool = Self {
            workers: Vec::with_capacity(config.num_workers),
            shutdown: Arc::new(AtomicBool::new(false)),
        };

        for id in 0..config.num_workers {
            let scheduler = Arc::clone(&scheduler);
            let source = Arc::clone(&source);
            let completions = completions.clone();
            let shutdown = Arc::clone(&pool.shutdown);
            let poll_interval = config.poll_interval;
            let retry = config.retry;

            let handle = thread::Builder::new()
                .name(format!("texstream-fetch-{}", id))
                .spawn(move || {
                    worker_loop(&scheduler, source.as_ref(), &completions, &shutdown, poll_interval, &retry)
                })?;
            pool.workers.push(handle);
        }

        debug!(workers = pool.workers.len(), "fetch workers started");
        Ok(pool)
    }

    /// Number of worker threads
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Returns true once shutdown has been signalled
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop the workers and wait for them to exit
    pub fn shutdown(self) {
        drop(self);
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("fetch worker panicked");
            }
        }
    }
}

impl Drop for FetchWorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    scheduler: &FetchScheduler,
    source: &dyn TextureSource,
    completions: &Sender<FetchCompletion>,
    shutdown: &AtomicBool,
    poll_interval: Duration,
    retry: &RetryPolicy,
) {
    while !shutdown.load(Ordering::Acquire) {
        let Some(job) = scheduler.next_job() else {
            thread::sleep(poll_interval);
            continue;
        };

        let token = scheduler.cancellation_token(job.id).unwrap_or_default();
        // a completed job must already have its result in the channel
        let delivered = match run_job(&job, source, &token, retry) {
            Some(completion) => completions.send(completion).is_ok(),
            None => true,
        };
        scheduler.complete(job.id);
        if !delivered {
            // receiver gone: the list has shut down
            break;
        }
    }
}

/// Runs queued jobs on the calling thread
///
/// Completions are still delivered through the channel, so they surface in
/// the next streaming pass exactly as worker results would.
pub struct InlineFetcher {
    scheduler: Arc<FetchScheduler>,
    source: Arc<dyn TextureSource>,
    completions: Sender<FetchCompletion>,
    retry: RetryPolicy,
}

impl InlineFetcher {
    /// Create a fetcher draining `scheduler` into `completions`
    pub fn new(
        scheduler: Arc<FetchScheduler>,
        source: Arc<dyn TextureSource>,
        completions: Sender<FetchCompletion>,
    ) -> Self {
        Self {
            scheduler,
            source,
            completions,
            retry: RetryPolicy::immediate(0),
        }
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run up to `max_jobs` queued jobs in priority order
    ///
    /// Returns the number of jobs taken from the queue.
    pub fn run_pending(&self, max_jobs: usize) -> usize {
        let mut ran = 0;
        while ran < max_jobs {
            let Some(job) = self.scheduler.next_job() else {
                break;
            };
            let token = self.scheduler.cancellation_token(job.id).unwrap_or_default();
            if let Some(completion) = run_job(&job, self.source.as_ref(), &token, &self.retry) {
                // a dropped receiver only means nobody is listening any more
                let _ = self.completions.send(completion);
            }
            self.scheduler.complete(job.id);
            ran += 1;
        }
        ran
    }

    /// Run every queued job
    pub fn run_all(&self) -> usize {
        self.run_pending(usize::MAX)
    }
}

fn num_cpus() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}
