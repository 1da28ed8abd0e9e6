//! Fetch scheduler
//!
//! Owns the fetch queue and the cancellation tokens of queued and running
//! jobs. Shared between the main loop, which submits and cancels, and the
//! workers, which pull and complete.

use parking_lot::Mutex;

use crate::cancel::{CancellationRegistry, CancellationToken};
use crate::fetch::FetchRequest;
use crate::priority::{FetchJob, FetchJobId, FetchPriority, FetchQueue};

/// Fetch scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchSchedulerStats {
    /// Total jobs submitted
    pub jobs_submitted: u64,

    /// Total jobs finished by a worker
    pub jobs_completed: u64,

    /// Total jobs removed from the queue before running
    pub jobs_cancelled: u64,

    /// Current queue size
    pub queue_size: usize,
}

impl FetchSchedulerStats {
    /// Jobs submitted but not yet completed or cancelled
    pub fn outstanding(&self) -> u64 {
        self.jobs_submitted
            .saturating_sub(self.jobs_completed)
            .saturating_sub(self.jobs_cancelled)
    }

    /// Jobs currently held by a worker
    pub fn running(&self) -> u64 {
        self.outstanding().saturating_sub(self.queue_size as u64)
    }
}

/// Priority scheduler for fetch jobs
///
/// # Example
///
/// ```
/// use texstream_cache::TextureId;
/// use texstream_scheduler::{FetchPriority, FetchRequest, FetchScheduler, FetchType};
///
/// let scheduler = FetchScheduler::new();
/// let (job_id, token) = scheduler.submit(FetchPriority::OnScreen, FetchRequest {
///     texture_id: TextureId::new_random(),
///     owner: 0,
///     discard: 2,
///     fetch_type: FetchType::Default,
///     host: None,
/// });
///
/// if let Some(job) = scheduler.next_job() {
///     assert_eq!(job.id, job_id);
///     assert!(!token.is_cancelled());
///     scheduler.complete(job.id);
/// }
/// ```
#[derive(Default)]
pub struct FetchScheduler {
    queue: FetchQueue,
    stats: Mutex<FetchSchedulerStats>,
    cancellation: CancellationRegistry,
}

impl FetchScheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a fetch, returning its job id and cancellation token
    pub fn submit(&self, priority: FetchPriority, request: FetchRequest) -> (FetchJobId, CancellationToken) {
        let job_id = self.queue.push(priority, request);
        let token = self.cancellation.register(job_id);
        self.stats.lock().jobs_submitted += 1;
        (job_id, token)
    }

    /// Pop the highest priority job
    ///
    /// The job's token stays registered until [`complete`](Self::complete).
    pub fn next_job(&self) -> Option<FetchJob> {
        self.queue.pop()
    }

    /// Mark a job as finished
    pub fn complete(&self, job_id: FetchJobId) {
        self.stats.lock().jobs_completed += 1;
        self.cancellation.unregister(job_id);
    }

    /// Cancel a job
    ///
    /// A queued job is removed; a running job only has its token cancelled.
    /// Returns true if the job was known.
    pub fn cancel(&self, job_id: FetchJobId) -> bool {
        let known = self.cancellation.cancel(job_id);
        let removed = self.queue.remove_if(|job| job.id == job_id);
        if !removed.is_empty() {
            self.stats.lock().jobs_cancelled += removed.len() as u64;
            self.cancellation.unregister(job_id);
            return true;
        }
        known
    }

    /// Cancel everything, queued and running
    ///
    /// Returns the number of queued jobs removed.
    pub fn cancel_all(&self) -> usize {
        self.cancellation.cancel_all();
        let removed = self.queue.remove_if(|_| true);
        for job_id in &removed {
            self.cancellation.unregister(*job_id);
        }
        if !removed.is_empty() {
            self.stats.lock().jobs_cancelled += removed.len() as u64;
        }
        removed.len()
    }

    /// Number of queued jobs
    pub fn pending_jobs(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if any job is queued
    pub fn has_pending_jobs(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Token of a queued or running job
    pub fn cancellation_token(&self, job_id: FetchJobId) -> Option<CancellationToken> {
        self.cancellation.get(job_id)
    }

    /// Get scheduler statistics
    pub fn stats(&self) -> FetchSchedulerStats {
        let mut stats = self.stats.lock().clone();
        stats.queue_size = self.queue.len();
        stats
    }
}
