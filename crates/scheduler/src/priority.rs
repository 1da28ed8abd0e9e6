//! Fetch priority queue
//!
//! Orders pending fetch jobs by priority tier, FIFO within a tier.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use parking_lot::Mutex;

use crate::fetch::FetchRequest;

/// Fetch priority tiers
///
/// Higher numeric values have higher priority and are executed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FetchPriority {
    /// Prefetch list entries and other speculative work
    Prefetch = 0,
    /// Off-screen textures
    Background = 1,
    /// Regular on-demand fetches
    Normal = 2,
    /// Textures the last render pass saw
    OnScreen = 3,
    /// UI, previews and bakes that must never wait behind scene content
    Immediate = 4,
}

/// Unique fetch job identifier
pub type FetchJobId = u64;

/// A queued fetch with its priority
///
/// Jobs are ordered by priority (higher first), then by insertion order
/// (earlier first).
#[derive(Debug, Clone)]
pub struct FetchJob {
    /// Unique job identifier
    pub id: FetchJobId,

    /// Priority tier
    pub priority: FetchPriority,

    /// What to fetch
    pub request: FetchRequest,

    insertion_order: u64,
}

impl PartialEq for FetchJob {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for FetchJob {}

impl PartialOrd for FetchJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FetchJob {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.priority.cmp(&other.priority) {
            // BinaryHeap is a max heap: earlier insertions must compare greater
            Ordering::Equal => other.insertion_order.cmp(&self.insertion_order),
            other => other,
        }
    }
}

/// Thread-safe priority queue of fetch jobs
pub struct FetchQueue {
    state: Mutex<QueueState>,
}

struct QueueState {
    heap: BinaryHeap<FetchJob>,
    next_job_id: FetchJobId,
    insertion_counter: u64,
}

impl FetchQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_job_id: 1,
                insertion_counter: 0,
            }),
        }
    }

    /// Queue a request, returning its job id
    pub fn push(&self, priority: FetchPriority, request: FetchRequest) -> FetchJobId {
        let mut state = self.state.lock();
        let id = state.next_job_id;
        state.next_job_id += 1;
        let insertion_order = state.insertion_counter;
        state.insertion_counter += 1;

        state.heap.push(FetchJob {
            id,
            priority,
            request,
            insertion_order,
        });
        id
    }

    /// Pop the highest priority job
    pub fn pop(&self) -> Option<FetchJob> {
        self.state.lock().heap.pop()
    }

    /// Number of queued jobs
    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Returns true if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.state.lock().heap.is_empty()
    }

    /// Remove jobs matching `predicate`, returning their ids
    pub fn remove_if<F>(&self, predicate: F) -> Vec<FetchJobId>
    where
        F: Fn(&FetchJob) -> bool,
    {
        let mut state = self.state.lock();
        let mut removed = Vec::new();
        state.heap.retain(|job| {
            if predicate(job) {
                removed.push(job.id);
                false
            } else {
                true
            }
        });
        removed
    }
}

impl Default for FetchQueue {
    fn default() -> Self {
        Self::new()
    }
}
