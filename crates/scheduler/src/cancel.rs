//! Cooperative cancellation of fetch jobs
//!
//! Each submitted fetch gets a [`CancellationToken`]. Deleting or
//! downgrading a texture cancels its token; a worker that sees the flag
//! abandons the transfer and reports nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::priority::FetchJobId;

/// Shared cancellation flag
///
/// Clones observe the same flag.
///
/// # Example
///
/// ```
/// use texstream_scheduler::CancellationToken;
///
/// let token = CancellationToken::new();
/// let worker_token = token.clone();
/// token.cancel();
/// assert!(worker_token.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token in the non-cancelled state
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel this token and every clone (idempotent)
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns true once any clone has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Tokens of jobs that are queued or running, by job id
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    tokens: Mutex<HashMap<FetchJobId, CancellationToken>>,
}

impl CancellationRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job and return its token
    pub fn register(&self, job_id: FetchJobId) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.lock().insert(job_id, token.clone());
        token
    }

    /// Cancel a job's token; returns false if the job is unknown
    pub fn cancel(&self, job_id: FetchJobId) -> bool {
        match self.tokens.lock().get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every registered job, returning the count
    pub fn cancel_all(&self) -> usize {
        let tokens = self.tokens.lock();
        for token in tokens.values() {
            token.cancel();
        }
        tokens.len()
    }

    /// Forget a job once it has finished or left the queue
    pub fn unregister(&self, job_id: FetchJobId) -> bool {
        self.tokens.lock().remove(&job_id).is_some()
    }

    /// Token for a job still registered
    pub fn get(&self, job_id: FetchJobId) -> Option<CancellationToken> {
        self.tokens.lock().get(&job_id).cloned()
    }

    /// Number of registered jobs
    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    /// Returns true if no job is registered
    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_clone_shares_state() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());

        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_registry_cancel() {
        let registry = CancellationRegistry::new();
        let token = registry.register(1);

        assert_eq!(registry.len(), 1);
        assert!(registry.cancel(1));
        assert!(token.is_cancelled());
        assert!(!registry.cancel(999));
    }

    #[test]
    fn test_registry_cancel_all() {
        let registry = CancellationRegistry::new();
        let t1 = registry.register(1);
        let t2 = registry.register(2);

        assert_eq!(registry.cancel_all(), 2);
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
    }

    #[test]
    fn test_registry_unregister_and_get() {
        let registry = CancellationRegistry::new();
        let token = registry.register(7);

        let fetched = registry.get(7).unwrap();
        token.cancel();
        assert!(fetched.is_cancelled());

        assert!(registry.unregister(7));
        assert!(!registry.unregister(7));
        assert!(registry.get(7).is_none());
        assert!(registry.is_empty());
    }
}
