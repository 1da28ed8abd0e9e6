//! Frame budget tracking for the per-frame streaming pass
//!
//! Every stage of a streaming update runs against the time left in the
//! frame's budget and stops entering work once it is spent. Time is read
//! through a [`Clock`] so that tests and simulations can drive budgets
//! deterministically with a [`ManualClock`].
//!
//! # Target Frame Times
//! - 120 FPS (ProMotion): 8.33ms per frame
//! - 60 FPS (standard): 16.67ms per frame

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default frame budget for 60 FPS displays (16.67ms)
pub const FRAME_BUDGET_60FPS: Duration = Duration::from_micros(16_667);

/// Frame budget for 120 FPS displays (8.33ms)
pub const FRAME_BUDGET_120FPS: Duration = Duration::from_micros(8_333);

/// Monotonic time source
pub trait Clock: Send + Sync {
    /// Time since an arbitrary, fixed origin
    fn now(&self) -> Duration;
}

/// Wall clock backed by [`Instant`]
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock whose origin is now
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Hand-driven clock
///
/// Clones share the same time. With a non-zero step, every read advances the
/// clock by that step after returning the current value, which models work
/// that costs a fixed amount of time per budget check.
///
/// # Example
///
/// ```
/// use texstream_scheduler::frame_budget::{Clock, ManualClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::new();
/// clock.advance(Duration::from_millis(3));
/// assert_eq!(clock.now(), Duration::from_millis(3));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
    step: u64,
}

impl ManualClock {
    /// Create a clock at zero that only moves when advanced
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock at zero that advances by `step` on every read
    pub fn with_step(step: Duration) -> Self {
        Self {
            nanos: Arc::new(AtomicU64::new(0)),
            step: step.as_nanos() as u64,
        }
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Jump to an absolute time
    pub fn set(&self, to: Duration) {
        self.nanos.store(to.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.fetch_add(self.step, Ordering::SeqCst))
    }
}

/// Time budget for one pass
///
/// Tracks time spent since the pass started and answers whether the pass
/// should stop entering work.
///
/// # Example
///
/// ```
/// use texstream_scheduler::frame_budget::{FrameBudget, ManualClock};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let clock = ManualClock::new();
/// let mut budget = FrameBudget::start(Arc::new(clock.clone()), Duration::from_millis(4));
///
/// clock.advance(Duration::from_millis(1));
/// assert!(!budget.should_yield());
///
/// clock.advance(Duration::from_millis(3));
/// assert!(budget.should_yield());
/// ```
#[derive(Clone)]
pub struct FrameBudget {
    clock: Arc<dyn Clock>,

    /// Clock reading when this pass started
    start: Duration,

    /// Total budget for this pass
    budget: Duration,

    /// Number of yield checks performed
    check_count: u32,
}

impl FrameBudget {
    /// Start a budget now
    pub fn start(clock: Arc<dyn Clock>, budget: Duration) -> Self {
        let start = clock.now();
        Self {
            clock,
            start,
            budget,
            check_count: 0,
        }
    }

    /// Start a wall-clock budget for 60 FPS displays
    pub fn for_60fps() -> Self {
        Self::start(Arc::new(SystemClock::new()), FRAME_BUDGET_60FPS)
    }

    /// Restart the budget at the current time
    pub fn reset(&mut self) {
        self.start = self.clock.now();
        self.check_count = 0;
    }

    /// Current clock reading
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Time since the pass started
    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_sub(self.start)
    }

    /// Time left in this pass, `Duration::ZERO` once exceeded
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    /// Returns true once the whole budget has been spent
    pub fn is_exceeded(&self) -> bool {
        self.remaining() == Duration::ZERO
    }

    /// Check the budget, counting the check
    pub fn should_yield(&mut self) -> bool {
        self.check_count += 1;
        self.is_exceeded()
    }

    /// Total budget
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Number of yield checks performed
    pub fn check_count(&self) -> u32 {
        self.check_count
    }

    /// Clock shared by this budget
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }
}

impl std::fmt::Debug for FrameBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBudget")
            .field("start", &self.start)
            .field("budget", &self.budget)
            .field("check_count", &self.check_count)
            .finish()
    }
}

/// Measures the wall time one stage consumed
#[derive(Debug, Clone, Copy)]
pub struct StageTimer {
    started: Duration,
}

impl StageTimer {
    /// Start timing against `budget`'s clock
    pub fn start(budget: &FrameBudget) -> Self {
        Self {
            started: budget.now(),
        }
    }

    /// Time since the stage started
    pub fn finish(self, budget: &FrameBudget) -> Duration {
        budget.now().saturating_sub(self.started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual(budget_ms: u64) -> (ManualClock, FrameBudget) {
        let clock = ManualClock::new();
        let budget = FrameBudget::start(Arc::new(clock.clone()), Duration::from_millis(budget_ms));
        (clock, budget)
    }

    #[test]
    fn test_frame_budget_creation() {
        let budget = FrameBudget::for_60fps();
        assert_eq!(budget.budget(), FRAME_BUDGET_60FPS);
        assert!(FRAME_BUDGET_120FPS < FRAME_BUDGET_60FPS);
    }

    #[test]
    fn test_frame_budget_remaining() {
        let (clock, budget) = manual(10);
        assert_eq!(budget.remaining(), Duration::from_millis(10));

        clock.advance(Duration::from_millis(4));
        assert_eq!(budget.elapsed(), Duration::from_millis(4));
        assert_eq!(budget.remaining(), Duration::from_millis(6));
        assert!(!budget.is_exceeded());
    }

    #[test]
    fn test_budget_remaining_never_negative() {
        let (clock, budget) = manual(1);
        clock.advance(Duration::from_millis(10));
        assert_eq!(budget.remaining(), Duration::ZERO);
        assert!(budget.is_exceeded());
    }

    #[test]
    fn test_exceeded_exactly_at_budget() {
        let (clock, budget) = manual(5);
        clock.advance(Duration::from_micros(4_999));
        assert!(!budget.is_exceeded());
        clock.advance(Duration::from_micros(1));
        assert!(budget.is_exceeded());
    }

    #[test]
    fn test_frame_budget_reset() {
        let (clock, mut budget) = manual(10);
        clock.advance(Duration::from_millis(20));
        assert!(budget.should_yield());
        assert_eq!(budget.check_count(), 1);

        budget.reset();
        assert_eq!(budget.check_count(), 0);
        assert!(!budget.is_exceeded());
    }

    #[test]
    fn test_manual_clock_step() {
        let clock = ManualClock::with_step(Duration::from_nanos(1250));
        assert_eq!(clock.now(), Duration::ZERO);
        assert_eq!(clock.now(), Duration::from_nanos(1250));
        assert_eq!(clock.now(), Duration::from_nanos(2500));

        clock.set(Duration::from_secs(1));
        assert_eq!(clock.now(), Duration::from_secs(1));
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::new();
        let other = clock.clone();
        clock.advance(Duration::from_millis(7));
        assert_eq!(other.now(), Duration::from_millis(7));
    }

    #[test]
    fn test_stage_timer() {
        let (clock, budget) = manual(10);
        let timer = StageTimer::start(&budget);
        clock.advance(Duration::from_micros(300));
        assert_eq!(timer.finish(&budget), Duration::from_micros(300));
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
