//! Memory budget tracking and pressure classification
//!
//! Tracks RAM (decoded pixel buffers) and VRAM (uploaded textures) usage
//! against configured limits, and turns the resulting headroom into the
//! process-wide [`PressureClass`] that decides how the streaming scheduler
//! ranks and admits texture requests.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Memory pressure class selected once per frame
///
/// Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum PressureClass {
    /// Plenty of headroom: every request is ranked and admitted normally
    #[default]
    Normal,
    /// Memory is getting tight: decreases first, bounded increases afterwards
    LowVramAllowIncrease,
    /// Memory is exhausted: no request that raises resolution is admitted
    LowVramDropIncrease,
}

impl PressureClass {
    /// Classify a headroom snapshot against the thresholds
    ///
    /// The worse of the RAM and VRAM utilizations decides the class.
    pub fn from_headroom(headroom: &MemoryHeadroom, thresholds: &PressureThresholds) -> Self {
        let utilization = headroom.worst_utilization();
        if utilization >= thresholds.drop_increase {
            PressureClass::LowVramDropIncrease
        } else if utilization >= thresholds.allow_increase {
            PressureClass::LowVramAllowIncrease
        } else {
            PressureClass::Normal
        }
    }
}

/// Utilization ratios (0.0 to 1.0) at which the pressure class changes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureThresholds {
    /// Enter `LowVramAllowIncrease` at or above this utilization
    pub allow_increase: f64,
    /// Enter `LowVramDropIncrease` at or above this utilization
    pub drop_increase: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            allow_increase: 0.80,
            drop_increase: 0.95,
        }
    }
}

impl PressureThresholds {
    /// Create thresholds, clamped to 0.0..=1.0 and kept in order
    pub fn new(allow_increase: f64, drop_increase: f64) -> Self {
        let allow_increase = allow_increase.clamp(0.0, 1.0);
        let drop_increase = drop_increase.clamp(allow_increase, 1.0);
        Self {
            allow_increase,
            drop_increase,
        }
    }
}

/// Snapshot of current RAM and VRAM usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryHeadroom {
    /// Bytes of RAM held by decoded texture data
    pub ram_used: usize,
    /// RAM budget in bytes
    pub ram_limit: usize,
    /// Bytes of VRAM held by uploaded textures
    pub vram_used: usize,
    /// VRAM budget in bytes
    pub vram_limit: usize,
}

impl MemoryHeadroom {
    /// RAM utilization (0.0 when there is no limit)
    pub fn ram_utilization(&self) -> f64 {
        ratio(self.ram_used, self.ram_limit)
    }

    /// VRAM utilization (0.0 when there is no limit)
    pub fn vram_utilization(&self) -> f64 {
        ratio(self.vram_used, self.vram_limit)
    }

    /// The worse of the two utilizations
    pub fn worst_utilization(&self) -> f64 {
        self.ram_utilization().max(self.vram_utilization())
    }

    /// VRAM bytes left before the given utilization is reached
    pub fn vram_available_until(&self, utilization: f64) -> usize {
        let ceiling = (self.vram_limit as f64 * utilization) as usize;
        ceiling.saturating_sub(self.vram_used)
    }

    /// Project this snapshot with uploads that are already on their way
    pub fn with_pending(mut self, ram_bytes: usize, vram_bytes: usize) -> Self {
        self.ram_used = self.ram_used.saturating_add(ram_bytes);
        self.vram_used = self.vram_used.saturating_add(vram_bytes);
        self
    }
}

fn ratio(used: usize, limit: usize) -> f64 {
    if limit == 0 {
        0.0
    } else {
        used as f64 / limit as f64
    }
}

/// Source of the current memory headroom
///
/// The platform glue implements this to report real GPU/RAM figures; the
/// default [`TrackedMemory`] reports what the streaming system itself has
/// accounted for.
pub trait MemoryProbe: Send + Sync {
    /// Current RAM and VRAM usage with their limits
    fn headroom(&self) -> MemoryHeadroom;
}

/// Thread-safe byte counter against a fixed budget
///
/// # Example
///
/// ```
/// use texstream_cache::memory_budget::MemoryBudget;
///
/// let budget = MemoryBudget::with_limit_mb(64);
/// if budget.can_allocate(4 * 1024 * 1024) {
///     budget.record_allocation(4 * 1024 * 1024);
/// }
/// assert_eq!(budget.current_usage(), 4 * 1024 * 1024);
/// ```
#[derive(Debug)]
pub struct MemoryBudget {
    limit: AtomicUsize,
    current_usage: AtomicUsize,
}

impl MemoryBudget {
    /// Create a budget with a limit in bytes
    pub fn new(limit: usize) -> Self {
        Self {
            limit: AtomicUsize::new(limit),
            current_usage: AtomicUsize::new(0),
        }
    }

    /// Create a budget with a limit in megabytes
    pub fn with_limit_mb(megabytes: usize) -> Self {
        Self::new(megabytes * 1024 * 1024)
    }

    /// Get the current usage in bytes
    pub fn current_usage(&self) -> usize {
        self.current_usage.load(Ordering::Relaxed)
    }

    /// Get the limit in bytes
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    /// Change the limit
    pub fn set_limit(&self, bytes: usize) {
        self.limit.store(bytes, Ordering::Relaxed);
    }

    /// Bytes left before the limit
    pub fn available(&self) -> usize {
        self.limit().saturating_sub(self.current_usage())
    }

    /// Utilization ratio (0.0 to 1.0, may exceed 1.0 when over budget)
    pub fn utilization(&self) -> f64 {
        ratio(self.current_usage(), self.limit())
    }

    /// Check if `bytes` more would still fit in the budget
    pub fn can_allocate(&self, bytes: usize) -> bool {
        self.current_usage().saturating_add(bytes) <= self.limit()
    }

    /// Record an allocation
    pub fn record_allocation(&self, bytes: usize) {
        self.current_usage.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a deallocation (saturates at zero)
    pub fn record_deallocation(&self, bytes: usize) {
        self.current_usage
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes))
            })
            .ok();
    }

    /// Overwrite the usage counter
    pub fn set_usage(&self, bytes: usize) {
        self.current_usage.store(bytes, Ordering::Relaxed);
    }

    /// Bytes that must be released to get down to `target` utilization
    pub fn bytes_to_evict(&self, target: f64) -> usize {
        let target_bytes = (self.limit() as f64 * target.clamp(0.0, 1.0)) as usize;
        self.current_usage().saturating_sub(target_bytes)
    }
}

/// RAM and VRAM budgets fed by the streaming system's own accounting
#[derive(Debug)]
pub struct TrackedMemory {
    /// Decoded pixel data waiting for upload or kept for callbacks
    pub ram: MemoryBudget,
    /// Uploaded texture data
    pub vram: MemoryBudget,
}

impl TrackedMemory {
    /// Create tracked budgets with limits in bytes
    pub fn new(ram_limit: usize, vram_limit: usize) -> Self {
        Self {
            ram: MemoryBudget::new(ram_limit),
            vram: MemoryBudget::new(vram_limit),
        }
    }
}

impl MemoryProbe for TrackedMemory {
    fn headroom(&self) -> MemoryHeadroom {
        MemoryHeadroom {
            ram_used: self.ram.current_usage(),
            ram_limit: self.ram.limit(),
            vram_used: self.vram.current_usage(),
            vram_limit: self.vram.limit(),
        }
    }
}

/// Probe whose headroom is set by hand
///
/// Used by platform glue that polls the driver itself, and by tests that
/// need to force a pressure class.
#[derive(Debug, Default)]
pub struct ManualMemoryProbe {
    headroom: Mutex<MemoryHeadroom>,
}

impl ManualMemoryProbe {
    /// Create a probe reporting `headroom`
    pub fn new(headroom: MemoryHeadroom) -> Self {
        Self {
            headroom: Mutex::new(headroom),
        }
    }

    /// Replace the reported headroom
    pub fn set(&self, headroom: MemoryHeadroom) {
        *self.headroom.lock() = headroom;
    }

    /// Report VRAM at `utilization` of `vram_limit`, with RAM idle
    pub fn set_vram_utilization(&self, vram_limit: usize, utilization: f64) {
        self.set(MemoryHeadroom {
            ram_used: 0,
            ram_limit: usize::MAX,
            vram_used: (vram_limit as f64 * utilization) as usize,
            vram_limit,
        });
    }
}

impl MemoryProbe for ManualMemoryProbe {
    fn headroom(&self) -> MemoryHeadroom {
        *self.headroom.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const MB: usize = 1024 * 1024;

    fn headroom(vram_used_mb: usize, vram_limit_mb: usize) -> MemoryHeadroom {
        MemoryHeadroom {
            ram_used: 0,
            ram_limit: 1024 * MB,
            vram_used: vram_used_mb * MB,
            vram_limit: vram_limit_mb * MB,
        }
    }

    #[test]
    fn test_pressure_class_levels() {
        let t = PressureThresholds::default();
        assert_eq!(PressureClass::from_headroom(&headroom(10, 100), &t), PressureClass::Normal);
        assert_eq!(
            PressureClass::from_headroom(&headroom(85, 100), &t),
            PressureClass::LowVramAllowIncrease
        );
        assert_eq!(
            PressureClass::from_headroom(&headroom(97, 100), &t),
            PressureClass::LowVramDropIncrease
        );
    }

    #[test]
    fn test_pressure_uses_worst_tier() {
        let t = PressureThresholds::default();
        let h = MemoryHeadroom {
            ram_used: 99 * MB,
            ram_limit: 100 * MB,
            vram_used: 0,
            vram_limit: 100 * MB,
        };
        assert_eq!(PressureClass::from_headroom(&h, &t), PressureClass::LowVramDropIncrease);
    }

    #[test]
    fn test_pressure_class_ordering() {
        assert!(PressureClass::Normal < PressureClass::LowVramAllowIncrease);
        assert!(PressureClass::LowVramAllowIncrease < PressureClass::LowVramDropIncrease);
        assert_eq!(PressureClass::default(), PressureClass::Normal);
    }

    #[test]
    fn test_thresholds_kept_in_order() {
        let t = PressureThresholds::new(0.9, 0.5);
        assert_eq!(t.allow_increase, 0.9);
        assert_eq!(t.drop_increase, 0.9);

        let t = PressureThresholds::new(-1.0, 2.0);
        assert_eq!(t.allow_increase, 0.0);
        assert_eq!(t.drop_increase, 1.0);
    }

    #[test]
    fn test_headroom_projection() {
        let h = headroom(50, 100).with_pending(MB, 30 * MB);
        assert_eq!(h.vram_used, 80 * MB);
        assert_eq!(h.ram_used, MB);
        assert!((h.vram_utilization() - 0.8).abs() < 1e-9);
        assert_eq!(headroom(50, 100).vram_available_until(0.95), 45 * MB);
        assert_eq!(headroom(99, 100).vram_available_until(0.95), 0);
    }

    #[test]
    fn test_zero_limit_is_unconstrained() {
        let h = MemoryHeadroom::default();
        assert_eq!(h.worst_utilization(), 0.0);
    }

    #[test]
    fn test_memory_budget_allocation() {
        let budget = MemoryBudget::with_limit_mb(100);

        assert!(budget.can_allocate(50 * MB));
        budget.record_allocation(50 * MB);
        assert_eq!(budget.current_usage(), 50 * MB);
        assert_eq!(budget.available(), 50 * MB);
        assert_eq!(budget.utilization(), 0.5);

        budget.record_deallocation(20 * MB);
        assert_eq!(budget.current_usage(), 30 * MB);

        budget.record_deallocation(500 * MB);
        assert_eq!(budget.current_usage(), 0);
        assert!(!budget.can_allocate(101 * MB));
    }

    #[test]
    fn test_memory_budget_eviction_target() {
        let budget = MemoryBudget::with_limit_mb(100);
        budget.set_usage(90 * MB);
        assert_eq!(budget.bytes_to_evict(0.70), 20 * MB);
        budget.set_usage(50 * MB);
        assert_eq!(budget.bytes_to_evict(0.70), 0);
    }

    #[test]
    fn test_tracked_memory_probe() {
        let tracked = TrackedMemory::new(10 * MB, 20 * MB);
        tracked.vram.record_allocation(5 * MB);
        tracked.ram.record_allocation(MB);

        let h = tracked.headroom();
        assert_eq!(h.vram_used, 5 * MB);
        assert_eq!(h.vram_limit, 20 * MB);
        assert_eq!(h.ram_used, MB);
        assert_eq!(h.ram_limit, 10 * MB);
    }

    #[test]
    fn test_manual_probe() {
        let probe = ManualMemoryProbe::default();
        probe.set_vram_utilization(100 * MB, 0.96);
        let class = PressureClass::from_headroom(&probe.headroom(), &PressureThresholds::default());
        assert_eq!(class, PressureClass::LowVramDropIncrease);
    }

    #[test]
    fn test_memory_budget_thread_safety() {
        let budget = Arc::new(MemoryBudget::with_limit_mb(100));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let budget = Arc::clone(&budget);
                thread::spawn(move || {
                    for _ in 0..100 {
                        budget.record_allocation(MB);
                        budget.record_deallocation(MB);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(budget.current_usage(), 0);
    }
}
