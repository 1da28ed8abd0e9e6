//! Admission walk over a sorted request batch
//!
//! Each entry is decided in rank order and handed to an [`AdmissionTarget`]
//! that carries out the decision. The frame budget is checked after every
//! entry; entries past the stopping point keep their previous state and are
//! ranked again next frame.

use texstream_scheduler::{ComparatorPolicy, FrameBudget, RequestBatch, RequestDescriptor};

/// What to do with one texture this frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Drop the record and release its GPU texture
    Delete,
    /// Lower resident detail to `to`
    Decrease { to: u8 },
    /// Fetch more detail, down to discard `to`
    Increase { to: u8, cost: usize },
    /// An increase the current pressure or allowance does not permit
    Refused,
    Unchanged,
}

/// Carries out admission decisions for the walk
pub trait AdmissionTarget<H> {
    /// VRAM an increase to `desc.desired_discard` would add
    fn increase_cost(&self, handle: H, desc: &RequestDescriptor) -> usize;

    fn apply(&mut self, handle: H, desc: &RequestDescriptor, admission: Admission);
}

/// Counts from one walk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkReport {
    pub processed: usize,
    pub deletions: usize,
    pub decreases: usize,
    pub increases: usize,
    pub refused: usize,
    pub unchanged: usize,
    /// VRAM claimed by admitted increases
    pub increase_bytes: usize,
    /// The budget ran out before the end of the batch
    pub interrupted: bool,
}

/// Decide one entry
///
/// `allowance` is the VRAM still available for increases this frame and is
/// only consumed under [`ComparatorPolicy::AllowIncreases`].
pub fn decide(desc: &RequestDescriptor, policy: ComparatorPolicy, allowance: &mut usize, cost: usize) -> Admission {
    if desc.need_to_delete {
        return Admission::Delete;
    }
    if desc.scale_down || desc.is_decrease() {
        return Admission::Decrease { to: desc.desired_discard };
    }
    if !desc.is_increase() {
        return Admission::Unchanged;
    }
    if !policy.admits_increases() {
        return Admission::Refused;
    }
    if policy == ComparatorPolicy::AllowIncreases {
        if cost > *allowance {
            return Admission::Refused;
        }
        *allowance -= cost;
    }
    Admission::Increase { to: desc.desired_discard, cost }
}

/// Walk `batch` in order until it ends or `budget` runs out
pub fn walk<H, T>(
    batch: &RequestBatch<H>,
    policy: ComparatorPolicy,
    mut allowance: usize,
    budget: &mut FrameBudget,
    target: &mut T,
) -> WalkReport
where
    H: Copy,
    T: AdmissionTarget<H>,
{
    let mut report = WalkReport::default();

    for (desc, handle) in batch.iter() {
        let cost = if desc.is_increase() { target.increase_cost(*handle, desc) } else { 0 };
        let admission = decide(desc, policy, &mut allowance, cost);
        match admission {
            Admission::Delete => report.deletions += 1,
            Admission::Decrease { .. } => report.decreases += 1,
            Admission::Increase { cost, .. } => {
                report.increases += 1;
                report.increase_bytes += cost;
            }
            Admission::Refused => report.refused += 1,
            Admission::Unchanged => report.unchanged += 1,
        }
        target.apply(*handle, desc, admission);
        report.processed += 1;

        if budget.should_yield() {
            report.interrupted = report.processed < batch.len();
            break;
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use texstream_scheduler::{ManualClock, NO_DISCARD};

    fn desc(desired: u8, current: u8) -> RequestDescriptor {
        RequestDescriptor {
            texture_class: 0,
            desired_discard: desired,
            current_discard: current,
            previous_desired: desired,
            on_screen: true,
            need_to_delete: false,
            scale_down: false,
            pixel_change: 0,
        }
    }

    #[derive(Default)]
    struct Recorder {
        cost: usize,
        applied: Vec<(usize, Admission)>,
    }

    impl AdmissionTarget<usize> for Recorder {
        fn increase_cost(&self, _: usize, _: &RequestDescriptor) -> usize {
            self.cost
        }

        fn apply(&mut self, handle: usize, _: &RequestDescriptor, admission: Admission) {
            self.applied.push((handle, admission));
        }
    }

    fn unlimited() -> FrameBudget {
        FrameBudget::start(Arc::new(ManualClock::new()), Duration::from_secs(1))
    }

    #[test]
    fn test_decide_delete_and_decrease() {
        let mut allowance = 0;
        let mut delete = desc(5, 1);
        delete.need_to_delete = true;
        assert_eq!(decide(&delete, ComparatorPolicy::DropIncreases, &mut allowance, 0), Admission::Delete);

        assert_eq!(
            decide(&desc(3, 1), ComparatorPolicy::DropIncreases, &mut allowance, 0),
            Admission::Decrease { to: 3 }
        );

        let mut scale = desc(2, 0);
        scale.scale_down = true;
        assert_eq!(decide(&scale, ComparatorPolicy::Normal, &mut allowance, 0), Admission::Decrease { to: 2 });

        assert_eq!(decide(&desc(2, 2), ComparatorPolicy::Normal, &mut allowance, 0), Admission::Unchanged);
    }

    #[test]
    fn test_decide_increase_by_policy() {
        let increase = desc(0, NO_DISCARD);

        let mut allowance = 0;
        assert_eq!(
            decide(&increase, ComparatorPolicy::Normal, &mut allowance, 100),
            Admission::Increase { to: 0, cost: 100 }
        );
        assert_eq!(decide(&increase, ComparatorPolicy::DropIncreases, &mut allowance, 0), Admission::Refused);

        let mut allowance = 150;
        assert!(matches!(
            decide(&increase, ComparatorPolicy::AllowIncreases, &mut allowance, 100),
            Admission::Increase { .. }
        ));
        assert_eq!(allowance, 50);
        assert_eq!(decide(&increase, ComparatorPolicy::AllowIncreases, &mut allowance, 100), Admission::Refused);
        assert_eq!(allowance, 50);
    }

    #[test]
    fn test_walk_whole_batch() {
        let mut batch = RequestBatch::new();
        batch.push(desc(0, NO_DISCARD), 0usize);
        batch.push(desc(4, 1), 1);
        batch.push(desc(2, 2), 2);
        batch.sort(ComparatorPolicy::Normal);

        let mut target = Recorder { cost: 10, ..Default::default() };
        let report = walk(&batch, ComparatorPolicy::Normal, usize::MAX, &mut unlimited(), &mut target);

        assert_eq!(report.processed, 3);
        assert!(!report.interrupted);
        assert_eq!(report.decreases, 1);
        assert_eq!(report.increases, 1);
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.increase_bytes, 10);
        // the decrease ranks first
        assert_eq!(target.applied[0], (1, Admission::Decrease { to: 4 }));
    }

    #[test]
    fn test_walk_allowance_bounds_increases() {
        let mut batch = RequestBatch::new();
        for handle in 0..5usize {
            batch.push(desc(0, NO_DISCARD), handle);
        }
        batch.sort(ComparatorPolicy::AllowIncreases);

        let mut target = Recorder { cost: 40, ..Default::default() };
        let report = walk(&batch, ComparatorPolicy::AllowIncreases, 100, &mut unlimited(), &mut target);
        assert_eq!(report.increases, 2);
        assert_eq!(report.refused, 3);
        assert_eq!(report.increase_bytes, 80);
    }

    #[test]
    fn test_walk_stops_when_budget_runs_out() {
        // every clock read advances 1.25us; 5ms lasts exactly 4000 entries
        let clock = Arc::new(ManualClock::with_step(Duration::from_nanos(1250)));
        let mut budget = FrameBudget::start(clock, Duration::from_millis(5));

        let mut batch = RequestBatch::new();
        for handle in 0..10_000usize {
            batch.push(desc(2, 2), handle);
        }
        batch.sort(ComparatorPolicy::Normal);

        let mut target = Recorder::default();
        let report = walk(&batch, ComparatorPolicy::Normal, usize::MAX, &mut budget, &mut target);

        assert_eq!(report.processed, 4000);
        assert!(report.interrupted);
        assert_eq!(target.applied.len(), 4000);
        // stable sort keeps registry order, so the processed prefix is 0..4000
        assert!(target.applied.iter().enumerate().all(|(i, (handle, _))| *handle == i));
        assert!(budget.elapsed() >= Duration::from_millis(5));
    }
}
