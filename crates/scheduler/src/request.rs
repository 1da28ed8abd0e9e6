//! Per-frame request descriptors and their ranking
//!
//! A [`RequestDescriptor`] is a small, comparable summary of how much one
//! texture wants to change this frame. Descriptors are collected into a
//! [`RequestBatch`], which is sorted under one of three [`ComparatorPolicy`]
//! orders selected from the current memory pressure, then walked front to
//! back by the admission stage.

use texstream_cache::{PressureClass, MAX_DISCARD_LEVEL};

/// Largest pixel-area change a descriptor carries (26 bits)
pub const PIXEL_CHANGE_MAX: u32 = (1 << 26) - 1;

/// Discard value used for "nothing resident"
pub const NO_DISCARD: u8 = MAX_DISCARD_LEVEL + 1;

/// Desirability of one texture for the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestDescriptor {
    /// Rank of the texture's type (higher ranks first among equals)
    pub texture_class: u8,
    /// Discard level wanted this frame
    pub desired_discard: u8,
    /// Discard level resident now, [`NO_DISCARD`] if nothing is
    pub current_discard: u8,
    /// Discard level wanted last frame
    pub previous_desired: u8,
    /// Seen by the last render pass
    pub on_screen: bool,
    /// Unreferenced and out of sight for longer than the retention window
    pub need_to_delete: bool,
    /// Resident footprint exceeds the per-texture cap
    pub scale_down: bool,
    /// Change in projected pixel area since last frame, clamped to 26 bits
    pub pixel_change: u32,
}

impl RequestDescriptor {
    /// Clamp a pixel-area delta into descriptor range
    pub fn clamp_pixel_change(delta: f32) -> u32 {
        if delta.is_nan() {
            return 0;
        }
        let magnitude = delta.abs();
        if magnitude >= PIXEL_CHANGE_MAX as f32 {
            PIXEL_CHANGE_MAX
        } else {
            magnitude as u32
        }
    }

    /// Wants more detail than is resident
    pub fn is_increase(&self) -> bool {
        !self.need_to_delete && !self.scale_down && self.desired_discard < self.current_discard
    }

    /// Wants less detail than is resident
    pub fn is_decrease(&self) -> bool {
        self.current_discard != NO_DISCARD && self.desired_discard > self.current_discard
    }

    /// Frees memory when admitted
    pub fn is_decrease_or_delete(&self) -> bool {
        self.need_to_delete || self.scale_down || self.is_decrease()
    }

    /// Nothing to do for this texture
    pub fn is_unchanged(&self) -> bool {
        !self.is_increase() && !self.is_decrease_or_delete()
    }
}

/// Sort key shared by every policy, compared lexicographically
///
/// Fields a policy ignores are zeroed.
pub type RankKey = (bool, bool, bool, u32, u8, u8);

/// Total order applied to the batch for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparatorPolicy {
    /// Plenty of memory: rank by visibility, change, class and target detail
    Normal,
    /// Memory is tight: decreases first, then visible increases
    AllowIncreases,
    /// Memory is exhausted: only decreases and deletions matter
    DropIncreases,
}

impl From<PressureClass> for ComparatorPolicy {
    fn from(class: PressureClass) -> Self {
        match class {
            PressureClass::Normal => ComparatorPolicy::Normal,
            PressureClass::LowVramAllowIncrease => ComparatorPolicy::AllowIncreases,
            PressureClass::LowVramDropIncrease => ComparatorPolicy::DropIncreases,
        }
    }
}

impl ComparatorPolicy {
    /// Sort key for a descriptor; larger keys are processed first
    pub fn rank(&self, d: &RequestDescriptor) -> RankKey {
        let frees = d.is_decrease_or_delete();
        let evict = d.need_to_delete || d.scale_down;
        match self {
            ComparatorPolicy::DropIncreases => (frees, evict, false, d.pixel_change, 0, 0),
            ComparatorPolicy::AllowIncreases => (frees, false, d.on_screen, d.pixel_change, 0, 0),
            ComparatorPolicy::Normal => (
                frees,
                evict,
                d.on_screen,
                d.pixel_change,
                d.texture_class,
                NO_DISCARD.saturating_sub(d.desired_discard),
            ),
        }
    }

    /// Whether requests that add detail may be admitted at all
    pub fn admits_increases(&self) -> bool {
        !matches!(self, ComparatorPolicy::DropIncreases)
    }
}

/// Descriptors paired with the handle of the record they were built from
///
/// Cleared and refilled every frame; the allocation is kept.
#[derive(Debug, Clone)]
pub struct RequestBatch<H> {
    entries: Vec<(RequestDescriptor, H)>,
}

impl<H> Default for RequestBatch<H> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<H> RequestBatch<H> {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all entries, keeping capacity
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Append an entry
    pub fn push(&mut self, descriptor: RequestDescriptor, handle: H) {
        self.entries.push((descriptor, handle));
    }

    /// Stable descending sort under `policy`
    ///
    /// Entries with equal keys keep their insertion order.
    pub fn sort(&mut self, policy: ComparatorPolicy) {
        self.entries.sort_by(|a, b| policy.rank(&b.0).cmp(&policy.rank(&a.0)));
    }

    /// Entries in current order
    pub fn as_slice(&self) -> &[(RequestDescriptor, H)] {
        &self.entries
    }

    /// Iterate entries in current order
    pub fn iter(&self) -> std::slice::Iter<'_, (RequestDescriptor, H)> {
        self.entries.iter()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Allocated capacity
    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }
}

/// Memory moved by one admission pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestTally {
    /// RAM released by decreases and deletions
    pub decrease_ram: usize,
    /// RAM claimed by admitted increases
    pub increase_ram: usize,
    /// VRAM released by decreases and deletions
    pub decrease_vram: usize,
    /// VRAM claimed by admitted increases
    pub increase_vram: usize,
    /// Decreases applied
    pub decrease_requests: usize,
    /// Increases admitted
    pub increase_requests: usize,
    /// Records deleted
    pub deletions: usize,
}

impl RequestTally {
    /// Reset every counter
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Count a decrease
    pub fn record_decrease(&mut self, ram: usize, vram: usize) {
        self.decrease_ram += ram;
        self.decrease_vram += vram;
        self.decrease_requests += 1;
    }

    /// Count an admitted increase
    pub fn record_increase(&mut self, ram: usize, vram: usize) {
        self.increase_ram += ram;
        self.increase_vram += vram;
        self.increase_requests += 1;
    }

    /// Count a deletion
    pub fn record_deletion(&mut self, ram: usize, vram: usize) {
        self.decrease_ram += ram;
        self.decrease_vram += vram;
        self.deletions += 1;
    }

    /// VRAM claimed minus VRAM released (may be negative)
    pub fn net_vram(&self) -> i64 {
        self.increase_vram as i64 - self.decrease_vram as i64
    }
}
