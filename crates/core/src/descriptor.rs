//! Per-frame request descriptors
//!
//! Rolls render-stage stats into records and derives the
//! [`RequestDescriptor`] the admission walk ranks.

use std::time::Duration;

use texstream_cache::{bytes_at_discard, MAX_DISCARD_LEVEL};
use texstream_scheduler::{RequestDescriptor, NO_DISCARD};

use crate::texture::{LoadState, TextureRecord};

/// Inputs that are the same for every record in one pass
#[derive(Debug, Clone, Copy)]
pub struct DescriptorContext {
    /// Frame start time
    pub now: Duration,
    /// Unreferenced records older than this are deleted
    pub retention: Duration,
    /// Off-screen records older than this drop to the coarsest level
    pub offscreen_downgrade: Duration,
    /// Per-texture VRAM cap
    pub max_texture_vram: usize,
}

/// Fold the stats gathered since the last pass into the record
pub fn roll_stats(record: &mut TextureRecord, now: Duration) {
    record.last_virtual_size = record.virtual_size;
    match record.frame_stats.take() {
        Some(stats) => {
            record.on_screen = stats.on_screen;
            record.virtual_size = stats.virtual_size;
            if stats.on_screen {
                record.last_on_screen = now;
                record.last_referenced = now;
                record.speculative = false;
            }
        }
        None => {
            record.on_screen = false;
            record.virtual_size = 0.0;
        }
    }
}

/// Discard level that matches the projected screen area
///
/// One discard level per factor of four between texel area and pixel area.
pub fn discard_for_area(full_size: (u32, u32), virtual_size: f32) -> u8 {
    if virtual_size.is_nan() || virtual_size <= 0.0 {
        return MAX_DISCARD_LEVEL;
    }
    let texel_area = full_size.0 as f64 * full_size.1 as f64;
    let ratio = texel_area / virtual_size as f64;
    if ratio <= 1.0 {
        return 0;
    }
    let levels = (ratio.log2() / 2.0).floor();
    levels.min(MAX_DISCARD_LEVEL as f64) as u8
}

/// Finest discard level whose footprint fits under `cap`
pub fn discard_fitting(record: &TextureRecord, cap: usize) -> u8 {
    let (width, height) = record.full_size_or_default();
    (0..=MAX_DISCARD_LEVEL)
        .find(|discard| bytes_at_discard(width, height, record.components, *discard, record.mipmap) <= cap)
        .unwrap_or(MAX_DISCARD_LEVEL)
}

/// Discard level the record wants this frame
pub fn desired_discard(record: &TextureRecord, ctx: &DescriptorContext) -> u8 {
    if record.boost.pins_full_resolution() {
        0
    } else if record.on_screen {
        discard_for_area(record.full_size_or_default(), record.virtual_size)
    } else if ctx.now.saturating_sub(record.last_on_screen) >= ctx.offscreen_downgrade {
        MAX_DISCARD_LEVEL
    } else {
        record.desired_discard
    }
}

/// Out of sight past the retention window with nothing holding it
pub fn needs_delete(record: &TextureRecord, ctx: &DescriptorContext) -> bool {
    !record.on_screen
        && record.ref_count() == 0
        && !record.boost.pins_full_resolution()
        && ctx.now.saturating_sub(record.last_referenced) > ctx.retention
}

/// Recompute the record's desired level and build its descriptor
pub fn build(record: &mut TextureRecord, ctx: &DescriptorContext) -> RequestDescriptor {
    let current = record.resident_discard.unwrap_or(NO_DISCARD);
    let scale_down = record.vram_bytes > ctx.max_texture_vram;

    let mut desired = desired_discard(record, ctx);
    if scale_down {
        desired = desired.max(discard_fitting(record, ctx.max_texture_vram));
    }
    if record.state == LoadState::Missing {
        // no automatic retries until the record is requested again
        desired = desired.max(current);
    }

    record.previous_desired = record.desired_discard;
    // a missing record with nothing resident ranks as NO_DISCARD but stores the coarsest real level
    record.desired_discard = desired.min(MAX_DISCARD_LEVEL);

    RequestDescriptor {
        texture_class: record.texture_type.class_rank(),
        desired_discard: desired,
        current_discard: current,
        previous_desired: record.previous_desired,
        on_screen: record.on_screen,
        need_to_delete: needs_delete(record, ctx),
        scale_down,
        pixel_change: RequestDescriptor::clamp_pixel_change(record.virtual_size - record.last_virtual_size),
    }
}
