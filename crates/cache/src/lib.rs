//! Texture streaming cache library
//!
//! Texture identity and decoded images, RAM/VRAM budgets with pressure
//! classification, GPU residency with deferred release, the on-disk fast
//! cache, and streaming configuration.

pub mod config;
pub mod fast_cache;
pub mod gpu;
pub mod image;
pub mod memory_budget;

pub use config::{ConfigError, StreamingConfig};
pub use fast_cache::{FastCache, FastCacheStats};
pub use gpu::{GpuResidency, GpuResidencyStats, GpuTexture};
pub use image::{
    bytes_at_discard, dimension_at_discard, DecodedImage, RawImage, TextureId, DEFAULT_IMAGE_SIZE,
    MAX_DISCARD_LEVEL,
};
pub use memory_budget::{
    ManualMemoryProbe, MemoryBudget, MemoryHeadroom, MemoryProbe, PressureClass, PressureThresholds,
    TrackedMemory,
};
