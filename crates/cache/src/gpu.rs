//! GPU residency accounting with deferred release
//!
//! Tracks which textures currently own VRAM and how much. Textures that are
//! replaced or dropped are not freed on the spot: they are parked until the
//! next GPU sync point so that nothing bound by an in-flight frame disappears
//! from under the renderer.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

/// Uploaded texture owned by the residency tracker
///
/// Stores an opaque backend handle (Metal, Vulkan, wgpu, ...) plus the
/// metadata needed for VRAM accounting.
pub struct GpuTexture {
    /// Opaque handle to the GPU texture (backend-specific)
    handle: Box<dyn std::any::Any + Send>,

    /// Width of the uploaded level in pixels
    pub width: u32,

    /// Height of the uploaded level in pixels
    pub height: u32,

    /// Discard level the upload represents
    pub discard: u8,

    /// VRAM used in bytes
    vram_size: usize,
}

impl GpuTexture {
    /// Wrap a backend handle
    pub fn new<T: 'static + Send>(handle: T, width: u32, height: u32, discard: u8, vram_size: usize) -> Self {
        Self {
            handle: Box::new(handle),
            width,
            height,
            discard,
            vram_size,
        }
    }

    /// VRAM used by this texture in bytes
    pub fn vram_size(&self) -> usize {
        self.vram_size
    }

    /// Get a reference to the backend handle
    ///
    /// Returns `None` if the type doesn't match.
    pub fn handle<T: 'static>(&self) -> Option<&T> {
        self.handle.downcast_ref::<T>()
    }
}

impl fmt::Debug for GpuTexture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuTexture")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("discard", &self.discard)
            .field("vram_size", &self.vram_size)
            .finish()
    }
}

/// Statistics about GPU residency
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpuResidencyStats {
    /// Number of resident textures
    pub texture_count: usize,

    /// VRAM held by resident textures plus textures awaiting release (bytes)
    pub vram_used: usize,

    /// Textures parked until the next sync point
    pub pending_releases: usize,

    /// Bytes parked until the next sync point
    pub pending_release_bytes: usize,

    /// Total uploads recorded
    pub uploads: u64,

    /// Total textures freed at sync points
    pub releases: u64,

    /// Lookups that found a resident texture
    pub hits: u64,

    /// Lookups that found nothing
    pub misses: u64,
}

impl GpuResidencyStats {
    /// Calculate the lookup hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// VRAM residency keyed by `K`
///
/// Owned by the main loop; not internally synchronized.
///
/// # Example
///
/// ```
/// use texstream_cache::gpu::{GpuResidency, GpuTexture};
///
/// let mut gpu: GpuResidency<u32> = GpuResidency::new();
/// gpu.insert(7, GpuTexture::new((), 64, 64, 0, 16384));
/// gpu.schedule_release(7);
/// assert_eq!(gpu.vram_used(), 16384);
///
/// let freed = gpu.sync();
/// assert_eq!(freed.len(), 1);
/// assert_eq!(gpu.vram_used(), 0);
/// ```
pub struct GpuResidency<K> {
    resident: HashMap<K, GpuTexture>,
    pending_release: Vec<GpuTexture>,
    resident_bytes: usize,
    pending_bytes: usize,
    stats: GpuResidencyStats,
}

impl<K: Copy + Eq + Hash> Default for GpuResidency<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Copy + Eq + Hash> GpuResidency<K> {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self {
            resident: HashMap::new(),
            pending_release: Vec::new(),
            resident_bytes: 0,
            pending_bytes: 0,
            stats: GpuResidencyStats::default(),
        }
    }

    /// Record an upload for `key`
    ///
    /// A texture already resident under `key` is parked for release.
    pub fn insert(&mut self, key: K, texture: GpuTexture) {
        self.resident_bytes += texture.vram_size();
        if let Some(old) = self.resident.insert(key, texture) {
            self.resident_bytes = self.resident_bytes.saturating_sub(old.vram_size());
            self.park(old);
        }
        self.stats.uploads += 1;
    }

    /// Look up the texture resident under `key`
    pub fn get(&mut self, key: K) -> Option<&GpuTexture> {
        match self.resident.get(&key) {
            Some(texture) => {
                self.stats.hits += 1;
                Some(texture)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Look up the texture under `key` without touching statistics
    pub fn peek(&self, key: K) -> Option<&GpuTexture> {
        self.resident.get(&key)
    }

    /// Check residency without touching statistics
    pub fn contains(&self, key: K) -> bool {
        self.resident.contains_key(&key)
    }

    /// VRAM held by the texture under `key` (0 if not resident)
    pub fn bytes(&self, key: K) -> usize {
        self.resident.get(&key).map(|t| t.vram_size()).unwrap_or(0)
    }

    /// Discard level of the texture under `key`
    pub fn discard(&self, key: K) -> Option<u8> {
        self.resident.get(&key).map(|t| t.discard)
    }

    /// Park the texture under `key` until the next sync point
    ///
    /// Returns the number of bytes that will be freed.
    pub fn schedule_release(&mut self, key: K) -> usize {
        match self.resident.remove(&key) {
            Some(texture) => {
                let size = texture.vram_size();
                self.resident_bytes = self.resident_bytes.saturating_sub(size);
                self.park(texture);
                size
            }
            None => 0,
        }
    }

    /// Park every resident texture
    pub fn schedule_release_all(&mut self) {
        let textures: Vec<GpuTexture> = self.resident.drain().map(|(_, t)| t).collect();
        self.resident_bytes = 0;
        for texture in textures {
            self.park(texture);
        }
    }

    fn park(&mut self, texture: GpuTexture) {
        self.pending_bytes += texture.vram_size();
        self.pending_release.push(texture);
    }

    /// GPU sync point: hand back every parked texture for destruction
    pub fn sync(&mut self) -> Vec<GpuTexture> {
        self.pending_bytes = 0;
        self.stats.releases += self.pending_release.len() as u64;
        std::mem::take(&mut self.pending_release)
    }

    /// Number of resident textures
    pub fn len(&self) -> usize {
        self.resident.len()
    }

    /// Returns true if nothing is resident
    pub fn is_empty(&self) -> bool {
        self.resident.is_empty()
    }

    /// VRAM still held, including parked textures
    pub fn vram_used(&self) -> usize {
        self.resident_bytes + self.pending_bytes
    }

    /// Get current statistics
    pub fn stats(&self) -> GpuResidencyStats {
        GpuResidencyStats {
            texture_count: self.resident.len(),
            vram_used: self.vram_used(),
            pending_releases: self.pending_release.len(),
            pending_release_bytes: self.pending_bytes,
            ..self.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texture(size: usize, discard: u8) -> GpuTexture {
        GpuTexture::new(size as u64, 16, 16, discard, size)
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut gpu: GpuResidency<u32> = GpuResidency::new();
        gpu.insert(1, texture(1000, 2));

        assert!(gpu.contains(1));
        assert_eq!(gpu.bytes(1), 1000);
        assert_eq!(gpu.discard(1), Some(2));
        assert_eq!(gpu.get(1).and_then(|t| t.handle::<u64>().copied()), Some(1000));
        assert!(gpu.get(2).is_none());

        let stats = gpu.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_replacement_is_deferred() {
        let mut gpu: GpuResidency<u32> = GpuResidency::new();
        gpu.insert(1, texture(1000, 2));
        gpu.insert(1, texture(4000, 1));

        assert_eq!(gpu.len(), 1);
        assert_eq!(gpu.bytes(1), 4000);
        // old level still occupies VRAM until the sync point
        assert_eq!(gpu.vram_used(), 5000);
        assert_eq!(gpu.stats().pending_releases, 1);

        let freed = gpu.sync();
        assert_eq!(freed.len(), 1);
        assert_eq!(freed[0].discard, 2);
        assert_eq!(gpu.vram_used(), 4000);
    }

    #[test]
    fn test_release_waits_for_sync() {
        let mut gpu: GpuResidency<u32> = GpuResidency::new();
        gpu.insert(1, texture(1000, 0));
        gpu.insert(2, texture(500, 0));

        assert_eq!(gpu.schedule_release(1), 1000);
        assert_eq!(gpu.schedule_release(1), 0);
        assert!(!gpu.contains(1));
        assert_eq!(gpu.vram_used(), 1500);

        gpu.sync();
        assert_eq!(gpu.vram_used(), 500);
        assert_eq!(gpu.stats().releases, 1);
    }

    #[test]
    fn test_release_all() {
        let mut gpu: GpuResidency<u32> = GpuResidency::new();
        for key in 0..4 {
            gpu.insert(key, texture(100, 0));
        }
        gpu.schedule_release_all();
        assert!(gpu.is_empty());
        assert_eq!(gpu.vram_used(), 400);
        assert_eq!(gpu.sync().len(), 4);
        assert_eq!(gpu.vram_used(), 0);
        assert!(gpu.sync().is_empty());
    }
}
