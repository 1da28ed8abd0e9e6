//! On-disk fast cache of small decoded textures
//!
//! Stores low-resolution decoded copies of textures so that a restart can put
//! something on screen before the network delivers. Entries are keyed by
//! [`TextureId`], one file per texture, evicted least-recently-used first once
//! the configured disk limit is reached.
//!
//! File layout (little endian):
//!
//! | bytes | field |
//! |---|---|
//! | 4 | magic `TXFC` |
//! | 1 | format version |
//! | 1 | components |
//! | 1 | discard level |
//! | 1 | reserved |
//! | 4 + 4 | width, height |
//! | 4 + 4 | full width, full height |
//! | .. | pixel data |

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::image::{DecodedImage, RawImage, TextureId, MAX_DISCARD_LEVEL};

const MAGIC: &[u8; 4] = b"TXFC";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 24;
const EXTENSION: &str = "tex";

/// Statistics for monitoring fast cache performance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FastCacheStats {
    /// Lookups that found an entry
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Entries read back from disk
    pub reads: u64,
    /// Entries written
    pub writes: u64,
    /// Entries evicted to stay within the disk limit
    pub evictions: u64,
    /// Entries dropped because their file could not be parsed
    pub corrupt: u64,
    /// Number of entries on disk
    pub entry_count: usize,
    /// Disk space used in bytes
    pub disk_used: usize,
}

impl FastCacheStats {
    /// Calculate cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheState {
    /// Entry sizes in bytes, including the header
    entries: HashMap<TextureId, usize>,
    /// front = least recently used
    lru_queue: VecDeque<TextureId>,
    stats: FastCacheStats,
    disk_limit: usize,
    cache_dir: PathBuf,
}

impl CacheState {
    fn path_for(&self, id: TextureId) -> PathBuf {
        self.cache_dir.join(format!("{}.{}", id, EXTENSION))
    }

    fn touch(&mut self, id: TextureId) {
        self.lru_queue.retain(|&k| k != id);
        self.lru_queue.push_back(id);
    }

    fn forget(&mut self, id: TextureId) -> io::Result<()> {
        if let Some(size) = self.entries.remove(&id) {
            self.lru_queue.retain(|&k| k != id);
            self.stats.disk_used = self.stats.disk_used.saturating_sub(size);
            self.stats.entry_count = self.entries.len();
            if let Err(e) = fs::remove_file(self.path_for(id)) {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn evict_until_space_available(&mut self, needed: usize) -> io::Result<()> {
        while self.stats.disk_used + needed > self.disk_limit {
            let Some(id) = self.lru_queue.front().copied() else {
                break;
            };
            self.forget(id)?;
            self.stats.evictions += 1;
        }
        Ok(())
    }
}

/// Persistent LRU cache of decoded textures
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct FastCache {
    state: Arc<Mutex<CacheState>>,
}

impl FastCache {
    /// Open (creating if needed) a cache directory with a disk limit in bytes
    pub fn new<P: AsRef<Path>>(cache_dir: P, disk_limit: usize) -> io::Result<Self> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        fs::create_dir_all(&cache_dir)?;

        Ok(Self {
            state: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                lru_queue: VecDeque::new(),
                stats: FastCacheStats::default(),
                disk_limit,
                cache_dir,
            })),
        })
    }

    /// Open a cache with the disk limit in megabytes
    pub fn with_mb_limit<P: AsRef<Path>>(cache_dir: P, megabytes: usize) -> io::Result<Self> {
        Self::new(cache_dir, megabytes * 1024 * 1024)
    }

    /// Store a decoded image, replacing any previous entry
    pub fn put(&self, id: TextureId, image: &DecodedImage) -> io::Result<()> {
        let mut state = self.state.lock();
        let size = HEADER_LEN + image.raw.byte_size();

        state.forget(id)?;
        state.evict_until_space_available(size)?;

        let mut file = File::create(state.path_for(id))?;
        file.write_all(&encode_header(image))?;
        file.write_all(&image.raw.pixels)?;
        file.sync_all()?;

        state.entries.insert(id, size);
        state.lru_queue.push_back(id);
        state.stats.disk_used += size;
        state.stats.entry_count = state.entries.len();
        state.stats.writes += 1;
        Ok(())
    }

    /// Store a copy of `image` reduced until both edges fit `max_dimension`
    pub fn put_downsampled(&self, id: TextureId, image: &DecodedImage, max_dimension: u32) -> io::Result<()> {
        let (small, levels) = image.raw.downsample_to(max_dimension);
        let discard = image.discard.saturating_add(levels);
        let copy = DecodedImage::new(small, discard, image.full_width, image.full_height);
        self.put(id, &copy)
    }

    /// Read an entry back
    ///
    /// Entries that fail to parse are removed and reported as a miss.
    pub fn get(&self, id: TextureId) -> io::Result<Option<DecodedImage>> {
        let mut state = self.state.lock();

        if !state.entries.contains_key(&id) {
            state.stats.misses += 1;
            return Ok(None);
        }

        let mut bytes = Vec::new();
        match File::open(state.path_for(id)) {
            Ok(mut file) => {
                file.read_to_end(&mut bytes)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                state.forget(id)?;
                state.stats.misses += 1;
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        match decode_entry(&bytes) {
            Some(image) => {
                state.touch(id);
                state.stats.hits += 1;
                state.stats.reads += 1;
                Ok(Some(image))
            }
            None => {
                warn!(texture_id = %id, bytes = bytes.len(), "dropping corrupt fast cache entry");
                state.forget(id)?;
                state.stats.corrupt += 1;
                state.stats.misses += 1;
                Ok(None)
            }
        }
    }

    /// Check for an entry without touching LRU order
    pub fn contains(&self, id: TextureId) -> bool {
        self.state.lock().entries.contains_key(&id)
    }

    /// Remove an entry
    pub fn remove(&self, id: TextureId) -> io::Result<()> {
        self.state.lock().forget(id)
    }

    /// Remove every entry
    pub fn clear(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        let ids: Vec<TextureId> = state.entries.keys().copied().collect();
        for id in ids {
            state.forget(id)?;
        }
        Ok(())
    }

    /// Index entries left on disk by a previous run
    ///
    /// Returns the number of entries found.
    pub fn load_existing(&self) -> io::Result<usize> {
        let mut state = self.state.lock();
        state.entries.clear();
        state.lru_queue.clear();
        state.stats.disk_used = 0;

        for entry in fs::read_dir(&state.cache_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<TextureId>().ok())
            else {
                continue;
            };
            let size = entry.metadata()?.len() as usize;
            state.entries.insert(id, size);
            state.lru_queue.push_back(id);
            state.stats.disk_used += size;
        }

        state.stats.entry_count = state.entries.len();
        let disk_limit = state.disk_limit;
        if state.stats.disk_used > disk_limit {
            state.evict_until_space_available(0)?;
        }
        debug!(entries = state.entries.len(), bytes = state.stats.disk_used, "fast cache indexed");
        Ok(state.entries.len())
    }

    /// Get current statistics
    pub fn stats(&self) -> FastCacheStats {
        self.state.lock().stats.clone()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns true if the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cache directory path
    pub fn cache_dir(&self) -> PathBuf {
        self.state.lock().cache_dir.clone()
    }
}

fn encode_header(image: &DecodedImage) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4] = FORMAT_VERSION;
    header[5] = image.raw.components;
    header[6] = image.discard;
    header[8..12].copy_from_slice(&image.raw.width.to_le_bytes());
    header[12..16].copy_from_slice(&image.raw.height.to_le_bytes());
    header[16..20].copy_from_slice(&image.full_width.to_le_bytes());
    header[20..24].copy_from_slice(&image.full_height.to_le_bytes());
    header
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let slice = bytes.get(at..at + 4)?;
    Some(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn decode_entry(bytes: &[u8]) -> Option<DecodedImage> {
    if bytes.len() < HEADER_LEN || &bytes[0..4] != MAGIC || bytes[4] != FORMAT_VERSION {
        return None;
    }
    let components = bytes[5];
    let discard = bytes[6];
    let width = read_u32(bytes, 8)?;
    let height = read_u32(bytes, 12)?;
    let full_width = read_u32(bytes, 16)?;
    let full_height = read_u32(bytes, 20)?;
    if discard > MAX_DISCARD_LEVEL || full_width == 0 || full_height == 0 {
        return None;
    }

    let raw = RawImage::new(width, height, components, bytes[HEADER_LEN..].to_vec())?;
    Some(DecodedImage::new(raw, discard, full_width, full_height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn image(edge: u32, value: u8) -> DecodedImage {
        DecodedImage::new(RawImage::solid(edge, edge, 4, value), 0, edge, edge)
    }

    fn create_test_cache(limit: usize) -> (FastCache, TempDir) {
        let dir = TempDir::new().unwrap();
        let cache = FastCache::new(dir.path(), limit).unwrap();
        (cache, dir)
    }

    #[test]
    fn test_basic_put_get() {
        let (cache, _dir) = create_test_cache(1024 * 1024);
        let id = TextureId::new_random();

        cache.put(id, &image(16, 42)).unwrap();
        let back = cache.get(id).unwrap().unwrap();

        assert_eq!(back.raw.width, 16);
        assert_eq!(back.raw.components, 4);
        assert_eq!(back.full_width, 16);
        assert!(back.raw.pixels.iter().all(|&p| p == 42));

        let stats = cache.stats();
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.disk_used, HEADER_LEN + 16 * 16 * 4);
    }

    #[test]
    fn test_cache_miss() {
        let (cache, _dir) = create_test_cache(1024);
        assert!(cache.get(TextureId::new_random()).unwrap().is_none());
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().hit_rate(), 0.0);
    }

    #[test]
    fn test_lru_eviction() {
        let entry = HEADER_LEN + 16 * 16 * 4;
        let (cache, _dir) = create_test_cache(entry * 3);
        let ids: Vec<TextureId> = (0..4).map(|_| TextureId::new_random()).collect();

        cache.put(ids[0], &image(16, 1)).unwrap();
        cache.put(ids[1], &image(16, 2)).unwrap();
        cache.put(ids[2], &image(16, 3)).unwrap();
        // keep the oldest alive
        cache.get(ids[0]).unwrap();
        cache.put(ids[3], &image(16, 4)).unwrap();

        assert!(cache.contains(ids[0]));
        assert!(!cache.contains(ids[1]));
        assert!(cache.contains(ids[3]));
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_put_downsampled() {
        let (cache, _dir) = create_test_cache(1024 * 1024);
        let id = TextureId::new_random();
        let big = DecodedImage::new(RawImage::solid(256, 128, 3, 5), 1, 512, 256);

        cache.put_downsampled(id, &big, 64).unwrap();
        let back = cache.get(id).unwrap().unwrap();

        assert_eq!((back.raw.width, back.raw.height), (64, 32));
        assert_eq!(back.discard, 3);
        assert_eq!((back.full_width, back.full_height), (512, 256));
    }

    #[test]
    fn test_corrupt_entry_is_dropped() {
        let (cache, dir) = create_test_cache(1024 * 1024);
        let id = TextureId::new_random();
        cache.put(id, &image(8, 1)).unwrap();

        fs::write(dir.path().join(format!("{}.tex", id)), b"garbage").unwrap();

        assert!(cache.get(id).unwrap().is_none());
        assert!(!cache.contains(id));
        assert_eq!(cache.stats().corrupt, 1);
    }

    #[test]
    fn test_out_of_range_header_is_dropped() {
        let (cache, dir) = create_test_cache(1024 * 1024);
        let deep = TextureId::new_random();
        let flat = TextureId::new_random();
        cache.put(deep, &image(8, 1)).unwrap();
        cache.put(flat, &image(8, 1)).unwrap();

        let path = dir.path().join(format!("{}.tex", deep));
        let mut bytes = fs::read(&path).unwrap();
        bytes[6] = 200;
        fs::write(&path, bytes).unwrap();

        let path = dir.path().join(format!("{}.tex", flat));
        let mut bytes = fs::read(&path).unwrap();
        bytes[16..20].copy_from_slice(&0u32.to_le_bytes());
        fs::write(&path, bytes).unwrap();

        assert!(cache.get(deep).unwrap().is_none());
        assert!(cache.get(flat).unwrap().is_none());
        assert!(!cache.contains(deep));
        assert!(!cache.contains(flat));
        assert_eq!(cache.stats().corrupt, 2);
    }

    #[test]
    fn test_load_existing() {
        let dir = TempDir::new().unwrap();
        let id = TextureId::new_random();
        {
            let cache = FastCache::new(dir.path(), 1024 * 1024).unwrap();
            cache.put(id, &image(8, 9)).unwrap();
        }
        fs::write(dir.path().join("unrelated.txt"), b"x").unwrap();

        let reopened = FastCache::new(dir.path(), 1024 * 1024).unwrap();
        assert_eq!(reopened.load_existing().unwrap(), 1);
        assert!(reopened.contains(id));
        assert_eq!(reopened.get(id).unwrap().unwrap().raw.pixels[0], 9);
    }

    #[test]
    fn test_remove_and_clear() {
        let (cache, _dir) = create_test_cache(1024 * 1024);
        let a = TextureId::new_random();
        let b = TextureId::new_random();
        cache.put(a, &image(4, 1)).unwrap();
        cache.put(b, &image(4, 1)).unwrap();

        cache.remove(a).unwrap();
        assert!(!cache.contains(a));
        cache.clear().unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().disk_used, 0);
    }
}
