//! Preloaded images and the prefetch list
//!
//! A preload hands already-decoded pixels to the list and pins the record so
//! retention never deletes it. The prefetch list remembers what was on
//! screen at the end of a session so the next one can request it early.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use texstream_cache::{DecodedImage, TextureId};
use tracing::{debug, info};

use crate::error::{TextureError, TextureResult};
use crate::registry::TextureHandle;
use crate::texture::{BoostLevel, ImageRequest, ListKind, LoadState};
use crate::texture_list::{CreateOrigin, PendingCreate, TextureList};

/// Current prefetch list format
pub const PREFETCH_LIST_VERSION: u32 = 1;

/// One remembered texture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefetchEntry {
    pub id: TextureId,
    #[serde(default)]
    pub boost: BoostLevel,
    #[serde(default)]
    pub list_kind: ListKind,
    /// Projected screen area when the list was saved
    #[serde(default)]
    pub virtual_size: f32,
}

/// Textures to request ahead of time, stored as JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefetchList {
    pub version: u32,
    pub entries: Vec<PrefetchEntry>,
}

impl Default for PrefetchList {
    fn default() -> Self {
        Self {
            version: PREFETCH_LIST_VERSION,
            entries: Vec::new(),
        }
    }
}

impl PrefetchList {
    pub fn load<P: AsRef<Path>>(path: P) -> TextureResult<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> TextureResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

impl TextureList {
    /// Hand decoded pixels straight to the create queue
    ///
    /// The record is pinned until [`unpin_preload`](Self::unpin_preload) and
    /// skips fetching and ranking. A pinned record that already has finer
    /// data resident keeps it.
    pub fn preload_decoded(&mut self, id: TextureId, image: DecodedImage) -> Option<TextureHandle> {
        let (handle, _) = self.create_record(&ImageRequest::new(id), false)?;
        self.registry.pin(handle).ok()?;

        let bytes = image.byte_size();
        let record = self.registry.get_mut(handle)?;
        record.requested_discard = Some(record.requested_discard.map_or(image.discard, |r| r.min(image.discard)));
        record.ram_bytes += bytes;
        if record.resident_discard.is_none() {
            record.state = LoadState::Decoded;
        }
        debug!(texture_id = %id, discard = image.discard, "preloaded texture queued");

        self.create_queue_bytes += bytes;
        self.create_queue.push_back(PendingCreate {
            handle,
            image,
            origin: CreateOrigin::Preload,
        });
        Some(handle)
    }

    /// Drop one preload pin
    pub fn unpin_preload(&mut self, handle: TextureHandle) -> TextureResult<()> {
        if let Some(record) = self.registry.unpin(handle)? {
            self.retire(handle, record);
        }
        Ok(())
    }

    /// Request a set of textures with their boosts
    pub fn preload_images(&mut self, images: &[(TextureId, BoostLevel)]) -> Vec<TextureHandle> {
        images
            .iter()
            .filter_map(|(id, boost)| self.get_image(ImageRequest::new(*id).boost(*boost)))
            .collect()
    }

    /// Snapshot of the textures worth prefetching next time
    ///
    /// On-screen records ordered by boost, then by screen area.
    pub fn prefetch_list(&self, max: usize) -> PrefetchList {
        let mut entries: Vec<PrefetchEntry> = self
            .registry
            .iter()
            .filter(|(_, record)| record.on_screen && !record.is_missing())
            .map(|(_, record)| PrefetchEntry {
                id: record.id,
                boost: record.boost,
                list_kind: record.kind,
                virtual_size: record.virtual_size,
            })
            .collect();
        entries.sort_by(|a, b| b.boost.cmp(&a.boost).then(b.virtual_size.total_cmp(&a.virtual_size)));
        entries.truncate(max);
        PrefetchList {
            version: PREFETCH_LIST_VERSION,
            entries,
        }
    }

    /// Write the prefetch list; returns the number of entries saved
    pub fn save_prefetch_list<P: AsRef<Path>>(&self, path: P, max: usize) -> TextureResult<usize> {
        let list = self.prefetch_list(max);
        list.save(&path)?;
        info!(path = %path.as_ref().display(), entries = list.entries.len(), "prefetch list saved");
        Ok(list.entries.len())
    }

    /// Request every texture in a saved prefetch list
    ///
    /// New records are speculative: they fetch at the lowest priority until
    /// they are seen on screen. Returns the number of records created.
    pub fn load_prefetch_list<P: AsRef<Path>>(&mut self, path: P) -> TextureResult<usize> {
        if !self.initialized {
            return Err(TextureError::NotInitialized);
        }
        let list = PrefetchList::load(&path)?;
        let mut created = 0;
        for entry in &list.entries {
            let request = ImageRequest::new(entry.id).boost(entry.boost).list_kind(entry.list_kind);
            if let Some((handle, true)) = self.create_record(&request, true) {
                if let Some(record) = self.registry.get_mut(handle) {
                    record.speculative = true;
                }
                created += 1;
            }
        }
        info!(path = %path.as_ref().display(), entries = list.entries.len(), created, "prefetch list loaded");
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::texture::TextureStats;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use texstream_cache::{RawImage, StreamingConfig};
    use texstream_scheduler::{FetchPriority, ManualClock};

    fn list() -> (TextureList, ManualClock) {
        let clock = ManualClock::new();
        let mut list = TextureList::new(StreamingConfig::default().with_fast_cache(false))
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        list.init().unwrap();
        (list, clock)
    }

    #[test]
    fn test_preload_uploads_without_fetch() {
        let (mut list, clock) = list();
        let id = TextureId::new_random();
        let image = DecodedImage::new(RawImage::solid(64, 64, 4, 0), 0, 64, 64);
        let handle = list.preload_decoded(id, image).unwrap();

        let report = list.update_images(Duration::from_millis(50));
        assert_eq!(report.uploads, 1);
        assert_eq!(report.fetches_issued, 0);
        let record = list.texture(handle).unwrap();
        assert_eq!(record.resident_discard, Some(0));
        assert_eq!(record.preload_pins, 1);

        // pinned past the retention window
        clock.advance(Duration::from_secs(120));
        list.update_images(Duration::from_millis(50));
        assert!(list.texture(handle).is_some());

        list.unpin_preload(handle).unwrap();
        list.update_images(Duration::from_millis(50));
        assert!(list.texture(handle).is_none());
    }

    #[test]
    fn test_prefetch_list_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prefetch.json");

        let (mut list, _clock) = list();
        let hud = list.get_image(ImageRequest::new(TextureId::new_random()).boost(BoostLevel::Hud)).unwrap();
        let big = list.get_image(ImageRequest::new(TextureId::new_random())).unwrap();
        let small = list.get_image(ImageRequest::new(TextureId::new_random())).unwrap();
        let hidden = list.get_image(ImageRequest::new(TextureId::new_random())).unwrap();
        list.add_texture_stats(hud, TextureStats::new(true, 10.0)).unwrap();
        list.add_texture_stats(big, TextureStats::new(true, 5000.0)).unwrap();
        list.add_texture_stats(small, TextureStats::new(true, 50.0)).unwrap();
        list.update_images(Duration::from_millis(50));

        assert_eq!(list.save_prefetch_list(&path, 2).unwrap(), 2);
        let saved = PrefetchList::load(&path).unwrap();
        let ids: Vec<TextureId> = saved.entries.iter().map(|e| e.id).collect();
        let expected: Vec<TextureId> = [hud, big].iter().map(|h| list.texture(*h).unwrap().id).collect();
        assert_eq!(ids, expected);
        assert!(!ids.contains(&list.texture(hidden).unwrap().id));

        let (mut fresh, _clock) = super::tests::list();
        assert_eq!(fresh.load_prefetch_list(&path).unwrap(), 2);
        let handle = fresh.find_image(expected[1], ListKind::Standard).unwrap();
        let record = fresh.texture(handle).unwrap();
        assert!(record.speculative);
        assert_eq!(record.fetch_priority(), FetchPriority::Prefetch);
        assert_eq!(fresh.load_prefetch_list(&path).unwrap(), 0);
    }

    #[test]
    fn test_prefetch_list_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prefetch.json");
        std::fs::write(&path, "not json").unwrap();

        let (mut list, _clock) = list();
        assert!(matches!(list.load_prefetch_list(&path), Err(TextureError::PrefetchList(_))));
        assert!(matches!(
            list.load_prefetch_list(dir.path().join("absent.json")),
            Err(TextureError::Io(_))
        ));
    }
}
