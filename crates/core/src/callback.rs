//! Load callbacks
//!
//! A callback registered on a texture is told about every decode step that
//! reaches the GPU until the texture is at least as detailed as the
//! callback asked for, or until it fails for good. The last call carries
//! `is_final == true`; after that the callback is dropped and its reference
//! on the record released.

use std::collections::HashMap;
use std::sync::Arc;

use texstream_cache::{DecodedImage, RawImage, TextureId};

use crate::registry::TextureHandle;

/// What a load callback is told
#[derive(Debug, Clone)]
pub struct ImageLoaded {
    pub success: bool,
    pub handle: TextureHandle,
    pub id: TextureId,
    /// Decoded pixels, only for callbacks registered with `keep_raw`
    pub raw: Option<Arc<RawImage>>,
    pub aux: Option<Arc<RawImage>>,
    /// Discard level now resident, `None` on failure
    pub discard_level: Option<u8>,
    pub is_final: bool,
}

/// Callback invoked on decode steps
pub type LoadedCallbackFn = Box<dyn FnMut(&ImageLoaded) + Send>;

struct LoadedCallback {
    min_discard: u8,
    keep_raw: bool,
    callback: LoadedCallbackFn,
}

/// Pending callbacks by texture
#[derive(Default)]
pub struct CallbackTable {
    entries: HashMap<TextureHandle, Vec<LoadedCallback>>,
}

impl CallbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback; it finishes once `min_discard` or finer is resident
    pub fn add(&mut self, handle: TextureHandle, min_discard: u8, keep_raw: bool, callback: LoadedCallbackFn) {
        self.entries.entry(handle).or_default().push(LoadedCallback {
            min_discard,
            keep_raw,
            callback,
        });
    }

    /// Report an upload; returns how many callbacks finished
    pub fn on_decoded(&mut self, handle: TextureHandle, id: TextureId, image: &DecodedImage) -> u32 {
        self.notify(handle, |entry| ImageLoaded {
            success: true,
            handle,
            id,
            raw: entry.keep_raw.then(|| Arc::clone(&image.raw)),
            aux: if entry.keep_raw { image.aux.clone() } else { None },
            discard_level: Some(image.discard),
            is_final: image.discard <= entry.min_discard,
        })
    }

    /// Report detail that was already resident when the callback was added
    pub fn on_resident(&mut self, handle: TextureHandle, id: TextureId, discard: u8) -> u32 {
        self.notify(handle, |entry| ImageLoaded {
            success: true,
            handle,
            id,
            raw: None,
            aux: None,
            discard_level: Some(discard),
            is_final: discard <= entry.min_discard,
        })
    }

    /// Report a permanent failure; every callback finishes
    pub fn on_failed(&mut self, handle: TextureHandle, id: TextureId) -> u32 {
        self.notify(handle, |_| ImageLoaded {
            success: false,
            handle,
            id,
            raw: None,
            aux: None,
            discard_level: None,
            is_final: true,
        })
    }

    fn notify<F>(&mut self, handle: TextureHandle, event: F) -> u32
    where
        F: Fn(&LoadedCallback) -> ImageLoaded,
    {
        let Some(entries) = self.entries.get_mut(&handle) else {
            return 0;
        };
        let before = entries.len();
        entries.retain_mut(|entry| {
            let loaded = event(entry);
            (entry.callback)(&loaded);
            !loaded.is_final
        });
        let finished = (before - entries.len()) as u32;
        if entries.is_empty() {
            self.entries.remove(&handle);
        }
        finished
    }

    /// Whether any callback is waiting on `handle`
    pub fn has_pending(&self, handle: TextureHandle) -> bool {
        self.entries.contains_key(&handle)
    }

    /// Handles with callbacks waiting
    pub fn handles(&self) -> Vec<TextureHandle> {
        self.entries.keys().copied().collect()
    }

    /// Number of callbacks waiting
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for CallbackTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackTable").field("pending", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use slotmap::KeyData;

    fn handle() -> TextureHandle {
        KeyData::from_ffi(1).into()
    }

    fn image(discard: u8) -> DecodedImage {
        DecodedImage::new(RawImage::solid(8, 8, 4, 0), discard, 256, 256)
    }

    fn recorder() -> (Arc<Mutex<Vec<ImageLoaded>>>, LoadedCallbackFn) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        (calls, Box::new(move |loaded: &ImageLoaded| sink.lock().push(loaded.clone())))
    }

    #[test]
    fn test_final_exactly_once() {
        let mut table = CallbackTable::new();
        let id = TextureId::new_random();
        let (calls, callback) = recorder();
        table.add(handle(), 1, false, callback);

        assert_eq!(table.on_decoded(handle(), id, &image(4)), 0);
        assert_eq!(table.on_decoded(handle(), id, &image(2)), 0);
        assert_eq!(table.on_decoded(handle(), id, &image(1)), 1);
        assert_eq!(table.on_decoded(handle(), id, &image(0)), 0);
        assert!(table.is_empty());

        let calls = calls.lock();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls.iter().filter(|c| c.is_final).count(), 1);
        assert!(calls.iter().all(|c| c.success && c.raw.is_none()));
        assert_eq!(calls[2].discard_level, Some(1));
    }

    #[test]
    fn test_keep_raw() {
        let mut table = CallbackTable::new();
        let (calls, callback) = recorder();
        table.add(handle(), 0, true, callback);
        table.on_decoded(handle(), TextureId::new_random(), &image(0).with_aux(RawImage::solid(8, 8, 1, 255)));

        let calls = calls.lock();
        assert!(calls[0].raw.is_some());
        assert!(calls[0].aux.is_some());
        assert!(calls[0].is_final);
    }

    #[test]
    fn test_failure_finishes_everything() {
        let mut table = CallbackTable::new();
        let (first, a) = recorder();
        let (second, b) = recorder();
        table.add(handle(), 0, false, a);
        table.add(handle(), 3, true, b);
        assert_eq!(table.len(), 2);

        assert_eq!(table.on_failed(handle(), TextureId::new_random()), 2);
        assert!(!table.has_pending(handle()));
        for calls in [first, second] {
            let calls = calls.lock();
            assert_eq!(calls.len(), 1);
            assert!(!calls[0].success);
            assert!(calls[0].is_final);
        }
    }

    #[test]
    fn test_on_resident() {
        let mut table = CallbackTable::new();
        let (calls, callback) = recorder();
        table.add(handle(), 2, false, callback);
        assert_eq!(table.on_resident(handle(), TextureId::new_random(), 2), 1);
        assert!(calls.lock()[0].is_final);
    }
}
