//! Texture records and the vocabulary shared with callers
//!
//! A [`TextureRecord`] is the registry's view of one `(TextureId, ListKind)`
//! pair: what is resident, what is wanted, what is in flight and who still
//! references it. Callers describe what they want with an [`ImageRequest`]
//! and feed render-stage visibility back with [`TextureStats`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use texstream_cache::{bytes_at_discard, TextureId, DEFAULT_IMAGE_SIZE, MAX_DISCARD_LEVEL};
use texstream_scheduler::{CancellationToken, FetchJobId, FetchPriority, FetchType};

/// Which list a texture lives in
///
/// The scaled list holds variants that are drawn at a fixed scale (map
/// tiles, UI atlases) and keeps them apart from the regular list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum ListKind {
    /// Regular streamed textures
    #[default]
    Standard,
    /// Scaled variants
    Scale,
}

/// Registry key: one record per identity and list kind
pub type TextureKey = (TextureId, ListKind);

/// Caller-assigned importance class
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum BoostLevel {
    #[default]
    None,
    Terrain,
    Avatar,
    Selected,
    Hud,
    Map,
    AvatarBake,
    Preview,
    Ui,
}

impl BoostLevel {
    /// Classes that always want full resolution and are never deleted
    pub fn pins_full_resolution(&self) -> bool {
        matches!(self, BoostLevel::Ui | BoostLevel::Preview | BoostLevel::AvatarBake)
    }

    /// Fetch tier for a record of this class
    pub fn fetch_priority(&self, on_screen: bool) -> FetchPriority {
        if self.pins_full_resolution() {
            FetchPriority::Immediate
        } else if on_screen {
            FetchPriority::OnScreen
        } else if *self != BoostLevel::None {
            FetchPriority::Normal
        } else {
            FetchPriority::Background
        }
    }
}

/// Kind of texture, used as a tie breaker when ranking
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum TextureType {
    /// Streamed from the asset service
    #[default]
    Fetched,
    /// Level-of-detail texture with a fixed resolution ladder
    Lod,
    /// Generated or loaded locally
    Local,
    /// Backed by a media stream
    Media,
}

impl TextureType {
    /// Rank carried in request descriptors
    pub fn class_rank(&self) -> u8 {
        match self {
            TextureType::Fetched => 0,
            TextureType::Lod => 1,
            TextureType::Local => 2,
            TextureType::Media => 3,
        }
    }
}

/// Where a record is in its load cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LoadState {
    /// Waiting for a fetch to be issued
    #[default]
    Pending,
    /// A fetch is in flight
    Fetching,
    /// Decoded data is queued for upload
    Decoded,
    /// Something is resident on the GPU
    Resident,
    /// Permanent failure; the fallback texture is bound
    Missing,
}

/// Pixel format hints passed through to the uploader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FormatHint {
    /// Internal (GPU-side) format
    pub internal: u32,
    /// Primary (client-side) format
    pub primary: u32,
}

/// Parameters for [`TextureList::get_image`](crate::TextureList::get_image)
///
/// # Example
///
/// ```
/// use texstream_cache::TextureId;
/// use texstream_core::{BoostLevel, ImageRequest, ListKind};
///
/// let request = ImageRequest::new(TextureId::from_name("button"))
///     .boost(BoostLevel::Ui)
///     .list_kind(ListKind::Scale)
///     .mipmap(false);
/// assert_eq!(request.boost, BoostLevel::Ui);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub id: TextureId,
    pub fetch_type: FetchType,
    pub mipmap: bool,
    pub boost: BoostLevel,
    pub texture_type: TextureType,
    pub format: FormatHint,
    pub host: Option<String>,
    pub list_kind: ListKind,
}

impl ImageRequest {
    /// Request with default parameters
    pub fn new(id: TextureId) -> Self {
        Self {
            id,
            fetch_type: FetchType::Default,
            mipmap: true,
            boost: BoostLevel::None,
            texture_type: TextureType::Fetched,
            format: FormatHint::default(),
            host: None,
            list_kind: ListKind::Standard,
        }
    }

    pub fn fetch_type(mut self, fetch_type: FetchType) -> Self {
        self.fetch_type = fetch_type;
        self
    }

    pub fn mipmap(mut self, mipmap: bool) -> Self {
        self.mipmap = mipmap;
        self
    }

    pub fn boost(mut self, boost: BoostLevel) -> Self {
        self.boost = boost;
        self
    }

    pub fn texture_type(mut self, texture_type: TextureType) -> Self {
        self.texture_type = texture_type;
        self
    }

    pub fn format(mut self, internal: u32, primary: u32) -> Self {
        self.format = FormatHint { internal, primary };
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn list_kind(mut self, kind: ListKind) -> Self {
        self.list_kind = kind;
        self
    }

    /// Registry key this request resolves to
    pub fn key(&self) -> TextureKey {
        (self.id, self.list_kind)
    }
}

/// Visibility reported by the render stage for one frame
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TextureStats {
    /// Drawn by the last render pass
    pub on_screen: bool,
    /// Projected screen area in pixels
    pub virtual_size: f32,
}

impl TextureStats {
    pub fn new(on_screen: bool, virtual_size: f32) -> Self {
        Self { on_screen, virtual_size }
    }

    /// Stats must be finite and non-negative to be ranked
    pub fn is_valid(&self) -> bool {
        self.virtual_size.is_finite() && self.virtual_size >= 0.0
    }

    /// Fold another report for the same frame into this one
    pub(crate) fn merge(&mut self, other: TextureStats) {
        self.on_screen |= other.on_screen;
        self.virtual_size = self.virtual_size.max(other.virtual_size);
    }
}

/// One live texture
#[derive(Debug, Clone)]
pub struct TextureRecord {
    pub id: TextureId,
    pub kind: ListKind,

    /// Discard level on the GPU, `None` if nothing is resident
    pub resident_discard: Option<u8>,
    /// Discard level wanted this frame
    pub desired_discard: u8,
    /// Discard level wanted last frame
    pub previous_desired: u8,
    /// Discard level admitted for fetching, `None` until first admission
    pub requested_discard: Option<u8>,

    pub on_screen: bool,
    pub virtual_size: f32,
    pub last_virtual_size: f32,
    /// Last time the record was seen on screen or requested
    pub last_referenced: Duration,
    pub last_on_screen: Duration,

    pub boost: BoostLevel,
    pub fetch_type: FetchType,
    pub texture_type: TextureType,
    pub mipmap: bool,
    pub format: FormatHint,
    pub host: Option<String>,

    /// Ticket of the fetch in flight; completions with another ticket are ignored
    pub pending_fetch: Option<FetchJobId>,
    pub(crate) fetch_token: Option<CancellationToken>,
    pub state: LoadState,
    pub fallback_bound: bool,
    pub failure_count: u32,
    pub retry_after: Option<Duration>,
    /// Requested by the prefetch list and not yet seen on screen
    pub speculative: bool,

    /// Full image size, known after the first decode
    pub full_size: Option<(u32, u32)>,
    pub components: u8,
    /// Decoded bytes waiting in the create queue
    pub ram_bytes: usize,
    pub vram_bytes: usize,

    pub callback_refs: u32,
    pub preload_pins: u32,
    pub ui_refs: u32,
    pub removal_pending: bool,

    pub(crate) frame_stats: Option<TextureStats>,
    pub(crate) fetch_queued: bool,
}

impl TextureRecord {
    /// Fresh record for a request, created at `now`
    pub fn new(request: &ImageRequest, now: Duration) -> Self {
        let desired = if request.boost.pins_full_resolution() { 0 } else { MAX_DISCARD_LEVEL };
        Self {
            id: request.id,
            kind: request.list_kind,
            resident_discard: None,
            desired_discard: desired,
            previous_desired: desired,
            requested_discard: Some(desired),
            on_screen: false,
            virtual_size: 0.0,
            last_virtual_size: 0.0,
            last_referenced: now,
            last_on_screen: now,
            boost: request.boost,
            fetch_type: request.fetch_type,
            texture_type: request.texture_type,
            mipmap: request.mipmap,
            format: request.format,
            host: request.host.clone(),
            pending_fetch: None,
            fetch_token: None,
            state: LoadState::Pending,
            fallback_bound: false,
            failure_count: 0,
            retry_after: None,
            speculative: false,
            full_size: None,
            components: 4,
            ram_bytes: 0,
            vram_bytes: 0,
            callback_refs: 0,
            preload_pins: 0,
            ui_refs: 0,
            removal_pending: false,
            frame_stats: None,
            fetch_queued: false,
        }
    }

    pub fn key(&self) -> TextureKey {
        (self.id, self.kind)
    }

    /// Callbacks, preload pins and UI references combined
    pub fn ref_count(&self) -> u32 {
        self.callback_refs + self.preload_pins + self.ui_refs
    }

    /// Full size, or the default square while it is still unknown
    pub fn full_size_or_default(&self) -> (u32, u32) {
        self.full_size.unwrap_or((DEFAULT_IMAGE_SIZE, DEFAULT_IMAGE_SIZE))
    }

    /// Estimated VRAM footprint at `discard`
    pub fn vram_at(&self, discard: u8) -> usize {
        let (width, height) = self.full_size_or_default();
        bytes_at_discard(width, height, self.components, discard, self.mipmap)
    }

    pub fn is_missing(&self) -> bool {
        self.state == LoadState::Missing
    }

    pub fn fetch_priority(&self) -> FetchPriority {
        if self.speculative && !self.on_screen {
            FetchPriority::Prefetch
        } else {
            self.boost.fetch_priority(self.on_screen)
        }
    }

    /// Forget the in-flight fetch, cancelling its token
    pub(crate) fn cancel_fetch(&mut self) -> Option<FetchJobId> {
        if let Some(token) = self.fetch_token.take() {
            token.cancel();
        }
        self.pending_fetch.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boost_pins() {
        assert!(BoostLevel::Ui.pins_full_resolution());
        assert!(BoostLevel::Preview.pins_full_resolution());
        assert!(BoostLevel::AvatarBake.pins_full_resolution());
        assert!(!BoostLevel::Hud.pins_full_resolution());
        assert!(!BoostLevel::None.pins_full_resolution());
    }

    #[test]
    fn test_boost_fetch_priority() {
        assert_eq!(BoostLevel::Ui.fetch_priority(false), FetchPriority::Immediate);
        assert_eq!(BoostLevel::None.fetch_priority(true), FetchPriority::OnScreen);
        assert_eq!(BoostLevel::Terrain.fetch_priority(false), FetchPriority::Normal);
        assert_eq!(BoostLevel::None.fetch_priority(false), FetchPriority::Background);
    }

    #[test]
    fn test_class_rank_order() {
        assert!(TextureType::Fetched.class_rank() < TextureType::Lod.class_rank());
        assert!(TextureType::Lod.class_rank() < TextureType::Local.class_rank());
        assert!(TextureType::Local.class_rank() < TextureType::Media.class_rank());
    }

    #[test]
    fn test_new_record() {
        let id = TextureId::new_random();
        let record = TextureRecord::new(&ImageRequest::new(id), Duration::from_secs(3));
        assert_eq!(record.key(), (id, ListKind::Standard));
        assert_eq!(record.state, LoadState::Pending);
        assert_eq!(record.resident_discard, None);
        assert_eq!(record.desired_discard, MAX_DISCARD_LEVEL);
        assert_eq!(record.last_referenced, Duration::from_secs(3));
        assert_eq!(record.ref_count(), 0);

        let ui = TextureRecord::new(&ImageRequest::new(id).boost(BoostLevel::Ui), Duration::ZERO);
        assert_eq!(ui.desired_discard, 0);
        assert_eq!(ui.requested_discard, Some(0));
    }

    #[test]
    fn test_stats_validation_and_merge() {
        assert!(TextureStats::new(true, 10.0).is_valid());
        assert!(!TextureStats::new(true, -1.0).is_valid());
        assert!(!TextureStats::new(true, f32::NAN).is_valid());
        assert!(!TextureStats::new(true, f32::INFINITY).is_valid());

        let mut stats = TextureStats::new(false, 100.0);
        stats.merge(TextureStats::new(true, 40.0));
        assert!(stats.on_screen);
        assert_eq!(stats.virtual_size, 100.0);
    }

    #[test]
    fn test_vram_estimate_uses_default_size() {
        let mut record = TextureRecord::new(&ImageRequest::new(TextureId::new_random()).mipmap(false), Duration::ZERO);
        assert_eq!(record.vram_at(0), (DEFAULT_IMAGE_SIZE * DEFAULT_IMAGE_SIZE * 4) as usize);
        record.full_size = Some((64, 64));
        assert_eq!(record.vram_at(1), 32 * 32 * 4);
    }

    #[test]
    fn test_cancel_fetch() {
        let mut record = TextureRecord::new(&ImageRequest::new(TextureId::new_random()), Duration::ZERO);
        let token = CancellationToken::new();
        record.pending_fetch = Some(9);
        record.fetch_token = Some(token.clone());
        assert_eq!(record.cancel_fetch(), Some(9));
        assert!(token.is_cancelled());
        assert_eq!(record.cancel_fetch(), None);
    }
}
