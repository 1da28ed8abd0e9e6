//! Texture identity and decoded pixel buffers
//!
//! Defines the content identity used as the primary key everywhere in the
//! streaming system, plus the raw decoded images that travel from the fetch
//! workers to the upload stage and to the fast cache.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Coarsest discard level a texture can be reduced to.
///
/// Discard 0 is full resolution; each level halves both dimensions.
pub const MAX_DISCARD_LEVEL: u8 = 5;

/// Edge length assumed for textures whose real dimensions are not known yet.
pub const DEFAULT_IMAGE_SIZE: u32 = 1024;

/// Content identity of a texture (asset UUID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TextureId(Uuid);

impl TextureId {
    /// Wrap an existing UUID
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Generate a fresh random identity
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Derive a stable identity from a name, used for local and bundled assets
    pub fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()))
    }

    /// The nil identity, never a valid texture
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Returns true if this identity can name a real texture
    pub fn is_valid(&self) -> bool {
        !self.0.is_nil()
    }

    /// Access the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TextureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for TextureId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::str::FromStr for TextureId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Dimension of an image edge at a given discard level (never below 1)
pub fn dimension_at_discard(full: u32, discard: u8) -> u32 {
    (full >> discard.min(31)).max(1)
}

/// Bytes needed to hold an image at a discard level
///
/// Mipmapped textures carry roughly a third more for the mip chain.
pub fn bytes_at_discard(full_width: u32, full_height: u32, components: u8, discard: u8, mipmap: bool) -> usize {
    let w = dimension_at_discard(full_width, discard) as usize;
    let h = dimension_at_discard(full_height, discard) as usize;
    let base = w * h * components as usize;
    if mipmap {
        base + base / 3
    } else {
        base
    }
}

/// Decoded pixel data at one discard level
#[derive(Clone, PartialEq, Eq)]
pub struct RawImage {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Bytes per pixel (1 to 4)
    pub components: u8,

    /// Tightly packed pixel rows
    pub pixels: Vec<u8>,
}

impl RawImage {
    /// Create an image, returning `None` if the buffer does not match the dimensions
    pub fn new(width: u32, height: u32, components: u8, pixels: Vec<u8>) -> Option<Self> {
        let expected = width as usize * height as usize * components as usize;
        if width == 0 || height == 0 || components == 0 || components > 4 || pixels.len() != expected {
            return None;
        }
        Some(Self {
            width,
            height,
            components,
            pixels,
        })
    }

    /// A solid-colour image, handy for placeholders and synthetic sources
    pub fn solid(width: u32, height: u32, components: u8, value: u8) -> Self {
        let components = components.clamp(1, 4);
        let width = width.max(1);
        let height = height.max(1);
        Self {
            width,
            height,
            components,
            pixels: vec![value; width as usize * height as usize * components as usize],
        }
    }

    /// Size of the pixel buffer in bytes
    pub fn byte_size(&self) -> usize {
        self.pixels.len()
    }

    /// Halve the image with a 2x2 box filter until both edges fit `max_dim`
    ///
    /// Returns the new image and how many levels were dropped.
    pub fn downsample_to(&self, max_dim: u32) -> (RawImage, u8) {
        let max_dim = max_dim.max(1);
        let mut current = self.clone();
        let mut levels = 0u8;
        while current.width.max(current.height) > max_dim {
            current = current.half();
            levels += 1;
        }
        (current, levels)
    }

    fn half(&self) -> RawImage {
        let nw = (self.width / 2).max(1);
        let nh = (self.height / 2).max(1);
        let c = self.components as usize;
        let mut out = vec![0u8; nw as usize * nh as usize * c];

        for y in 0..nh as usize {
            for x in 0..nw as usize {
                for ch in 0..c {
                    let mut sum = 0u32;
                    let mut n = 0u32;
                    for dy in 0..2 {
                        for dx in 0..2 {
                            let sx = x * 2 + dx;
                            let sy = y * 2 + dy;
                            if sx < self.width as usize && sy < self.height as usize {
                                sum += self.pixels[(sy * self.width as usize + sx) * c + ch] as u32;
                                n += 1;
                            }
                        }
                    }
                    out[(y * nw as usize + x) * c + ch] = (sum / n.max(1)) as u8;
                }
            }
        }

        RawImage {
            width: nw,
            height: nh,
            components: self.components,
            pixels: out,
        }
    }
}

impl fmt::Debug for RawImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("components", &self.components)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// Result of one fetch + decode step
#[derive(Debug, Clone)]
pub struct DecodedImage {
    /// Primary colour data
    pub raw: Arc<RawImage>,

    /// Auxiliary channel (e.g. a separate alpha mask), if the asset has one
    pub aux: Option<Arc<RawImage>>,

    /// Discard level `raw` was decoded at
    pub discard: u8,

    /// Width of the full resolution image
    pub full_width: u32,

    /// Height of the full resolution image
    pub full_height: u32,
}

impl DecodedImage {
    /// Wrap a raw image that was decoded at `discard` from a full-size source
    pub fn new(raw: RawImage, discard: u8, full_width: u32, full_height: u32) -> Self {
        Self {
            raw: Arc::new(raw),
            aux: None,
            discard,
            full_width,
            full_height,
        }
    }

    /// Attach auxiliary data
    pub fn with_aux(mut self, aux: RawImage) -> Self {
        self.aux = Some(Arc::new(aux));
        self
    }

    /// Bytes held in RAM by this decode (primary plus auxiliary)
    pub fn byte_size(&self) -> usize {
        self.raw.byte_size() + self.aux.as_ref().map(|a| a.byte_size()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_texture_id_validity() {
        assert!(!TextureId::nil().is_valid());
        assert!(TextureId::new_random().is_valid());
        assert_eq!(TextureId::from_name("ui/button.png"), TextureId::from_name("ui/button.png"));
        assert_ne!(TextureId::from_name("a"), TextureId::from_name("b"));
    }

    #[test]
    fn test_texture_id_parse() {
        let id: TextureId = "8dcd4a48-2d37-4909-9f78-f7a9eb4ef903".parse().unwrap();
        assert_eq!(id.to_string(), "8dcd4a48-2d37-4909-9f78-f7a9eb4ef903");
        assert!("not-a-uuid".parse::<TextureId>().is_err());
    }

    #[test]
    fn test_dimension_at_discard() {
        assert_eq!(dimension_at_discard(1024, 0), 1024);
        assert_eq!(dimension_at_discard(1024, 2), 256);
        assert_eq!(dimension_at_discard(3, 5), 1);
    }

    #[test]
    fn test_bytes_at_discard() {
        assert_eq!(bytes_at_discard(256, 256, 4, 0, false), 256 * 256 * 4);
        assert_eq!(bytes_at_discard(256, 256, 4, 1, false), 128 * 128 * 4);
        assert_eq!(bytes_at_discard(64, 64, 3, 0, true), 64 * 64 * 3 + 64 * 64);
    }

    #[test]
    fn test_raw_image_rejects_bad_buffer() {
        assert!(RawImage::new(4, 4, 4, vec![0; 64]).is_some());
        assert!(RawImage::new(4, 4, 4, vec![0; 63]).is_none());
        assert!(RawImage::new(0, 4, 4, vec![]).is_none());
        assert!(RawImage::new(1, 1, 5, vec![0; 5]).is_none());
    }

    #[test]
    fn test_downsample_averages() {
        let img = RawImage::new(2, 2, 1, vec![0, 100, 200, 100]).unwrap();
        let (small, levels) = img.downsample_to(1);
        assert_eq!(levels, 1);
        assert_eq!((small.width, small.height), (1, 1));
        assert_eq!(small.pixels, vec![100]);
    }

    #[test]
    fn test_downsample_noop_when_small() {
        let img = RawImage::solid(32, 16, 4, 7);
        let (same, levels) = img.downsample_to(64);
        assert_eq!(levels, 0);
        assert_eq!(same, img);
    }

    #[test]
    fn test_downsample_non_square() {
        let img = RawImage::solid(256, 64, 3, 9);
        let (small, levels) = img.downsample_to(64);
        assert_eq!(levels, 2);
        assert_eq!((small.width, small.height), (64, 16));
        assert!(small.pixels.iter().all(|&p| p == 9));
    }
}
