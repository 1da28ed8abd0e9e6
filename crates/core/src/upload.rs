//! GPU upload seam
//!
//! The texture list never talks to a graphics API directly. A
//! [`TextureUploader`] turns decoded images into [`GpuTexture`]s and
//! destroys them at sync points. [`HeadlessUploader`] keeps only the
//! bookkeeping and backs simulations and tests.

use texstream_cache::{bytes_at_discard, dimension_at_discard, DecodedImage, GpuTexture, TextureId};

/// A GPU upload that did not happen
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("upload failed: {0}")]
pub struct UploadError(pub String);

/// Creates and destroys GPU textures
pub trait TextureUploader: Send {
    /// Upload a decoded image
    fn upload(&mut self, id: TextureId, image: &DecodedImage, mipmap: bool) -> Result<GpuTexture, UploadError>;

    /// Build a coarser copy of a resident texture at `discard`
    fn downscale(
        &mut self,
        id: TextureId,
        current: &GpuTexture,
        full_size: (u32, u32),
        discard: u8,
        mipmap: bool,
    ) -> Result<GpuTexture, UploadError>;

    /// Destroy a texture handed back by a sync point
    fn release(&mut self, texture: GpuTexture);
}

/// Uploader without a GPU
///
/// Handles are sequential integers; VRAM sizes follow the usual estimate.
#[derive(Debug, Default)]
pub struct HeadlessUploader {
    next_handle: u64,
    uploads: u64,
    releases: u64,
}

impl HeadlessUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uploads(&self) -> u64 {
        self.uploads
    }

    pub fn releases(&self) -> u64 {
        self.releases
    }

    fn allocate(&mut self, width: u32, height: u32, components: u8, discard: u8, mipmap: bool) -> GpuTexture {
        self.next_handle += 1;
        self.uploads += 1;
        let size = bytes_at_discard(width, height, components, 0, mipmap);
        GpuTexture::new(self.next_handle, width, height, discard, size)
    }
}

impl TextureUploader for HeadlessUploader {
    fn upload(&mut self, _id: TextureId, image: &DecodedImage, mipmap: bool) -> Result<GpuTexture, UploadError> {
        let raw = &image.raw;
        if raw.width == 0 || raw.height == 0 {
            return Err(UploadError("empty image".into()));
        }
        Ok(self.allocate(raw.width, raw.height, raw.components, image.discard, mipmap))
    }

    fn downscale(
        &mut self,
        _id: TextureId,
        current: &GpuTexture,
        full_size: (u32, u32),
        discard: u8,
        mipmap: bool,
    ) -> Result<GpuTexture, UploadError> {
        let pixels = current.width as usize * current.height as usize;
        let components = if pixels == 0 { 4 } else { (current.vram_size() / pixels).clamp(1, 4) as u8 };
        let width = dimension_at_discard(full_size.0, discard);
        let height = dimension_at_discard(full_size.1, discard);
        Ok(self.allocate(width, height, components, discard, mipmap))
    }

    fn release(&mut self, _texture: GpuTexture) {
        self.releases += 1;
    }
}
