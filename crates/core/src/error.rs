//! Error types for the texture list

use std::io;

use texstream_cache::{ConfigError, TextureId};

use crate::registry::TextureHandle;

/// Errors returned by the texture list
///
/// Fetch failures never show up here: they are absorbed into the record's
/// load state.
#[derive(Debug, thiserror::Error)]
pub enum TextureError {
    /// Nil or otherwise unusable texture identity
    #[error("invalid texture id: {0}")]
    InvalidIdentity(TextureId),

    /// Render-stage statistics that cannot be ranked
    #[error("invalid texture stats: virtual size {0}")]
    InvalidStats(f32),

    /// Handle to a record that no longer exists
    #[error("stale texture handle: {0:?}")]
    StaleHandle(TextureHandle),

    /// Operation needs `init()` first
    #[error("texture list is not initialized")]
    NotInitialized,

    /// Fast cache could not be opened or scanned
    #[error("fast cache error: {0}")]
    FastCache(#[source] io::Error),

    /// Prefetch list could not be encoded or decoded
    #[error("prefetch list error: {0}")]
    PrefetchList(#[from] serde_json::Error),

    /// Filesystem or thread spawn failure
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Rejected configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result alias for texture list operations
pub type TextureResult<T> = Result<T, TextureError>;
