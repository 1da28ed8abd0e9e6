//! Fetch requests, completions and the texture source seam
//!
//! Workers turn a [`FetchRequest`] into a [`FetchCompletion`] by calling a
//! [`TextureSource`], which hides transport and decoding.

use texstream_cache::{DecodedImage, TextureId};

use crate::cancel::CancellationToken;
use crate::priority::FetchJobId;

/// Where a texture comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FetchType {
    /// Asset service
    #[default]
    Default,
    /// Server-side avatar bake
    ServerBake,
    /// Bake served by a specific host
    HostBake,
    /// World map tile
    MapTile,
    /// File on the local machine
    LocalFile,
}

/// One fetch + decode unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Texture to fetch
    pub texture_id: TextureId,
    /// Opaque handle of the requesting record, echoed back on completion
    pub owner: u64,
    /// Discard level to decode to
    pub discard: u8,
    /// Source kind
    pub fetch_type: FetchType,
    /// Host to fetch from, if the source needs one
    pub host: Option<String>,
}

/// Why a fetch failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Network hiccup or overloaded server; worth retrying
    #[error("transient fetch failure: {0}")]
    Transient(String),
    /// The asset does not exist
    #[error("texture not found")]
    NotFound,
    /// The data arrived but could not be decoded
    #[error("decode failed: {0}")]
    Decode(String),
}

impl FetchError {
    /// Permanent failures are never retried automatically
    pub fn is_permanent(&self) -> bool {
        !matches!(self, FetchError::Transient(_))
    }
}

/// Result of one fetch job, delivered to the main loop over a channel
#[derive(Debug, Clone)]
pub struct FetchCompletion {
    /// Job that produced this result
    pub job_id: FetchJobId,
    /// The request as submitted
    pub request: FetchRequest,
    /// Decoded data or the final error
    pub result: Result<DecodedImage, FetchError>,
    /// Attempts made, including retries
    pub attempts: u32,
}

/// Fetch + decode backend
///
/// Called from worker threads. Implementations should check the token
/// during long transfers and bail out early once it is cancelled.
pub trait TextureSource: Send + Sync {
    /// Fetch and decode `request.texture_id` at `request.discard`
    fn fetch(&self, request: &FetchRequest, cancel: &CancellationToken) -> Result<DecodedImage, FetchError>;
}

impl<F> TextureSource for F
where
    F: Fn(&FetchRequest, &CancellationToken) -> Result<DecodedImage, FetchError> + Send + Sync,
{
    fn fetch(&self, request: &FetchRequest, cancel: &CancellationToken) -> Result<DecodedImage, FetchError> {
        self(request, cancel)
    }
}
