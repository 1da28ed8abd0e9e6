//! Texture streaming core library
//!
//! The [`TextureList`] decides, frame by frame, which textures get more
//! detail, which give detail back and which are deleted, while keeping the
//! work it does per frame inside a caller-supplied time budget.
//!
//! Records live in a [`TextureRegistry`] keyed by texture identity and list
//! kind. Each pass turns every record into a request descriptor, ranks the
//! batch according to memory pressure and admits changes in rank order
//! until the budget runs out. Fetches run off-thread; their results are
//! uploaded in a later pass through a [`TextureUploader`].

pub mod admission;
pub mod callback;
pub mod descriptor;
pub mod error;
pub mod preload;
pub mod registry;
pub mod texture;
pub mod texture_list;
pub mod upload;

pub use admission::{Admission, AdmissionTarget, WalkReport};
pub use callback::{CallbackTable, ImageLoaded, LoadedCallbackFn};
pub use descriptor::DescriptorContext;
pub use error::{TextureError, TextureResult};
pub use preload::{PrefetchEntry, PrefetchList, PREFETCH_LIST_VERSION};
pub use registry::{Removal, TextureHandle, TextureRegistry};
pub use texture::{
    BoostLevel, FormatHint, ImageRequest, ListKind, LoadState, TextureKey, TextureRecord, TextureStats, TextureType,
};
pub use texture_list::{DisplayTexture, ListStats, StageTimes, TextureList, TextureSummary, UpdateReport};
pub use upload::{HeadlessUploader, TextureUploader, UploadError};
