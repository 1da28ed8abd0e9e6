//! Texture streaming scheduler library
//!
//! Frame budgets, request ranking and the fetch pipeline.
//!
//! Each frame the streaming pass builds one [`RequestDescriptor`] per live
//! texture, sorts them in a [`RequestBatch`] under the [`ComparatorPolicy`]
//! chosen for the current memory pressure, and walks the result until its
//! [`FrameBudget`] runs out. Admitted fetches go to a [`FetchScheduler`],
//! ordered by [`FetchPriority`] and executed by a [`FetchWorkerPool`] (or an
//! [`InlineFetcher`] in tests).
//!
//! # Example
//!
//! ```
//! use texstream_cache::TextureId;
//! use texstream_scheduler::{FetchPriority, FetchRequest, FetchScheduler, FetchType};
//!
//! let scheduler = FetchScheduler::new();
//! let (job_id, token) = scheduler.submit(FetchPriority::Immediate, FetchRequest {
//!     texture_id: TextureId::new_random(),
//!     owner: 0,
//!     discard: 0,
//!     fetch_type: FetchType::Default,
//!     host: None,
//! });
//!
//! // Deleting the texture cancels the fetch
//! scheduler.cancel(job_id);
//! assert!(token.is_cancelled());
//! ```

pub mod frame_budget;
pub mod request;

mod cancel;
mod fetch;
mod priority;
mod scheduler;
mod worker;

pub use cancel::{CancellationRegistry, CancellationToken};
pub use fetch::{FetchCompletion, FetchError, FetchRequest, FetchType, TextureSource};
pub use frame_budget::{Clock, FrameBudget, ManualClock, StageTimer, SystemClock};
pub use priority::{FetchJob, FetchJobId, FetchPriority, FetchQueue};
pub use request::{ComparatorPolicy, RankKey, RequestBatch, RequestDescriptor, RequestTally, NO_DISCARD, PIXEL_CHANGE_MAX};
pub use scheduler::{FetchScheduler, FetchSchedulerStats};
pub use worker::{run_job, FetchWorkerPool, InlineFetcher, RetryPolicy, WorkerPoolConfig};
