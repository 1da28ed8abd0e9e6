//! The streaming texture list
//!
//! [`TextureList`] owns the registry, the GPU residency tracker, the fetch
//! scheduler and the queues between them. The main loop calls
//! [`TextureList::update_images`] once per frame with a time budget; the
//! pass runs these stages in order and stops entering new ones once the
//! budget is spent:
//!
//! 0. GPU sync: destroy textures released during the previous frame
//! 1. Stats refresh: fold render-stage visibility into records
//! 2. Priority recompute: build and sort the request batch under the
//!    current memory pressure
//! 3. Admission walk: delete, decrease or admit increases in rank order
//! 4. Create: drain fetch completions and upload decoded images
//! 5. Fetch service: issue fetches for admitted increases
//! 6. Fast cache: load cached low-resolution copies into the create queue
//!
//! Fetch results always arrive through a channel and are consumed in a
//! later pass, never inside the call that issued the fetch.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use texstream_cache::{
    DecodedImage, FastCache, GpuResidency, GpuResidencyStats, GpuTexture, MemoryProbe, PressureClass,
    StreamingConfig, TextureId, TrackedMemory, MAX_DISCARD_LEVEL,
};
use texstream_scheduler::{
    Clock, ComparatorPolicy, FetchCompletion, FetchError, FetchRequest, FetchScheduler, FetchSchedulerStats,
    FetchType, FetchWorkerPool, FrameBudget, InlineFetcher, RequestBatch, RequestDescriptor, RequestTally,
    RetryPolicy, StageTimer, SystemClock, TextureSource, WorkerPoolConfig,
};
use tracing::{debug, info, trace, warn};

use crate::admission::{self, Admission, AdmissionTarget, WalkReport};
use crate::callback::{CallbackTable, ImageLoaded};
use crate::descriptor::{self, DescriptorContext};
use crate::error::{TextureError, TextureResult};
use crate::registry::{Removal, TextureHandle, TextureRegistry};
use crate::texture::{BoostLevel, ImageRequest, ListKind, LoadState, TextureRecord, TextureStats};
use crate::upload::{HeadlessUploader, TextureUploader};

/// Where a queued decode came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CreateOrigin {
    Fetch,
    FastCache,
    Preload,
}

/// Decoded image waiting for upload
#[derive(Debug)]
pub(crate) struct PendingCreate {
    pub handle: TextureHandle,
    pub image: DecodedImage,
    pub origin: CreateOrigin,
}

/// Wall time spent in each stage of one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageTimes {
    pub gpu_sync: Duration,
    pub stats: Duration,
    pub priority: Duration,
    pub admission: Duration,
    pub create: Duration,
    pub fetch: Duration,
    pub fast_cache: Duration,
}

/// What one [`TextureList::update_images`] pass did
#[derive(Debug, Clone, Default)]
pub struct UpdateReport {
    pub pressure: PressureClass,
    /// Entries in the request batch
    pub batch_len: usize,
    pub admission: WalkReport,
    /// Memory moved by admission decisions
    pub tally: RequestTally,
    pub completions: usize,
    /// Completions for deleted records or superseded fetches
    pub stale_completions: usize,
    pub uploads: usize,
    /// Decodes thrown away instead of uploaded
    pub dropped_decodes: usize,
    pub fetches_issued: usize,
    pub fast_cache_reads: usize,
    /// GPU textures destroyed at the sync point
    pub releases: usize,
    /// Stages not entered because the budget ran out
    pub stages_skipped: usize,
    pub stage_times: StageTimes,
    pub elapsed: Duration,
}

/// What a texture should be drawn with right now
#[derive(Debug)]
pub enum DisplayTexture<'a> {
    Resident(&'a GpuTexture),
    /// Permanent failure; draw the fallback texture
    Fallback,
    /// Nothing usable yet
    Loading,
}

/// Running totals since the list was created
#[derive(Debug, Clone, Copy, Default)]
struct ListCounters {
    frames: u64,
    uploads: u64,
    deletions: u64,
    fetches_issued: u64,
    fetch_failures: u64,
    transient_failures: u64,
    fast_cache_reads: u64,
    dropped_decodes: u64,
    stale_completions: u64,
}

/// Snapshot of the list for monitoring
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListStats {
    pub textures: usize,
    pub pending: usize,
    pub fetching: usize,
    pub decoded: usize,
    pub resident: usize,
    pub missing: usize,
    pub pressure: PressureClass,
    pub ram_used: usize,
    pub ram_limit: usize,
    pub vram_used: usize,
    pub vram_limit: usize,
    pub fetch_queue: usize,
    pub fetches_outstanding: u64,
    pub create_queue: usize,
    pub fast_cache_queue: usize,
    pub fast_cache_entries: usize,
    pub callbacks_pending: usize,
    pub frames: u64,
    pub uploads: u64,
    pub deletions: u64,
    pub fetches_issued: u64,
    pub fetch_failures: u64,
    pub transient_failures: u64,
    pub fast_cache_reads: u64,
    pub dropped_decodes: u64,
    pub stale_completions: u64,
}

/// One line of [`TextureList::dump`]
#[derive(Debug, Clone, Serialize)]
pub struct TextureSummary {
    pub id: TextureId,
    pub kind: ListKind,
    pub state: LoadState,
    pub boost: BoostLevel,
    pub resident_discard: Option<u8>,
    pub desired_discard: u8,
    pub requested_discard: Option<u8>,
    pub on_screen: bool,
    pub virtual_size: f32,
    pub vram_bytes: usize,
    pub refs: u32,
}

impl From<&TextureRecord> for TextureSummary {
    fn from(record: &TextureRecord) -> Self {
        Self {
            id: record.id,
            kind: record.kind,
            state: record.state,
            boost: record.boost,
            resident_discard: record.resident_discard,
            desired_discard: record.desired_discard,
            requested_discard: record.requested_discard,
            on_screen: record.on_screen,
            virtual_size: record.virtual_size,
            vram_bytes: record.vram_bytes,
            refs: record.ref_count(),
        }
    }
}

enum FetchIssue {
    Issued,
    /// Not issuable yet; stays queued
    Deferred,
    /// Nothing to fetch; leaves the queue
    Skipped,
}

/// Streaming texture list
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use texstream_cache::{DecodedImage, RawImage, StreamingConfig, TextureId};
/// use texstream_core::{ImageRequest, TextureList};
/// use texstream_scheduler::{CancellationToken, FetchError, FetchRequest};
///
/// fn source(request: &FetchRequest, _: &CancellationToken) -> Result<DecodedImage, FetchError> {
///     Ok(DecodedImage::new(RawImage::solid(8, 8, 4, 0), request.discard, 256, 256))
/// }
///
/// let mut list = TextureList::new(StreamingConfig::default().with_fast_cache(false)).unwrap();
/// list.init().unwrap();
/// let fetcher = list.inline_fetcher(Arc::new(source));
///
/// let handle = list.get_image(ImageRequest::new(TextureId::from_name("rock"))).unwrap();
/// list.update_images(Duration::from_secs(1));
/// fetcher.run_all();
/// list.update_images(Duration::from_secs(1));
///
/// assert!(list.texture(handle).unwrap().resident_discard.is_some());
/// ```
pub struct TextureList {
    pub(crate) config: StreamingConfig,
    pub(crate) registry: TextureRegistry,
    gpu: GpuResidency<TextureHandle>,
    uploader: Box<dyn TextureUploader>,
    scheduler: Arc<FetchScheduler>,
    completion_tx: Sender<FetchCompletion>,
    completion_rx: Receiver<FetchCompletion>,
    workers: Option<FetchWorkerPool>,
    pub(crate) fast_cache: Option<FastCache>,
    memory: Arc<TrackedMemory>,
    probe: Option<Arc<dyn MemoryProbe>>,
    pub(crate) clock: Arc<dyn Clock>,
    batch: RequestBatch<TextureHandle>,
    tally: RequestTally,
    pub(crate) create_queue: VecDeque<PendingCreate>,
    pub(crate) create_queue_bytes: usize,
    fetch_queue: VecDeque<TextureHandle>,
    fast_cache_queue: VecDeque<TextureHandle>,
    callbacks: CallbackTable,
    callbacks_ready: Vec<TextureHandle>,
    pressure: PressureClass,
    pub(crate) initialized: bool,
    counters: ListCounters,
}

impl TextureList {
    /// Create a list; call [`init`](Self::init) before requesting images
    pub fn new(config: StreamingConfig) -> TextureResult<Self> {
        config.validate()?;
        let (completion_tx, completion_rx) = crossbeam_channel::unbounded();
        let memory = Arc::new(TrackedMemory::new(config.ram_budget_bytes(), config.vram_budget_bytes()));
        Ok(Self {
            config,
            registry: TextureRegistry::new(),
            gpu: GpuResidency::new(),
            uploader: Box::new(HeadlessUploader::new()),
            scheduler: Arc::new(FetchScheduler::new()),
            completion_tx,
            completion_rx,
            workers: None,
            fast_cache: None,
            memory,
            probe: None,
            clock: Arc::new(SystemClock::new()),
            batch: RequestBatch::new(),
            tally: RequestTally::default(),
            create_queue: VecDeque::new(),
            create_queue_bytes: 0,
            fetch_queue: VecDeque::new(),
            fast_cache_queue: VecDeque::new(),
            callbacks: CallbackTable::new(),
            callbacks_ready: Vec::new(),
            pressure: PressureClass::Normal,
            initialized: false,
            counters: ListCounters::default(),
        })
    }

    /// Use another time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Upload through a real graphics backend
    pub fn with_uploader(mut self, uploader: Box<dyn TextureUploader>) -> Self {
        self.uploader = uploader;
        self
    }

    /// Read memory headroom from `probe` instead of the list's own accounting
    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Open the fast cache and start accepting requests
    pub fn init(&mut self) -> TextureResult<()> {
        if self.initialized {
            return Ok(());
        }
        if self.config.fast_cache_enabled {
            let cache = FastCache::new(&self.config.fast_cache_dir, self.config.fast_cache_bytes())
                .map_err(TextureError::FastCache)?;
            let entries = cache.load_existing().map_err(TextureError::FastCache)?;
            info!(dir = %self.config.fast_cache_dir.display(), entries, "fast cache opened");
            self.fast_cache = Some(cache);
        }
        self.initialized = true;
        info!(
            ram_mb = self.config.ram_budget_mb,
            vram_mb = self.config.vram_budget_mb,
            "texture list initialized"
        );
        Ok(())
    }

    /// Cancel all work, fail pending callbacks and release every texture
    pub fn shutdown(&mut self) {
        let cancelled = self.scheduler.cancel_all();
        if let Some(workers) = self.workers.take() {
            workers.shutdown();
        }
        while self.completion_rx.try_recv().is_ok() {}

        for handle in self.callbacks.handles() {
            let id = self.registry.get(handle).map(|r| r.id).unwrap_or_else(TextureId::nil);
            self.callbacks.on_failed(handle, id);
        }
        self.callbacks_ready.clear();

        self.gpu.schedule_release_all();
        for texture in self.gpu.sync() {
            self.uploader.release(texture);
        }
        let textures = self.registry.clear().len();
        self.create_queue.clear();
        self.create_queue_bytes = 0;
        self.fetch_queue.clear();
        self.fast_cache_queue.clear();
        self.batch.clear();
        self.sync_memory();
        self.initialized = false;
        info!(textures, cancelled, "texture list shut down");
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.config.max_retries,
            backoff: self.config.retry_backoff(),
        }
    }

    /// Run fetches on a pool of worker threads
    pub fn start_fetch_workers(&mut self, source: Arc<dyn TextureSource>) -> TextureResult<()> {
        if !self.initialized {
            return Err(TextureError::NotInitialized);
        }
        if let Some(old) = self.workers.take() {
            old.shutdown();
        }
        let config = WorkerPoolConfig::new(self.config.fetch_workers).with_retry(self.retry_policy());
        let pool = FetchWorkerPool::start(Arc::clone(&self.scheduler), source, self.completion_tx.clone(), config)?;
        self.workers = Some(pool);
        Ok(())
    }

    /// Fetcher that runs queued jobs on the caller's thread
    pub fn inline_fetcher(&self, source: Arc<dyn TextureSource>) -> InlineFetcher {
        InlineFetcher::new(Arc::clone(&self.scheduler), source, self.completion_tx.clone())
            .with_retry(RetryPolicy::immediate(self.config.max_retries))
    }

    // ---- image access ----

    /// Handle for a texture, creating its record on first request
    ///
    /// Returns `None` for nil identities or before [`init`](Self::init).
    pub fn get_image(&mut self, request: ImageRequest) -> Option<TextureHandle> {
        self.create_record(&request, true).map(|(handle, _)| handle)
    }

    /// Request a texture served by a particular host
    pub fn get_image_from_host(&mut self, id: TextureId, fetch_type: FetchType, host: &str) -> Option<TextureHandle> {
        self.get_image(ImageRequest::new(id).fetch_type(fetch_type).host(host))
    }

    pub(crate) fn create_record(&mut self, request: &ImageRequest, enqueue: bool) -> Option<(TextureHandle, bool)> {
        if !self.initialized {
            warn!(texture_id = %request.id, "image requested before init");
            return None;
        }
        let now = self.clock.now();
        let (handle, created) = match self.registry.create(request, now) {
            Ok(found) => found,
            Err(error) => {
                warn!(%error, "rejected image request");
                return None;
            }
        };

        if created {
            if enqueue {
                let cached = self.fast_cache.as_ref().is_some_and(|cache| cache.contains(request.id));
                if cached {
                    self.mark_queued(handle);
                    self.fast_cache_queue.push_back(handle);
                } else {
                    self.queue_fetch(handle);
                }
                trace!(texture_id = %request.id, kind = ?request.list_kind, cached, "texture created");
            }
            return Some((handle, true));
        }

        let mut requeue = false;
        if let Some(record) = self.registry.get_mut(handle) {
            record.last_referenced = now;
            if request.boost > record.boost {
                record.boost = request.boost;
            }
            if record.is_missing() {
                let desired = if record.boost.pins_full_resolution() { 0 } else { MAX_DISCARD_LEVEL };
                record.state = if record.resident_discard.is_some() { LoadState::Resident } else { LoadState::Pending };
                record.fallback_bound = false;
                record.failure_count = 0;
                record.retry_after = None;
                record.desired_discard = desired;
                record.requested_discard = Some(desired);
                requeue = enqueue;
                debug!(texture_id = %record.id, "re-requesting missing texture");
            }
        }
        if requeue {
            self.queue_fetch(handle);
        }
        Some((handle, false))
    }

    /// Look up a texture without creating it
    pub fn find_image(&self, id: TextureId, kind: ListKind) -> Option<TextureHandle> {
        self.registry.find(id, kind)
    }

    /// All list kinds of a texture, `Standard` first
    pub fn find_textures_by_id(&self, id: TextureId) -> Vec<TextureHandle> {
        self.registry.find_all(id)
    }

    pub fn texture(&self, handle: TextureHandle) -> Option<&TextureRecord> {
        self.registry.get(handle)
    }

    /// Report render-stage visibility for the next pass
    ///
    /// Several reports in one frame are merged.
    pub fn add_texture_stats(&mut self, handle: TextureHandle, stats: TextureStats) -> TextureResult<()> {
        if !stats.is_valid() {
            return Err(TextureError::InvalidStats(stats.virtual_size));
        }
        let record = self.registry.get_mut(handle).ok_or(TextureError::StaleHandle(handle))?;
        match record.frame_stats.as_mut() {
            Some(existing) => existing.merge(stats),
            None => record.frame_stats = Some(stats),
        }
        Ok(())
    }

    /// Be told about decode steps until `min_discard` or finer is resident
    ///
    /// The callback holds a reference on the record until its final call.
    pub fn set_loaded_callback<F>(
        &mut self,
        handle: TextureHandle,
        min_discard: u8,
        keep_raw: bool,
        callback: F,
    ) -> TextureResult<()>
    where
        F: FnMut(&ImageLoaded) + Send + 'static,
    {
        self.registry.add_callback_ref(handle)?;
        self.callbacks.add(handle, min_discard, keep_raw, Box::new(callback));
        let settled = self
            .registry
            .get(handle)
            .is_some_and(|r| r.is_missing() || r.resident_discard.is_some_and(|d| d <= min_discard));
        if settled {
            self.callbacks_ready.push(handle);
        }
        Ok(())
    }

    /// Add a UI reference
    pub fn retain(&mut self, handle: TextureHandle) -> TextureResult<()> {
        self.registry.retain_ui(handle)?;
        let now = self.clock.now();
        if let Some(record) = self.registry.get_mut(handle) {
            record.last_referenced = now;
        }
        Ok(())
    }

    /// Drop a UI reference
    pub fn release(&mut self, handle: TextureHandle) -> TextureResult<()> {
        if let Some(record) = self.registry.release_ui(handle)? {
            self.retire(handle, record);
        }
        Ok(())
    }

    /// Remove a texture now, or as soon as nothing references it
    ///
    /// Returns true if the record is already gone.
    pub fn remove_image(&mut self, handle: TextureHandle) -> TextureResult<bool> {
        match self.registry.remove(handle) {
            Removal::Removed(record) => {
                self.retire(handle, *record);
                Ok(true)
            }
            Removal::Deferred => Ok(false),
            Removal::Stale => Err(TextureError::StaleHandle(handle)),
        }
    }

    /// What to draw for `handle`
    pub fn display_texture(&mut self, handle: TextureHandle) -> TextureResult<DisplayTexture<'_>> {
        let record = self.registry.get(handle).ok_or(TextureError::StaleHandle(handle))?;
        if record.resident_discard.is_some() {
            if let Some(texture) = self.gpu.get(handle) {
                return Ok(DisplayTexture::Resident(texture));
            }
        }
        if record.fallback_bound {
            Ok(DisplayTexture::Fallback)
        } else {
            Ok(DisplayTexture::Loading)
        }
    }

    // ---- per-frame pass ----

    /// Run one streaming pass within `max_time`
    pub fn update_images(&mut self, max_time: Duration) -> UpdateReport {
        let mut budget = FrameBudget::start(Arc::clone(&self.clock), max_time);
        let now = budget.now();
        let mut report = UpdateReport::default();
        self.counters.frames += 1;

        let timer = StageTimer::start(&budget);
        report.releases = self.sync_gpu();
        self.sync_memory();
        report.stage_times.gpu_sync = timer.finish(&budget);

        if enter_stage(&budget, &mut report) {
            let timer = StageTimer::start(&budget);
            for (_, record) in self.registry.iter_mut() {
                descriptor::roll_stats(record, now);
            }
            report.stage_times.stats = timer.finish(&budget);
        }

        if enter_stage(&budget, &mut report) {
            let timer = StageTimer::start(&budget);
            report.batch_len = self.rebuild_batch(now);
            report.stage_times.priority = timer.finish(&budget);
        }

        if enter_stage(&budget, &mut report) {
            let timer = StageTimer::start(&budget);
            report.admission = self.admit(&mut budget);
            report.tally = self.tally;
            report.stage_times.admission = timer.finish(&budget);
        }

        if enter_stage(&budget, &mut report) {
            let timer = StageTimer::start(&budget);
            self.settle_ready_callbacks();
            self.drain_completions(now, &mut report);
            self.create_from_decoded(&mut budget, &mut report);
            report.stage_times.create = timer.finish(&budget);
        }

        if enter_stage(&budget, &mut report) {
            let timer = StageTimer::start(&budget);
            self.service_fetches(&mut budget, now, &mut report);
            report.stage_times.fetch = timer.finish(&budget);
        }

        if enter_stage(&budget, &mut report) {
            let timer = StageTimer::start(&budget);
            self.load_fast_cache(&mut budget, &mut report);
            report.stage_times.fast_cache = timer.finish(&budget);
        }

        self.sync_memory();
        report.pressure = self.pressure;
        report.elapsed = budget.elapsed();

        debug!(
            elapsed_us = report.elapsed.as_micros() as u64,
            batch = report.batch_len,
            processed = report.admission.processed,
            uploads = report.uploads,
            fetches = report.fetches_issued,
            skipped = report.stages_skipped,
            admission_us = report.stage_times.admission.as_micros() as u64,
            create_us = report.stage_times.create.as_micros() as u64,
            pressure = ?report.pressure,
            "update_images"
        );
        report
    }

    fn sync_gpu(&mut self) -> usize {
        let released = self.gpu.sync();
        let count = released.len();
        for texture in released {
            self.uploader.release(texture);
        }
        count
    }

    fn sync_memory(&self) {
        self.memory.vram.set_usage(self.gpu.vram_used());
        self.memory.ram.set_usage(self.create_queue_bytes);
    }

    fn probe(&self) -> &dyn MemoryProbe {
        match &self.probe {
            Some(probe) => probe.as_ref(),
            None => self.memory.as_ref(),
        }
    }

    fn descriptor_context(&self, now: Duration) -> DescriptorContext {
        DescriptorContext {
            now,
            retention: self.config.retention(),
            offscreen_downgrade: self.config.offscreen_downgrade(),
            max_texture_vram: self.config.max_texture_vram_bytes(),
        }
    }

    /// Stage 2: returns the batch length
    fn rebuild_batch(&mut self, now: Duration) -> usize {
        let ctx = self.descriptor_context(now);
        self.batch.clear();

        let mut in_flight = 0usize;
        for (handle, record) in self.registry.iter_mut() {
            if record.pending_fetch.is_some() {
                if let Some(requested) = record.requested_discard {
                    in_flight += record.vram_at(requested).saturating_sub(record.vram_bytes);
                }
            }
            let desc = descriptor::build(record, &ctx);
            self.batch.push(desc, handle);
        }

        let headroom = self.probe().headroom().with_pending(0, in_flight);
        let pressure = PressureClass::from_headroom(&headroom, &self.config.thresholds());
        if pressure != self.pressure {
            debug!(
                from = ?self.pressure,
                to = ?pressure,
                vram_utilization = headroom.vram_utilization(),
                ram_utilization = headroom.ram_utilization(),
                "memory pressure changed"
            );
            self.pressure = pressure;
        }
        self.batch.sort(ComparatorPolicy::from(pressure));
        self.batch.len()
    }

    /// Stage 3
    fn admit(&mut self, budget: &mut FrameBudget) -> WalkReport {
        let policy = ComparatorPolicy::from(self.pressure);
        let allowance = match policy {
            ComparatorPolicy::Normal => usize::MAX,
            ComparatorPolicy::AllowIncreases => self.config.increase_allowance_bytes(),
            ComparatorPolicy::DropIncreases => 0,
        };
        self.tally.reset();

        let batch = std::mem::take(&mut self.batch);
        let report = admission::walk(&batch, policy, allowance, budget, &mut Admit { list: self });
        self.batch = batch;
        report
    }

    fn mark_queued(&mut self, handle: TextureHandle) {
        if let Some(record) = self.registry.get_mut(handle) {
            record.fetch_queued = true;
        }
    }

    /// Put a record on the fetch queue unless it is already waiting
    fn queue_fetch(&mut self, handle: TextureHandle) {
        if let Some(record) = self.registry.get_mut(handle) {
            if !record.fetch_queued {
                record.fetch_queued = true;
                self.fetch_queue.push_back(handle);
            }
        }
    }

    fn delete(&mut self, handle: TextureHandle) {
        if let Removal::Removed(record) = self.registry.remove(handle) {
            self.retire(handle, *record);
        }
    }

    /// Release everything a removed record still held
    pub(crate) fn retire(&mut self, handle: TextureHandle, mut record: TextureRecord) {
        if let Some(job_id) = record.cancel_fetch() {
            self.scheduler.cancel(job_id);
        }
        let freed = self.gpu.schedule_release(handle);
        self.tally.record_deletion(record.ram_bytes, freed);
        self.counters.deletions += 1;
        trace!(texture_id = %record.id, vram = freed, "texture deleted");
    }

    /// Lower resident detail to `to`, dropping any finer fetch in flight
    fn decrease(&mut self, handle: TextureHandle, to: u8) {
        let Some(record) = self.registry.get_mut(handle) else {
            return;
        };
        if record.pending_fetch.is_some() && record.requested_discard.is_some_and(|r| r < to) {
            if let Some(job_id) = record.cancel_fetch() {
                self.scheduler.cancel(job_id);
            }
            record.state = if record.resident_discard.is_some() { LoadState::Resident } else { LoadState::Pending };
        }
        record.requested_discard = Some(to);

        let Some(resident) = record.resident_discard else {
            return;
        };
        if resident >= to {
            return;
        }
        let result = match self.gpu.peek(handle) {
            Some(current) => self.uploader.downscale(record.id, current, record.full_size_or_default(), to, record.mipmap),
            None => return,
        };
        match result {
            Ok(texture) => {
                let before = record.vram_bytes;
                record.vram_bytes = texture.vram_size();
                record.resident_discard = Some(to);
                self.tally.record_decrease(0, before.saturating_sub(record.vram_bytes));
                self.gpu.insert(handle, texture);
                trace!(texture_id = %record.id, from = resident, to, "texture scaled down");
            }
            Err(error) => warn!(texture_id = %record.id, %error, "scale down failed"),
        }
    }

    fn admit_increase(&mut self, handle: TextureHandle, to: u8, cost: usize) {
        let Some(record) = self.registry.get_mut(handle) else {
            return;
        };
        if record.is_missing() {
            return;
        }
        let waiting = record.pending_fetch.is_some() || record.fetch_queued || record.state == LoadState::Decoded;
        if waiting && record.requested_discard.is_some_and(|r| r <= to) {
            return;
        }
        record.requested_discard = Some(to);
        self.tally.record_increase(0, cost);
        self.queue_fetch(handle);
    }

    /// Fire callbacks registered after their texture had already settled
    fn settle_ready_callbacks(&mut self) {
        for handle in std::mem::take(&mut self.callbacks_ready) {
            let Some(record) = self.registry.get(handle) else {
                continue;
            };
            let id = record.id;
            let finished = if record.is_missing() {
                self.callbacks.on_failed(handle, id)
            } else if let Some(discard) = record.resident_discard {
                self.callbacks.on_resident(handle, id, discard)
            } else {
                0
            };
            self.release_callbacks(handle, finished);
        }
    }

    fn release_callbacks(&mut self, handle: TextureHandle, finished: u32) {
        if finished == 0 {
            return;
        }
        if let Some(record) = self.registry.release_callback_refs(handle, finished) {
            self.retire(handle, record);
        }
    }

    fn drain_completions(&mut self, now: Duration, report: &mut UpdateReport) {
        while let Ok(completion) = self.completion_rx.try_recv() {
            report.completions += 1;
            self.handle_completion(completion, now, report);
        }
    }

    fn handle_completion(&mut self, completion: FetchCompletion, now: Duration, report: &mut UpdateReport) {
        let handle = TextureHandle::from_owner(completion.request.owner);
        let record = match self.registry.get_mut(handle) {
            Some(record) if record.pending_fetch == Some(completion.job_id) => record,
            _ => {
                trace!(texture_id = %completion.request.texture_id, job_id = completion.job_id, "stale completion");
                report.stale_completions += 1;
                self.counters.stale_completions += 1;
                return;
            }
        };
        record.pending_fetch = None;
        record.fetch_token = None;

        match completion.result {
            Ok(image) => {
                let bytes = image.byte_size();
                record.state = LoadState::Decoded;
                record.failure_count = 0;
                record.retry_after = None;
                record.ram_bytes += bytes;
                self.create_queue_bytes += bytes;
                self.create_queue.push_back(PendingCreate {
                    handle,
                    image,
                    origin: CreateOrigin::Fetch,
                });
            }
            Err(FetchError::Transient(reason)) => {
                record.failure_count += 1;
                let shift = record.failure_count.saturating_sub(1).min(6);
                let backoff = self.config.retry_backoff().saturating_mul(1 << shift);
                record.retry_after = Some(now + backoff);
                record.state = if record.resident_discard.is_some() { LoadState::Resident } else { LoadState::Pending };
                debug!(
                    texture_id = %record.id,
                    failures = record.failure_count,
                    backoff_ms = backoff.as_millis() as u64,
                    %reason,
                    "fetch failed, will retry"
                );
                self.counters.transient_failures += 1;
                self.queue_fetch(handle);
            }
            Err(error) => {
                warn!(
                    texture_id = %record.id,
                    %error,
                    attempts = completion.attempts,
                    "texture fetch failed permanently"
                );
                record.state = LoadState::Missing;
                record.fallback_bound = true;
                record.requested_discard = record.resident_discard;
                let id = record.id;
                self.counters.fetch_failures += 1;
                let finished = self.callbacks.on_failed(handle, id);
                self.release_callbacks(handle, finished);
            }
        }
    }

    /// Stage 4 after the channel is drained: upload queued decodes
    fn create_from_decoded(&mut self, budget: &mut FrameBudget, report: &mut UpdateReport) {
        while let Some(pending) = self.create_queue.pop_front() {
            self.create_queue_bytes = self.create_queue_bytes.saturating_sub(pending.image.byte_size());
            self.create_texture(pending, report);
            if budget.should_yield() {
                break;
            }
        }
    }

    fn create_texture(&mut self, pending: PendingCreate, report: &mut UpdateReport) {
        let PendingCreate { handle, image, origin } = pending;
        let Some(record) = self.registry.get_mut(handle) else {
            return;
        };
        record.ram_bytes = record.ram_bytes.saturating_sub(image.byte_size());
        let idle_state = if record.resident_discard.is_some() { LoadState::Resident } else { LoadState::Pending };

        let finer = record.resident_discard.map_or(true, |resident| image.discard < resident);
        if !finer {
            record.state = idle_state;
            report.dropped_decodes += 1;
            self.counters.dropped_decodes += 1;
            return;
        }
        if self.pressure == PressureClass::LowVramDropIncrease && origin != CreateOrigin::Preload {
            trace!(texture_id = %record.id, discard = image.discard, "dropping decode under memory pressure");
            record.state = LoadState::Pending;
            record.requested_discard = record.resident_discard;
            report.dropped_decodes += 1;
            self.counters.dropped_decodes += 1;
            return;
        }

        let texture = match self.uploader.upload(record.id, &image, record.mipmap) {
            Ok(texture) => texture,
            Err(error) => {
                warn!(texture_id = %record.id, %error, "texture upload failed");
                record.state = idle_state;
                return;
            }
        };
        record.vram_bytes = texture.vram_size();
        record.resident_discard = Some(image.discard);
        record.full_size = Some((image.full_width, image.full_height));
        record.components = image.raw.components;
        record.state = LoadState::Resident;
        record.fallback_bound = false;
        trace!(texture_id = %record.id, discard = image.discard, vram = record.vram_bytes, "texture uploaded");
        self.gpu.insert(handle, texture);

        let id = record.id;
        let wants_more = record.pending_fetch.is_none() && record.requested_discard.is_some_and(|r| r < image.discard);
        report.uploads += 1;
        self.counters.uploads += 1;

        if wants_more {
            self.queue_fetch(handle);
        }
        if origin == CreateOrigin::Fetch {
            self.write_back(id, &image);
        }
        let finished = self.callbacks.on_decoded(handle, id, &image);
        self.release_callbacks(handle, finished);
    }

    fn write_back(&self, id: TextureId, image: &DecodedImage) {
        let Some(cache) = &self.fast_cache else {
            return;
        };
        if let Err(error) = cache.put_downsampled(id, image, self.config.fast_cache_max_dimension) {
            warn!(texture_id = %id, %error, "fast cache write failed");
        }
    }

    /// Stage 5
    fn service_fetches(&mut self, budget: &mut FrameBudget, now: Duration, report: &mut UpdateReport) {
        let outstanding = self.scheduler.stats().outstanding() as usize;
        let mut slots = self.config.max_concurrent_fetches.saturating_sub(outstanding);
        let mut deferred = Vec::new();
        let mut remaining = self.fetch_queue.len();

        while slots > 0 && remaining > 0 {
            remaining -= 1;
            let Some(handle) = self.fetch_queue.pop_front() else {
                break;
            };
            match self.issue_fetch(handle, now) {
                FetchIssue::Issued => {
                    slots -= 1;
                    report.fetches_issued += 1;
                }
                FetchIssue::Deferred => deferred.push(handle),
                FetchIssue::Skipped => {}
            }
            if budget.should_yield() {
                break;
            }
        }
        self.fetch_queue.extend(deferred);
    }

    fn issue_fetch(&mut self, handle: TextureHandle, now: Duration) -> FetchIssue {
        let Some(record) = self.registry.get_mut(handle) else {
            return FetchIssue::Skipped;
        };
        let requested = match record.requested_discard {
            Some(requested) if !record.is_missing() && record.pending_fetch.is_none() => requested,
            _ => {
                record.fetch_queued = false;
                return FetchIssue::Skipped;
            }
        };
        if record.resident_discard.is_some_and(|resident| resident <= requested) {
            record.fetch_queued = false;
            return FetchIssue::Skipped;
        }
        if record.retry_after.is_some_and(|at| at > now) || self.pressure == PressureClass::LowVramDropIncrease {
            return FetchIssue::Deferred;
        }

        record.fetch_queued = false;
        let request = FetchRequest {
            texture_id: record.id,
            owner: handle.to_owner(),
            discard: requested,
            fetch_type: record.fetch_type,
            host: record.host.clone(),
        };
        let priority = record.fetch_priority();
        let (job_id, token) = self.scheduler.submit(priority, request);
        record.pending_fetch = Some(job_id);
        record.fetch_token = Some(token);
        record.state = LoadState::Fetching;
        trace!(texture_id = %record.id, job_id, discard = requested, ?priority, "fetch issued");
        self.counters.fetches_issued += 1;
        FetchIssue::Issued
    }

    /// Stage 6
    fn load_fast_cache(&mut self, budget: &mut FrameBudget, report: &mut UpdateReport) {
        let Some(cache) = self.fast_cache.clone() else {
            // cache disabled after records were routed to it
            for handle in std::mem::take(&mut self.fast_cache_queue) {
                self.requeue_for_network(handle);
            }
            return;
        };

        let mut reads = 0;
        while reads < self.config.max_fast_cache_reads {
            let Some(handle) = self.fast_cache_queue.pop_front() else {
                break;
            };
            let Some(record) = self.registry.get(handle) else {
                continue;
            };
            let id = record.id;
            reads += 1;

            match cache.get(id) {
                Ok(Some(image)) => {
                    let bytes = image.byte_size();
                    if let Some(record) = self.registry.get_mut(handle) {
                        record.fetch_queued = false;
                        record.ram_bytes += bytes;
                        record.state = LoadState::Decoded;
                    }
                    self.create_queue_bytes += bytes;
                    self.create_queue.push_back(PendingCreate {
                        handle,
                        image,
                        origin: CreateOrigin::FastCache,
                    });
                }
                Ok(None) => self.requeue_for_network(handle),
                Err(error) => {
                    warn!(texture_id = %id, %error, "fast cache read failed");
                    self.requeue_for_network(handle);
                }
            }
            if budget.should_yield() {
                break;
            }
        }

        report.fast_cache_reads += reads;
        self.counters.fast_cache_reads += reads as u64;
    }

    fn requeue_for_network(&mut self, handle: TextureHandle) {
        if let Some(record) = self.registry.get_mut(handle) {
            record.fetch_queued = false;
        }
        self.queue_fetch(handle);
    }

    // ---- maintenance ----

    /// Rank and admit one texture now instead of waiting for the next pass
    pub fn force_immediate_update(&mut self, handle: TextureHandle) -> TextureResult<()> {
        let now = self.clock.now();
        let ctx = self.descriptor_context(now);
        let record = self.registry.get_mut(handle).ok_or(TextureError::StaleHandle(handle))?;
        descriptor::roll_stats(record, now);
        let desc = descriptor::build(record, &ctx);

        if desc.scale_down || desc.is_decrease() {
            self.decrease(handle, desc.desired_discard);
        } else if desc.is_increase() && !record.is_missing() {
            record.requested_discard = Some(desc.desired_discard);
            if record.pending_fetch.is_none() {
                record.fetch_queued = true;
                self.fetch_queue.retain(|queued| *queued != handle);
                self.fetch_queue.push_front(handle);
            }
        }
        Ok(())
    }

    /// Drive fetches and uploads until nothing is outstanding or `max_time` runs out
    ///
    /// Ignores per-frame limits other than `max_concurrent_fetches`. Returns
    /// the number of uploads.
    pub fn decode_all_images(&mut self, max_time: Duration) -> usize {
        let deadline = FrameBudget::start(Arc::clone(&self.clock), max_time);
        let mut unbounded = FrameBudget::start(Arc::clone(&self.clock), Duration::MAX);
        let mut report = UpdateReport::default();

        loop {
            let now = self.clock.now();
            self.settle_ready_callbacks();
            self.drain_completions(now, &mut report);
            self.create_from_decoded(&mut unbounded, &mut report);
            self.service_fetches(&mut unbounded, now, &mut report);
            self.load_fast_cache(&mut unbounded, &mut report);

            let outstanding = self.scheduler.stats().outstanding();
            let queued = !self.create_queue.is_empty() || !self.fast_cache_queue.is_empty() || !self.completion_rx.is_empty();
            if (outstanding == 0 && !queued) || deadline.is_exceeded() {
                break;
            }
            if !queued {
                if self.workers.is_none() {
                    // nothing runs the queued jobs
                    break;
                }
                if let Ok(completion) = self.completion_rx.recv_timeout(Duration::from_millis(5)) {
                    report.completions += 1;
                    self.handle_completion(completion, now, &mut report);
                }
            }
        }

        self.sync_memory();
        debug!(uploads = report.uploads, completions = report.completions, "decode_all_images");
        report.uploads
    }

    /// Cancel every fetch in flight; records fall back to what is resident
    pub fn clear_fetching_requests(&mut self) -> usize {
        self.scheduler.cancel_all();
        let mut cleared = 0;
        for (_, record) in self.registry.iter_mut() {
            if record.cancel_fetch().is_some() {
                cleared += 1;
                record.state = if record.resident_discard.is_some() { LoadState::Resident } else { LoadState::Pending };
                record.requested_discard = record.resident_discard;
            }
        }
        for handle in std::mem::take(&mut self.fetch_queue) {
            if let Some(record) = self.registry.get_mut(handle) {
                record.fetch_queued = false;
            }
        }
        info!(cleared, "cleared fetching requests");
        cleared
    }

    // ---- inspection ----

    /// Summaries of every record in slot order, also logged at debug level
    pub fn dump(&self) -> Vec<TextureSummary> {
        let summaries: Vec<TextureSummary> = self.registry.iter().map(|(_, record)| record.into()).collect();
        info!(textures = summaries.len(), pressure = ?self.pressure, "texture list dump");
        for summary in &summaries {
            debug!(
                texture_id = %summary.id,
                state = ?summary.state,
                resident = ?summary.resident_discard,
                desired = summary.desired_discard,
                vram = summary.vram_bytes,
                "texture"
            );
        }
        summaries
    }

    pub fn stats(&self) -> ListStats {
        let mut stats = ListStats {
            textures: self.registry.len(),
            pressure: self.pressure,
            ram_used: self.memory.ram.current_usage(),
            ram_limit: self.memory.ram.limit(),
            vram_used: self.gpu.vram_used(),
            vram_limit: self.memory.vram.limit(),
            fetch_queue: self.fetch_queue.len(),
            fetches_outstanding: self.scheduler.stats().outstanding(),
            create_queue: self.create_queue.len(),
            fast_cache_queue: self.fast_cache_queue.len(),
            fast_cache_entries: self.fast_cache.as_ref().map_or(0, |cache| cache.len()),
            callbacks_pending: self.callbacks.len(),
            frames: self.counters.frames,
            uploads: self.counters.uploads,
            deletions: self.counters.deletions,
            fetches_issued: self.counters.fetches_issued,
            fetch_failures: self.counters.fetch_failures,
            transient_failures: self.counters.transient_failures,
            fast_cache_reads: self.counters.fast_cache_reads,
            dropped_decodes: self.counters.dropped_decodes,
            stale_completions: self.counters.stale_completions,
            ..ListStats::default()
        };
        for (_, record) in self.registry.iter() {
            match record.state {
                LoadState::Pending => stats.pending += 1,
                LoadState::Fetching => stats.fetching += 1,
                LoadState::Decoded => stats.decoded += 1,
                LoadState::Resident => stats.resident += 1,
                LoadState::Missing => stats.missing += 1,
            }
        }
        stats
    }

    pub fn pressure(&self) -> PressureClass {
        self.pressure
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn gpu_stats(&self) -> GpuResidencyStats {
        self.gpu.stats()
    }

    pub fn fetch_stats(&self) -> FetchSchedulerStats {
        self.scheduler.stats()
    }

    pub fn memory(&self) -> &TrackedMemory {
        &self.memory
    }

    pub fn fast_cache(&self) -> Option<&FastCache> {
        self.fast_cache.as_ref()
    }
}

fn enter_stage(budget: &FrameBudget, report: &mut UpdateReport) -> bool {
    if budget.is_exceeded() {
        report.stages_skipped += 1;
        false
    } else {
        true
    }
}

/// Applies admission decisions to the list
struct Admit<'a> {
    list: &'a mut TextureList,
}

impl AdmissionTarget<TextureHandle> for Admit<'_> {
    fn increase_cost(&self, handle: TextureHandle, desc: &RequestDescriptor) -> usize {
        let Some(record) = self.list.registry.get(handle) else {
            return 0;
        };
        let waiting = record.pending_fetch.is_some() || record.fetch_queued || record.state == LoadState::Decoded;
        if waiting && record.requested_discard.is_some_and(|r| r <= desc.desired_discard) {
            return 0;
        }
        record.vram_at(desc.desired_discard).saturating_sub(record.vram_bytes)
    }

    fn apply(&mut self, handle: TextureHandle, _desc: &RequestDescriptor, admission: Admission) {
        match admission {
            Admission::Delete => self.list.delete(handle),
            Admission::Decrease { to } => self.list.decrease(handle, to),
            Admission::Increase { to, cost } => self.list.admit_increase(handle, to, cost),
            Admission::Refused | Admission::Unchanged => {}
        }
    }
}
