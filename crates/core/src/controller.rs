//! The cache controller.
//!
//! [`Controller`] owns every image, render request and bucket, the RAM and
//! video accountants, the network admission queue and the frame queue, and
//! wires them together:
//!
//! - loader finished: charge RAM with the payload size, defer the decode probe
//! - size decoded: charge RAM with the uncompressed size, schedule waiters
//! - request committed: charge video with the bytes the commit paid
//! - request removed: release the bytes it paid
//!
//! Any charge that overflows its budget triggers eviction in cache insertion
//! order, skipping anything a locked bucket references. Whatever eviction
//! cannot recover is reported as a [`ControllerEvent::RamOverflow`] or
//! [`ControllerEvent::VideoOverflow`]; overflow is never an error.
//!
//! The controller is single-threaded and does no I/O. Transport callbacks are
//! fed in through [`Controller::handle_transport`], and time only advances
//! through [`Controller::poll`], which also resolves deferred decodes.

use crate::bucket::{Bucket, BucketEvent, BucketId};
use crate::commit::{CommitJob, NullCommit, RenderCommit};
use crate::decode::{DecodeError, DecodeProbe, HeaderProbe, ImageInfo};
use crate::error::{CacheError, CacheResult, LoadError};
use crate::events::{EventBus, SubscriptionId};
use crate::image::{Image, ImageProps, Size};
use crate::loader::{LoaderEvent, LoaderState};
use crate::render_request::{RenderRequest, RequestId};
use crate::transport::{Transport, TransportError, TransportEvent};
use imagekeep_cache::{CacheConfig, MemoryAccountant};
use imagekeep_scheduler::{
    Admission, Dispatch, FrameEvent, FrameQueue, FrameQueueStats, Network, NetworkStats, Removal,
};
use indexmap::{IndexMap, IndexSet};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Controller-level events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// RAM stayed over budget after eviction; `bytes` is the unrecovered part
    RamOverflow { bytes: u64 },
    /// Video stayed over budget after eviction; `bytes` is the unrecovered part
    VideoOverflow { bytes: u64 },
    ImageAdded { url: String },
    ImageRemoved { url: String },
    /// `bytes` is the request's nominal video cost
    RenderRequestAdded {
        url: String,
        request: RequestId,
        bytes: u64,
    },
    /// `bytes` is what the request had paid and has now been released
    RenderRequestRemoved {
        url: String,
        request: RequestId,
        bytes: u64,
    },
}

/// Controller statistics
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ControllerStats {
    /// Image lookups served from the cache
    pub hits: u64,

    /// Image lookups that created a new image
    pub misses: u64,

    /// Images evicted to recover RAM
    pub images_evicted: u64,

    /// Render requests evicted to recover video memory
    pub requests_evicted: u64,

    pub ram_overflows: u64,
    pub video_overflows: u64,

    /// Loaders that failed after exhausting retries
    pub load_errors: u64,

    pub decode_errors: u64,

    /// Completed commits
    pub commits: u64,

    pub network: NetworkStats,
    pub frames: FrameQueueStats,
}

impl ControllerStats {
    /// Fraction of image lookups served from the cache
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// External collaborators the controller drives
pub struct Collaborators {
    pub transport: Box<dyn Transport>,
    pub probe: Box<dyn DecodeProbe>,
    pub commit: Box<dyn RenderCommit>,
}

impl Collaborators {
    /// Use `transport` with the header probe and a headless commit
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            transport: Box::new(transport),
            probe: Box::new(HeaderProbe),
            commit: Box::new(NullCommit),
        }
    }

    pub fn with_probe(mut self, probe: impl DecodeProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn with_commit(mut self, commit: impl RenderCommit + 'static) -> Self {
        self.commit = Box::new(commit);
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Owner of the image cache and everything that feeds it
///
/// # Example
///
/// ```
/// use imagekeep_cache::{CacheConfig, Units};
/// use imagekeep_core::{Collaborators, Controller, FetchRequest, ImageProps, Size, Transport};
///
/// struct Offline;
///
/// impl Transport for Offline {
///     fn fetch(&mut self, _request: &FetchRequest) {}
///     fn abort(&mut self, _url: &str) {}
/// }
///
/// let config = CacheConfig::new(64, 128, Units::Mb);
/// let mut controller = Controller::new(config, Collaborators::new(Offline)).unwrap();
///
/// let gallery = controller.create_bucket("gallery");
/// let request = controller
///     .create_request(gallery, "https://example.com/a.png", Size::new(320, 240), &ImageProps::default())
///     .unwrap();
///
/// assert!(controller.image("https://example.com/a.png").is_some());
/// assert!(!controller.request(request).unwrap().is_rendered());
/// ```
pub struct Controller {
    config: CacheConfig,
    cache: IndexMap<String, Image>,
    requests: IndexMap<RequestId, RenderRequest>,
    buckets: IndexMap<BucketId, Bucket>,
    ram: MemoryAccountant,
    video: MemoryAccountant,
    network: Network<String>,
    frames: FrameQueue<RequestId>,
    transport: Box<dyn Transport>,
    probe: Box<dyn DecodeProbe>,
    commit: Box<dyn RenderCommit>,
    pending_decodes: VecDeque<String>,
    events: EventBus<ControllerEvent>,
    stats: ControllerStats,
    clock: Instant,
    next_request: u64,
    next_bucket: u64,
}

impl Controller {
    /// Create a controller after validating `config`
    pub fn new(config: CacheConfig, collaborators: Collaborators) -> CacheResult<Self> {
        config.validate()?;

        let ram = MemoryAccountant::new("ram", config.ram_budget, config.units);
        let video = MemoryAccountant::new("video", config.video_budget, config.units);
        info!(
            ram_budget = ram.budget(),
            video_budget = video.budget(),
            max_loaders = config.max_loaders,
            hw_rank = config.hw_rank,
            gpu_data_full = config.gpu_data_full,
            "image cache created"
        );

        Ok(Self {
            network: Network::new(config.max_loaders),
            frames: FrameQueue::new(config.hw_rank),
            config,
            cache: IndexMap::new(),
            requests: IndexMap::new(),
            buckets: IndexMap::new(),
            ram,
            video,
            transport: collaborators.transport,
            probe: collaborators.probe,
            commit: collaborators.commit,
            pending_decodes: VecDeque::new(),
            events: EventBus::new(),
            stats: ControllerStats::default(),
            clock: Instant::now(),
            next_request: 0,
            next_bucket: 0,
        })
    }

    // ------------------------------------------------------------------
    // Images
    // ------------------------------------------------------------------

    /// Get the cached image for `url`, creating it and admitting its loader
    /// on a miss.
    ///
    /// `props` only apply when the image is created.
    pub fn get_image(&mut self, url: &str, props: &ImageProps) -> &Image {
        if self.cache.contains_key(url) {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
            let options = props.loader_options(
                self.config.retry,
                Duration::from_millis(self.config.timeout_ms),
            );
            let image = Image::new(url, props, options, self.config.gpu_data_full);
            self.cache.insert(url.to_string(), image);
            debug!(url, cached = self.cache.len(), "image created");
            self.events.emit(&ControllerEvent::ImageAdded {
                url: url.to_string(),
            });
            self.admit(url);
        }
        &self.cache[url]
    }

    /// Whether any bucket referencing the image through a request is locked
    pub fn is_image_locked(&self, url: &str) -> bool {
        self.cache
            .get(url)
            .is_some_and(|image| image.requests().any(|id| self.is_request_locked(id)))
    }

    fn admit(&mut self, url: &str) {
        match self.network.add(url.to_string()) {
            Admission::Started => self.start_loader(url),
            Admission::Queued | Admission::Duplicate => {}
        }
    }

    fn start_loader(&mut self, url: &str) {
        if let Some(image) = self.cache.get_mut(url) {
            image.loader_mut().load(self.transport.as_mut());
        }
    }

    fn start_loaders(&mut self, urls: Vec<String>) {
        for url in urls {
            self.start_loader(&url);
        }
    }

    /// Clear an image's requests, release its loader and drop it from the
    /// cache. RAM accounting is the caller's concern.
    ///
    /// Returns the queued URLs promoted into the freed transfer slot. They
    /// are not started here.
    #[must_use]
    fn remove_image(&mut self, url: &str) -> Vec<String> {
        let Some(image) = self.cache.get(url) else {
            return Vec::new();
        };
        let request_ids: Vec<RequestId> = image.requests().collect();
        for id in request_ids {
            self.clear_request_inner(id);
        }

        let key = url.to_string();
        let mut promoted = Vec::new();
        if self.network.remove(&key) == Removal::AbortInFlight {
            if let Some(image) = self.cache.get_mut(url) {
                image.loader_mut().abort(self.transport.as_mut());
            }
            promoted = self.network.finish(&key);
        }
        self.pending_decodes.retain(|pending| pending != url);

        if let Some(mut image) = self.cache.shift_remove(url) {
            image.clear();
        }
        debug!(url, cached = self.cache.len(), "image removed");
        self.events.emit(&ControllerEvent::ImageRemoved { url: key });
        promoted
    }

    // ------------------------------------------------------------------
    // Buckets and requests
    // ------------------------------------------------------------------

    /// Create an empty, unlocked bucket
    pub fn create_bucket(&mut self, name: impl Into<String>) -> BucketId {
        let id = BucketId::new(self.next_bucket);
        self.next_bucket += 1;
        let bucket = Bucket::new(id, name);
        debug!(bucket = %id, name = bucket.name(), "bucket created");
        self.buckets.insert(id, bucket);
        id
    }

    /// Request `url` at `size` on behalf of `bucket`.
    ///
    /// The image is taken from the cache or created. The request is scheduled
    /// for commit as soon as the image's size is known.
    pub fn create_request(
        &mut self,
        bucket: BucketId,
        url: &str,
        size: Size,
        props: &ImageProps,
    ) -> CacheResult<RequestId> {
        if !self.buckets.contains_key(&bucket) {
            return Err(CacheError::UnknownBucket(bucket));
        }

        self.get_image(url, props);
        let id = RequestId::new(self.next_request);
        self.next_request += 1;

        let image = self
            .cache
            .get_mut(url)
            .ok_or(CacheError::UnknownRequest(id))?;
        let bytes_video = image.bytes_video(size);
        image.register_request(id);
        let got_size = image.got_size();
        let loading = image.loader().is_loading();
        let restart = image.loader().state() == LoaderState::Aborted;
        let failure = image_failure(image);
        if !got_size && failure.is_none() {
            image.wait_for_size(id);
        }

        self.requests
            .insert(id, RenderRequest::new(id, url, size, bucket, bytes_video));
        if let Some(owner) = self.buckets.get_mut(&bucket) {
            owner.add_request(id);
            if loading {
                owner.on_loadstart();
            }
            if let Some(error) = failure {
                owner.on_error(url, error);
            }
        }
        debug!(request = %id, bucket = %bucket, url, bytes_video, "render request created");
        self.events.emit(&ControllerEvent::RenderRequestAdded {
            url: url.to_string(),
            request: id,
            bytes: bytes_video,
        });

        if restart {
            self.admit(url);
        }
        self.refresh_bucket(bucket);
        if got_size {
            self.schedule(id);
        }
        Ok(id)
    }

    /// Detach a render request from its image and bucket
    pub fn clear_request(&mut self, id: RequestId) -> CacheResult<()> {
        if !self.requests.contains_key(&id) {
            return Err(CacheError::UnknownRequest(id));
        }
        self.clear_request_inner(id);
        Ok(())
    }

    fn clear_request_inner(&mut self, id: RequestId) {
        let Some(request) = self.requests.shift_remove(&id) else {
            return;
        };
        let paid = request.paid_video_bytes();

        // A commit already in progress keeps its slot and completes into nothing
        self.frames.remove(&id);
        if let Some(image) = self.cache.get_mut(request.url()) {
            image.unregister_request(id);
        }
        if let Some(bucket) = self.buckets.get_mut(&request.bucket()) {
            bucket.remove_request(id);
        }
        self.video.remove_bytes(paid);

        debug!(request = %id, url = request.url(), paid, "render request cleared");
        self.events.emit(&ControllerEvent::RenderRequestRemoved {
            url: request.url().to_string(),
            request: id,
            bytes: paid,
        });
        self.refresh_bucket(request.bucket());
    }

    /// Whether the request's owning bucket is locked
    pub fn is_request_locked(&self, id: RequestId) -> bool {
        self.requests
            .get(&id)
            .and_then(|request| self.buckets.get(&request.bucket()))
            .is_some_and(Bucket::is_locked)
    }

    /// Protect (or stop protecting) a bucket's members from eviction
    pub fn set_locked(&mut self, bucket: BucketId, locked: bool) -> CacheResult<()> {
        let owner = self
            .buckets
            .get_mut(&bucket)
            .ok_or(CacheError::UnknownBucket(bucket))?;
        if owner.set_locked(locked) {
            debug!(bucket = %bucket, locked, "bucket lock changed");
            owner.on_update();
        }
        Ok(())
    }

    /// Clear every request in the bucket; the bucket itself stays
    pub fn clear_bucket(&mut self, bucket: BucketId) -> CacheResult<()> {
        let members: Vec<RequestId> = self
            .buckets
            .get(&bucket)
            .ok_or(CacheError::UnknownBucket(bucket))?
            .requests()
            .collect();
        for id in members {
            self.clear_request_inner(id);
        }
        if let Some(owner) = self.buckets.get_mut(&bucket) {
            owner.on_cleared();
        }
        info!(bucket = %bucket, "bucket cleared");
        Ok(())
    }

    /// Clear the bucket and forget it. Its images stay cached.
    pub fn remove_bucket(&mut self, bucket: BucketId) -> CacheResult<()> {
        self.clear_bucket(bucket)?;
        self.buckets.shift_remove(&bucket);
        Ok(())
    }

    /// Sum of RAM bytes over the bucket's distinct images
    pub fn bucket_ram_bytes(&self, bucket: BucketId) -> Option<u64> {
        let urls = self.bucket_images(self.buckets.get(&bucket)?);
        Some(
            urls.iter()
                .filter_map(|url| self.cache.get(url.as_str()))
                .map(Image::bytes_ram)
                .sum(),
        )
    }

    /// Sum of video bytes paid by the bucket's requests
    pub fn bucket_video_bytes(&self, bucket: BucketId) -> Option<u64> {
        let owner = self.buckets.get(&bucket)?;
        Some(
            owner
                .requests()
                .filter_map(|id| self.requests.get(&id))
                .map(RenderRequest::paid_video_bytes)
                .sum(),
        )
    }

    fn bucket_images(&self, bucket: &Bucket) -> IndexSet<String> {
        bucket
            .requests()
            .filter_map(|id| self.requests.get(&id))
            .map(|request| request.url().to_string())
            .collect()
    }

    /// Distinct buckets holding requests for `url`
    fn buckets_of(&self, url: &str) -> IndexSet<BucketId> {
        self.cache
            .get(url)
            .map(|image| {
                image
                    .requests()
                    .filter_map(|id| self.requests.get(&id))
                    .map(RenderRequest::bucket)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn refresh_bucket(&mut self, bucket: BucketId) {
        self.refresh_load(bucket);
        self.refresh_render(bucket);
    }

    fn refresh_load(&mut self, bucket: BucketId) {
        let Some(owner) = self.buckets.get(&bucket) else {
            return;
        };
        let snapshot: Vec<(f64, bool)> = self
            .bucket_images(owner)
            .iter()
            .filter_map(|url| self.cache.get(url.as_str()))
            .map(|image| (image.load_progress(), image.is_loaded()))
            .collect();
        if let Some(owner) = self.buckets.get_mut(&bucket) {
            owner.update_load(&snapshot);
        }
    }

    fn refresh_render(&mut self, bucket: BucketId) {
        let Some(owner) = self.buckets.get(&bucket) else {
            return;
        };
        let total = owner.len();
        let rendered = owner
            .requests()
            .filter_map(|id| self.requests.get(&id))
            .filter(|request| request.is_rendered())
            .count();
        if let Some(owner) = self.buckets.get_mut(&bucket) {
            owner.update_render(rendered, total);
        }
    }

    // ------------------------------------------------------------------
    // Transport and decode
    // ------------------------------------------------------------------

    /// Feed a transport callback for `url` into its loader.
    ///
    /// Callbacks for URLs no longer cached are dropped.
    pub fn handle_transport(&mut self, url: &str, event: TransportEvent) {
        let events = match self.cache.get_mut(url) {
            Some(image) => image.loader_mut().handle(event, self.transport.as_mut()),
            None => {
                debug!(url, ?event, "transport event for uncached url dropped");
                return;
            }
        };
        for event in events {
            self.on_loader_event(url, event);
        }
    }

    fn on_loader_event(&mut self, url: &str, event: LoaderEvent) {
        match event {
            LoaderEvent::LoadStart => {
                for bucket in self.buckets_of(url) {
                    if let Some(owner) = self.buckets.get_mut(&bucket) {
                        owner.on_loadstart();
                    }
                }
            }
            LoaderEvent::Progress { .. } => {
                for bucket in self.buckets_of(url) {
                    self.refresh_load(bucket);
                }
            }
            LoaderEvent::LoadEnd { bytes } => {
                self.finish_transfer(url);
                if let Some(image) = self.cache.get_mut(url) {
                    image.on_loaded(bytes);
                }
                self.pending_decodes.push_back(url.to_string());
                for bucket in self.buckets_of(url) {
                    self.refresh_load(bucket);
                }
                // May evict this very image
                self.charge_ram(bytes);
            }
            LoaderEvent::Error {
                status,
                status_text,
            } => {
                self.finish_transfer(url);
                self.fail_image(
                    url,
                    LoadError::Transport(TransportError::Status {
                        status,
                        status_text,
                    }),
                );
            }
            LoaderEvent::Timeout => {
                self.finish_transfer(url);
                self.fail_image(url, LoadError::Transport(TransportError::Timeout));
            }
            LoaderEvent::Abort => {
                self.finish_transfer(url);
                for bucket in self.buckets_of(url) {
                    self.refresh_load(bucket);
                }
            }
            LoaderEvent::Retry { retries } => {
                debug!(url, retries, "image load retry");
            }
        }
    }

    fn finish_transfer(&mut self, url: &str) {
        let promoted = self.network.finish(&url.to_string());
        self.start_loaders(promoted);
    }

    fn fail_image(&mut self, url: &str, error: LoadError) {
        match &error {
            LoadError::Transport(_) => self.stats.load_errors += 1,
            LoadError::Decode(_) => self.stats.decode_errors += 1,
        }
        warn!(url, %error, "image failed");
        for bucket in self.buckets_of(url) {
            if let Some(owner) = self.buckets.get_mut(&bucket) {
                owner.on_error(url, error.clone());
            }
        }
    }

    /// Apply a decode probe result for `url`.
    ///
    /// [`poll`](Self::poll) calls this for payloads it probed itself; an
    /// embedder probing elsewhere can call it directly. Results for URLs no
    /// longer cached, or already sized, are dropped.
    pub fn handle_decoded(&mut self, url: &str, result: Result<ImageInfo, DecodeError>) {
        let Some(image) = self.cache.get_mut(url) else {
            return;
        };
        if image.got_size() {
            return;
        }

        match image.apply_decode(result) {
            Ok((uncompressed, waiters)) => {
                debug!(url, uncompressed, waiting = waiters.len(), "image size decoded");
                self.charge_ram(uncompressed);
                for id in waiters {
                    // Eviction during the charge may have cleared the waiter
                    if self.requests.contains_key(&id) {
                        self.schedule(id);
                    }
                }
            }
            Err(error) => self.fail_image(url, LoadError::Decode(error)),
        }
    }

    // ------------------------------------------------------------------
    // Commit scheduling
    // ------------------------------------------------------------------

    fn schedule(&mut self, id: RequestId) {
        let Some(request) = self.requests.get_mut(&id) else {
            return;
        };
        if let Some(image) = self.cache.get(request.url()) {
            request.set_bytes_video(image.bytes_video(request.size()));
        }
        request.request();
        let payload = request.bytes_video();

        if let Some(dispatch) = self.frames.add(id, payload, self.clock) {
            self.begin_commit(dispatch);
        }
    }

    fn begin_commit(&mut self, dispatch: Dispatch<RequestId>) {
        let Some(request) = self.requests.get_mut(&dispatch.item) else {
            return;
        };
        request.on_processing(dispatch.started_at);
        debug!(
            request = %dispatch.item,
            url = request.url(),
            render_time_us = dispatch.render_time.as_micros() as u64,
            "commit started"
        );
        self.commit.commit(&CommitJob {
            request: dispatch.item,
            url: request.url(),
            size: request.size(),
            render_time: dispatch.render_time,
        });
    }

    fn finish_commit(&mut self, id: RequestId) {
        let Some(request) = self.requests.get(&id) else {
            return;
        };
        let bytes = request.bytes_video();
        let bucket = request.bucket();
        let Some(image) = self.cache.get_mut(request.url()) else {
            return;
        };
        let paid = image.on_request_rendered(bytes);

        if let Some(request) = self.requests.get_mut(&id) {
            request.on_rendered(paid);
        }
        self.stats.commits += 1;
        debug!(request = %id, bytes, paid, "commit finished");

        self.refresh_render(bucket);
        self.charge_video(paid);
    }

    /// Advance the controller to `now`.
    ///
    /// Resolves deferred decode probes, then completes every commit whose
    /// render time has elapsed and starts the next ones.
    pub fn poll(&mut self, now: Instant) {
        self.clock = self.clock.max(now);

        while let Some(url) = self.pending_decodes.pop_front() {
            let result = match self.cache.get(&url).and_then(|image| image.loader().payload()) {
                Some(payload) => self.probe.probe(payload),
                None => continue,
            };
            self.handle_decoded(&url, result);
        }

        for event in self.frames.poll(self.clock) {
            match event {
                FrameEvent::Completed(id) => self.finish_commit(id),
                FrameEvent::Started(dispatch) => self.begin_commit(dispatch),
            }
        }
    }

    /// When the commit in progress will be ready, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        self.frames.next_deadline()
    }

    /// Whether decodes or commits are waiting for a `poll`
    pub fn has_pending_work(&self) -> bool {
        !self.pending_decodes.is_empty() || !self.frames.is_empty()
    }

    /// The controller's notion of the current time
    pub fn now(&self) -> Instant {
        self.clock
    }

    // ------------------------------------------------------------------
    // Accounting and eviction
    // ------------------------------------------------------------------

    /// Charge RAM, evicting on overflow
    pub fn charge_ram(&mut self, bytes: u64) {
        let charge = self.ram.add_bytes(bytes);
        let Some(overflow) = charge.overflow else {
            return;
        };

        let freed = self.evict_ram_bytes(overflow);
        if freed < overflow {
            let unrecovered = overflow - freed;
            self.stats.ram_overflows += 1;
            warn!(bytes, overflow, freed, unrecovered, "ram over budget");
            self.events
                .emit(&ControllerEvent::RamOverflow { bytes: unrecovered });
        }
    }

    /// Charge video memory, evicting on overflow
    pub fn charge_video(&mut self, bytes: u64) {
        let charge = self.video.add_bytes(bytes);
        let Some(overflow) = charge.overflow else {
            return;
        };

        let freed = self.evict_video_bytes(overflow);
        if freed < overflow {
            let unrecovered = overflow - freed;
            self.stats.video_overflows += 1;
            warn!(bytes, overflow, freed, unrecovered, "video over budget");
            self.events
                .emit(&ControllerEvent::VideoOverflow { bytes: unrecovered });
        }
    }

    /// Evict unlocked images, oldest first, until `bytes` of RAM are freed.
    ///
    /// Returns whether the target was met.
    pub fn evict_ram(&mut self, bytes: u64) -> bool {
        self.evict_ram_bytes(bytes) >= bytes
    }

    /// Evict unlocked render requests, oldest image first, until `bytes` of
    /// video memory are freed.
    ///
    /// Returns whether the target was met.
    pub fn evict_video(&mut self, bytes: u64) -> bool {
        self.evict_video_bytes(bytes) >= bytes
    }

    fn evict_ram_bytes(&mut self, bytes: u64) -> u64 {
        let mut freed = 0;
        let mut evicted = 0;
        let mut promoted = Vec::new();
        let candidates: Vec<String> = self.cache.keys().cloned().collect();

        for url in candidates {
            if freed >= bytes {
                break;
            }
            if self.is_image_locked(&url) {
                continue;
            }
            let Some(image) = self.cache.get(&url) else {
                continue;
            };
            let image_bytes = image.bytes_ram();
            self.ram.remove_bytes(image_bytes);
            freed += image_bytes;
            evicted += 1;
            promoted.extend(self.remove_image(&url));
        }

        // Promotions wait for the scan so evicted URLs are never fetched
        promoted.retain(|url| self.cache.contains_key(url));
        self.start_loaders(promoted);

        self.stats.images_evicted += evicted;
        info!(requested = bytes, freed, evicted, "ram eviction");
        freed
    }

    fn evict_video_bytes(&mut self, bytes: u64) -> u64 {
        let mut freed = 0;
        let mut evicted = 0;
        let candidates: Vec<RequestId> = self
            .cache
            .values()
            .flat_map(|image| image.requests())
            .collect();

        for id in candidates {
            if freed >= bytes {
                break;
            }
            if self.is_request_locked(id) {
                continue;
            }
            let Some(request) = self.requests.get(&id) else {
                continue;
            };
            freed += request.paid_video_bytes();
            evicted += 1;
            self.clear_request_inner(id);
        }

        self.stats.requests_evicted += evicted;
        info!(requested = bytes, freed, evicted, "video eviction");
        freed
    }

    // ------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------

    /// Stop starting new transfers; transfers in flight continue
    pub fn pause_network(&mut self) {
        self.network.pause();
    }

    /// Resume admission and start queued transfers up to capacity
    pub fn resume_network(&mut self) {
        let promoted = self.network.resume();
        self.start_loaders(promoted);
    }

    /// Change the concurrent transfer limit
    pub fn set_max_loaders(&mut self, max_loaders: usize) {
        self.config.max_loaders = max_loaders.max(1);
        let promoted = self.network.set_max_loaders(max_loaders);
        self.start_loaders(promoted);
    }

    /// Change the device capability factor for commits started afterwards
    pub fn set_hw_rank(&mut self, hw_rank: f64) {
        self.frames.set_hw_rank(hw_rank);
        self.config.hw_rank = self.frames.hw_rank();
    }

    /// Drop every image and request, abort transfers and reset both
    /// accountants. Buckets survive, empty.
    pub fn clear(&mut self) {
        for url in self.network.clear() {
            match self.cache.get_mut(&url) {
                Some(image) => {
                    image.loader_mut().abort(self.transport.as_mut());
                }
                None => self.transport.abort(&url),
            }
        }
        let urls: Vec<String> = self.cache.keys().cloned().collect();
        let count = urls.len();
        for url in urls {
            // The network is empty, so nothing is promoted
            let _ = self.remove_image(&url);
        }
        self.frames.reset();
        self.pending_decodes.clear();
        self.requests.clear();
        self.ram.clear();
        self.video.clear();
        for bucket in self.buckets.values_mut() {
            bucket.on_cleared();
        }
        info!(images = count, "image cache cleared");
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&ControllerEvent) + 'static,
    {
        self.events.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn subscribe_bucket<F>(&mut self, bucket: BucketId, listener: F) -> CacheResult<SubscriptionId>
    where
        F: FnMut(&BucketEvent) + 'static,
    {
        self.buckets
            .get_mut(&bucket)
            .map(|owner| owner.subscribe(listener))
            .ok_or(CacheError::UnknownBucket(bucket))
    }

    pub fn unsubscribe_bucket(&mut self, bucket: BucketId, id: SubscriptionId) -> bool {
        self.buckets
            .get_mut(&bucket)
            .is_some_and(|owner| owner.unsubscribe(id))
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn ram(&self) -> &MemoryAccountant {
        &self.ram
    }

    pub fn video(&self) -> &MemoryAccountant {
        &self.video
    }

    pub fn network(&self) -> &Network<String> {
        &self.network
    }

    pub fn frames(&self) -> &FrameQueue<RequestId> {
        &self.frames
    }

    pub fn image(&self, url: &str) -> Option<&Image> {
        self.cache.get(url)
    }

    /// Cached URLs in insertion order
    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.cache.keys().map(String::as_str)
    }

    pub fn contains(&self, url: &str) -> bool {
        self.cache.contains_key(url)
    }

    /// Number of cached images
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn request(&self, id: RequestId) -> Option<&RenderRequest> {
        self.requests.get(&id)
    }

    pub fn bucket(&self, id: BucketId) -> Option<&Bucket> {
        self.buckets.get(&id)
    }

    /// Get controller statistics
    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            network: self.network.stats(),
            frames: self.frames.stats(),
            ..self.stats
        }
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("images", &self.cache.len())
            .field("requests", &self.requests.len())
            .field("buckets", &self.buckets.len())
            .field("ram", &self.ram)
            .field("video", &self.video)
            .field("network", &self.network)
            .field("frames", &self.frames)
            .finish_non_exhaustive()
    }
}

/// The terminal failure a new request for `image` should be told about
fn image_failure(image: &Image) -> Option<LoadError> {
    if let Some(error) = image.decode_error() {
        return Some(LoadError::Decode(error.clone()));
    }
    match image.loader().state() {
        LoaderState::Errored | LoaderState::TimedOut => {
            image.loader().error().cloned().map(LoadError::Transport)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FetchRequest;
    use imagekeep_cache::Units;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Log {
        fetches: Vec<String>,
        aborts: Vec<String>,
    }

    #[derive(Clone, Default)]
    struct SharedTransport(Rc<RefCell<Log>>);

    impl Transport for SharedTransport {
        fn fetch(&mut self, request: &FetchRequest) {
            self.0.borrow_mut().fetches.push(request.url.clone());
        }

        fn abort(&mut self, url: &str) {
            self.0.borrow_mut().aborts.push(url.to_string());
        }
    }

    /// Reports every payload as a 10x10 image
    struct FixedProbe;

    impl DecodeProbe for FixedProbe {
        fn probe(&self, _payload: &[u8]) -> Result<ImageInfo, DecodeError> {
            Ok(ImageInfo {
                width: 10,
                height: 10,
                mime_type: "image/png".to_string(),
            })
        }
    }

    fn controller(config: CacheConfig) -> (Controller, Rc<RefCell<Log>>) {
        let transport = SharedTransport::default();
        let log = Rc::clone(&transport.0);
        let collaborators = Collaborators::new(transport).with_probe(FixedProbe);
        (Controller::new(config, collaborators).unwrap(), log)
    }

    fn deliver(controller: &mut Controller, url: &str, bytes: usize) {
        controller.handle_transport(url, TransportEvent::Start);
        controller.handle_transport(
            url,
            TransportEvent::Success {
                payload: vec![0; bytes],
            },
        );
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = CacheConfig::default().with_max_loaders(0);
        let result = Controller::new(config, Collaborators::new(SharedTransport::default()));
        assert!(matches!(result, Err(CacheError::Config(_))));
    }

    #[test]
    fn test_get_image_hit_and_miss() {
        let (mut controller, log) = controller(CacheConfig::default());

        controller.get_image("a", &ImageProps::default());
        controller.get_image("a", &ImageProps::default());

        let stats = controller.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.hit_rate(), 0.5);
        assert_eq!(log.borrow().fetches, vec!["a"]);
    }

    #[test]
    fn test_unknown_ids() {
        let (mut controller, _) = controller(CacheConfig::default());
        let missing = BucketId::new(99);

        assert!(matches!(
            controller.create_request(missing, "a", Size::new(1, 1), &ImageProps::default()),
            Err(CacheError::UnknownBucket(_))
        ));
        assert!(matches!(
            controller.clear_request(RequestId::new(5)),
            Err(CacheError::UnknownRequest(_))
        ));
        assert!(controller.set_locked(missing, true).is_err());
        assert!(controller.bucket_ram_bytes(missing).is_none());
    }

    #[test]
    fn test_load_decode_commit_flow() {
        let config = CacheConfig::new(1_000_000, 1_000_000, Units::Byte).with_hw_rank(1.0);
        let (mut controller, _) = controller(config);
        let bucket = controller.create_bucket("grid");
        let id = controller
            .create_request(bucket, "a", Size::new(5, 5), &ImageProps::default())
            .unwrap();

        deliver(&mut controller, "a", 1_000);
        assert_eq!(controller.ram().used_bytes(), 1_000);
        assert!(controller.has_pending_work());

        let now = controller.now();
        controller.poll(now);

        // 10x10 RGBA decoded, 5x5 RGBA committed
        assert_eq!(controller.ram().used_bytes(), 1_400);
        assert_eq!(controller.video().used_bytes(), 100);
        assert!(controller.request(id).unwrap().is_rendered());
        assert!(controller.bucket(bucket).unwrap().is_rendered());
        assert_eq!(controller.bucket_video_bytes(bucket), Some(100));
        assert_eq!(controller.bucket_ram_bytes(bucket), Some(1_400));
    }

    #[test]
    fn test_clear_request_releases_paid_video() {
        let config = CacheConfig::new(1_000_000, 1_000_000, Units::Byte).with_hw_rank(1.0);
        let (mut controller, _) = controller(config);
        let bucket = controller.create_bucket("grid");
        let id = controller
            .create_request(bucket, "a", Size::new(5, 5), &ImageProps::default())
            .unwrap();
        deliver(&mut controller, "a", 10);
        let now = controller.now();
        controller.poll(now);

        controller.clear_request(id).unwrap();

        assert_eq!(controller.video().used_bytes(), 0);
        assert!(controller.request(id).is_none());
        assert_eq!(controller.image("a").unwrap().request_count(), 0);
        // The image itself stays cached
        assert_eq!(controller.ram().used_bytes(), 410);
    }

    #[test]
    fn test_clear_resets_everything() {
        let (mut controller, log) = controller(CacheConfig::default());
        let bucket = controller.create_bucket("grid");
        controller
            .create_request(bucket, "a", Size::new(5, 5), &ImageProps::default())
            .unwrap();
        controller.handle_transport("a", TransportEvent::Start);

        controller.clear();

        assert!(controller.is_empty());
        assert_eq!(controller.ram().used_bytes(), 0);
        assert_eq!(controller.network().in_flight_len(), 0);
        assert_eq!(log.borrow().aborts, vec!["a"]);
        assert!(controller.bucket(bucket).unwrap().is_empty());
    }

    #[test]
    fn test_remove_bucket_keeps_images() {
        let (mut controller, _) = controller(CacheConfig::default());
        let bucket = controller.create_bucket("grid");
        controller
            .create_request(bucket, "a", Size::new(5, 5), &ImageProps::default())
            .unwrap();

        controller.remove_bucket(bucket).unwrap();

        assert!(controller.bucket(bucket).is_none());
        assert!(controller.contains("a"));
        assert!(matches!(
            controller.clear_bucket(bucket),
            Err(CacheError::UnknownBucket(_))
        ));
    }
}
