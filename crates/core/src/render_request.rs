//! A request to materialize one image at one target size.

use crate::bucket::BucketId;
use crate::image::Size;
use std::fmt;
use std::time::Instant;

/// Render request identifier, unique per controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request#{}", self.0)
    }
}

/// Where a request is in its scheduling lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestState {
    /// Image size not known yet
    #[default]
    AwaitingSize,
    /// Waiting in the frame queue
    Queued,
    /// Currently being committed
    Processing,
    Rendered,
}

/// A render request
///
/// Holds only ids: the image is owned by the controller's cache and the
/// bucket by the controller's bucket table.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    id: RequestId,
    url: String,
    size: Size,
    bucket: BucketId,
    bytes_video: u64,
    paid_video_bytes: u64,
    state: RequestState,
    processing_started: Option<Instant>,
}

impl RenderRequest {
    pub fn new(id: RequestId, url: impl Into<String>, size: Size, bucket: BucketId, bytes_video: u64) -> Self {
        Self {
            id,
            url: url.into(),
            size,
            bucket,
            bytes_video,
            paid_video_bytes: 0,
            state: RequestState::AwaitingSize,
            processing_started: None,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn bucket(&self) -> BucketId {
        self.bucket
    }

    /// Video cost of this request's size
    pub fn bytes_video(&self) -> u64 {
        self.bytes_video
    }

    /// Recompute after the image's native size became known.
    pub fn set_bytes_video(&mut self, bytes: u64) {
        self.bytes_video = bytes;
    }

    /// What this request's commit was actually charged; zero until rendered
    pub fn paid_video_bytes(&self) -> u64 {
        self.paid_video_bytes
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn is_rendered(&self) -> bool {
        self.state == RequestState::Rendered
    }

    /// Mark as submitted to the frame queue.
    pub fn request(&mut self) {
        self.state = RequestState::Queued;
    }

    /// Called right before the commit starts.
    pub fn on_processing(&mut self, now: Instant) {
        self.state = RequestState::Processing;
        self.processing_started = Some(now);
    }

    /// When the current or last commit started
    pub fn processing_started(&self) -> Option<Instant> {
        self.processing_started
    }

    /// Called once the commit finished, with the bytes it paid.
    pub fn on_rendered(&mut self, paid_video_bytes: u64) {
        self.state = RequestState::Rendered;
        self.paid_video_bytes = paid_video_bytes;
    }
}
