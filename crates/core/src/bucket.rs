//! Buckets: lockable consumer groups of render requests.
//!
//! A bucket aggregates the load and render status of its members and is the
//! unit of eviction protection: while `locked`, none of its requests or
//! their images may be evicted. Locking never blocks loading or rendering.
//!
//! The controller feeds member lifecycle changes in through
//! [`Bucket::on_loadstart`], [`Bucket::update_load`],
//! [`Bucket::update_render`] and [`Bucket::on_error`]; the bucket recomputes
//! its aggregates and emits [`BucketEvent`]s to its subscribers.

use crate::error::LoadError;
use crate::events::{Event, EventBus, SubscriptionId};
use crate::render_request::RequestId;
use indexmap::IndexSet;
use std::fmt;

/// Bucket identifier, unique per controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketId(u64);

impl BucketId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bucket#{}", self.0)
    }
}

/// What happened to a bucket
#[derive(Debug, Clone, PartialEq)]
pub enum BucketEventKind {
    /// Mean load progress over the member images changed
    Progress { progress: f64 },
    /// Every member image finished loading
    LoadEnd,
    /// A member image failed for good
    Error { url: String, error: LoadError },
    /// Every member request has been committed
    Rendered,
    RenderProgress { progress: f64 },
    /// Aggregates were recomputed after a membership or loadstart change
    Update,
    RenderRequestAdded { request: RequestId },
    RenderRequestRemoved { request: RequestId },
    /// The bucket was cleared or removed
    Clear,
}

/// Event record emitted by a bucket
pub type BucketEvent = Event<BucketId, BucketEventKind>;

/// A consumer group of render requests
#[derive(Debug)]
pub struct Bucket {
    id: BucketId,
    name: String,
    locked: bool,
    requests: IndexSet<RequestId>,
    loading: bool,
    loaded: bool,
    load_progress: f64,
    rendered: bool,
    render_progress: f64,
    events: EventBus<BucketEvent>,
}

impl Bucket {
    pub fn new(id: BucketId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            locked: false,
            requests: IndexSet::new(),
            loading: false,
            loaded: false,
            load_progress: 0.0,
            rendered: true,
            render_progress: 1.0,
            events: EventBus::new(),
        }
    }

    pub fn id(&self) -> BucketId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the bucket currently protects its members from eviction
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Returns `true` if the flag changed.
    pub fn set_locked(&mut self, locked: bool) -> bool {
        let changed = self.locked != locked;
        self.locked = locked;
        changed
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn load_progress(&self) -> f64 {
        self.load_progress
    }

    /// Whether every member request has rendered; true for an empty bucket
    pub fn is_rendered(&self) -> bool {
        self.rendered
    }

    pub fn render_progress(&self) -> f64 {
        self.render_progress
    }

    /// Member requests in registration order
    pub fn requests(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.requests.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn contains(&self, request: RequestId) -> bool {
        self.requests.contains(&request)
    }

    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&BucketEvent) + 'static,
    {
        self.events.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Register a member. A new member is never rendered yet, so the
    /// bucket stops being rendered immediately.
    pub fn add_request(&mut self, request: RequestId) -> bool {
        if !self.requests.insert(request) {
            return false;
        }
        self.rendered = false;
        self.emit(BucketEventKind::RenderRequestAdded { request });
        true
    }

    pub fn remove_request(&mut self, request: RequestId) -> bool {
        if !self.requests.shift_remove(&request) {
            return false;
        }
        self.emit(BucketEventKind::RenderRequestRemoved { request });
        true
    }

    /// A member image started (or restarted) loading.
    pub fn on_loadstart(&mut self) {
        self.loading = true;
        self.loaded = false;
        self.rendered = false;
        self.emit(BucketEventKind::Update);
    }

    /// Recompute load aggregates from `(progress, loaded)` of each distinct
    /// member image.
    pub fn update_load(&mut self, images: &[(f64, bool)]) {
        if images.is_empty() {
            self.loading = false;
            self.load_progress = 0.0;
            return;
        }

        self.load_progress = images.iter().map(|(progress, _)| progress).sum::<f64>() / images.len() as f64;
        self.emit(BucketEventKind::Progress {
            progress: self.load_progress,
        });

        let all_loaded = images.iter().all(|(_, loaded)| *loaded);
        if all_loaded && !self.loaded {
            self.loaded = true;
            self.loading = false;
            self.emit(BucketEventKind::LoadEnd);
        } else if !all_loaded {
            self.loaded = false;
        }
    }

    /// Recompute render aggregates.
    ///
    /// `Rendered` is emitted only on the transition, when the last
    /// outstanding member renders.
    pub fn update_render(&mut self, rendered: usize, total: usize) {
        if total == 0 {
            self.rendered = true;
            self.render_progress = 1.0;
            return;
        }

        self.render_progress = rendered as f64 / total as f64;
        self.emit(BucketEventKind::RenderProgress {
            progress: self.render_progress,
        });

        let all_rendered = rendered >= total;
        if all_rendered && !self.rendered {
            self.rendered = true;
            self.emit(BucketEventKind::Rendered);
        } else if !all_rendered {
            self.rendered = false;
        }
    }

    /// Aggregates changed for a reason other than load or render progress.
    pub fn on_update(&mut self) {
        self.emit(BucketEventKind::Update);
    }

    pub fn on_error(&mut self, url: &str, error: LoadError) {
        self.emit(BucketEventKind::Error {
            url: url.to_string(),
            error,
        });
    }

    /// Signal that every member has been cleared.
    pub fn on_cleared(&mut self) {
        self.requests.clear();
        self.loading = false;
        self.loaded = false;
        self.load_progress = 0.0;
        self.rendered = true;
        self.render_progress = 1.0;
        self.emit(BucketEventKind::Clear);
    }

    fn emit(&mut self, kind: BucketEventKind) {
        self.events.emit(&Event::new(self.id, kind));
    }
}
