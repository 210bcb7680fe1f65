//! imagekeep core library
//!
//! A client-side image cache that keeps decoded image data resident under two
//! independent budgets: RAM (payloads plus decoded rasters) and video memory
//! (GPU-resident rasters, per requested size or one shared full-resolution
//! copy). Loads go through a bounded-concurrency network queue with retry;
//! commits go through a single-lane frame queue paced by payload size and
//! device capability.
//!
//! Consumers group their [`RenderRequest`]s in [`Bucket`]s. A locked bucket
//! protects everything it references from eviction; every other image and
//! request is evicted oldest-first when a budget overflows.
//!
//! Everything is owned by a [`Controller`]; consumers hold ids.

pub mod bucket;
pub mod commit;
pub mod controller;
pub mod decode;
pub mod error;
pub mod events;
pub mod image;
pub mod loader;
pub mod render_request;
pub mod transport;

pub use bucket::{Bucket, BucketEvent, BucketEventKind, BucketId};
pub use commit::{CommitJob, NullCommit, RenderCommit};
pub use controller::{Collaborators, Controller, ControllerEvent, ControllerStats};
pub use decode::{DecodeError, DecodeProbe, HeaderProbe, ImageInfo};
pub use error::{CacheError, CacheResult, LoadError};
pub use events::{Event, EventBus, SubscriptionId};
pub use self::image::{ColorType, Image, ImageProps, Size};
pub use loader::{Loader, LoaderEvent, LoaderOptions, LoaderState, UNKNOWN_TOTAL_PROGRESS};
pub use render_request::{RenderRequest, RequestId, RequestState};
pub use transport::{
    FetchRequest, HttpTransport, Transport, TransportError, TransportEvent, TransportInbox,
};
