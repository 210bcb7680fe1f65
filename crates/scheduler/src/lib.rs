//! imagekeep scheduler library
//!
//! Admission and pacing for the image cache.
//!
//! - [`Network`] bounds how many transfers run at once and promotes queued
//!   keys in FIFO order as slots free up.
//! - [`FrameQueue`] is a single-lane commit queue: one item at a time, strict
//!   submission order, each item held for a render time scaled by payload size
//!   and device capability.
//!
//! Both are generic over the key they schedule and never perform the work
//! themselves; they return what the owner must start next.
//!
//! # Example
//!
//! ```
//! use imagekeep_scheduler::{Admission, FrameEvent, FrameQueue, Network};
//! use std::time::Instant;
//!
//! let mut network = Network::new(6);
//! assert_eq!(network.add("https://example.com/a.png"), Admission::Started);
//!
//! let now = Instant::now();
//! let mut frames = FrameQueue::new(1.0);
//! frames.add(42u64, 1 << 20, now);
//! assert_eq!(frames.poll(now), vec![FrameEvent::Completed(42)]);
//! ```

mod cancel;
mod frame_queue;
mod network;

// Re-export public API
pub use cancel::{CancellationRegistry, CancellationToken};
pub use frame_queue::{
    render_time, Dispatch, FrameEvent, FrameQueue, FrameQueueStats, BYTES_PER_FRAME,
    FRAME_BUDGET_120FPS, FRAME_BUDGET_60FPS,
};
pub use network::{Admission, Network, NetworkStats, Removal};
