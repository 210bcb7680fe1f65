//! Single-lane paced commit queue
//!
//! Models one render/decode pipeline: at most one item is processing at a
//! time and items leave strictly in submission order. Each item occupies the
//! lane for a simulated render time derived from its payload size and the
//! device capability factor (`hw_rank`).
//!
//! # Target Frame Times
//! - 60 FPS (standard): 16.67ms per frame
//! - 120 FPS (ProMotion): 8.33ms per frame

use std::collections::VecDeque;
use std::fmt::Debug;
use std::time::{Duration, Instant};

use tracing::debug;

/// Default frame budget for 60 FPS displays (16.67ms)
pub const FRAME_BUDGET_60FPS: Duration = Duration::from_micros(16_667);

/// Frame budget for 120 FPS displays (8.33ms)
pub const FRAME_BUDGET_120FPS: Duration = Duration::from_micros(8_333);

/// Payload bytes the slowest device (`hw_rank == 0`) commits per frame
pub const BYTES_PER_FRAME: u64 = 1024 * 1024;

/// Simulated time needed to commit `payload_bytes` on a device of `hw_rank`
///
/// `(payload_bytes / bytes_per_frame) × (1 − hw_rank)` frames of
/// `frame_duration`. `hw_rank` is clamped to `[0, 1]` (NaN counts as 0); 1 yields zero.
pub fn render_time(
    payload_bytes: u64,
    hw_rank: f64,
    bytes_per_frame: u64,
    frame_duration: Duration,
) -> Duration {
    let frames = payload_bytes as f64 / bytes_per_frame.max(1) as f64;
    let scale = 1.0 - clamp_hw_rank(hw_rank);
    frame_duration.mul_f64(frames * scale)
}

/// Clamp `hw_rank` to `[0, 1]`, treating NaN as the slowest device
fn clamp_hw_rank(hw_rank: f64) -> f64 {
    if hw_rank.is_nan() {
        0.0
    } else {
        hw_rank.clamp(0.0, 1.0)
    }
}

/// An item that has just entered the lane
///
/// The owner calls the item's pre-commit hook and the commit collaborator
/// with `render_time` as the hint.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch<T> {
    /// The item now processing
    pub item: T,
    /// Payload size the render time was computed from
    pub payload_bytes: u64,
    /// Simulated render time
    pub render_time: Duration,
    /// When processing started
    pub started_at: Instant,
}

impl<T> Dispatch<T> {
    /// Instant after which the item is considered committed
    pub fn ready_at(&self) -> Instant {
        self.started_at + self.render_time
    }
}

/// Lane transitions reported by [`FrameQueue::poll`], in the order they happened
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent<T> {
    /// The processing item finished its render time
    Completed(T),
    /// The next queued item entered the lane
    Started(Dispatch<T>),
}

/// Frame queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameQueueStats {
    /// Total items submitted
    pub submitted: u64,

    /// Total items that entered the lane
    pub dispatched: u64,

    /// Total items that finished processing
    pub completed: u64,

    /// Total queued items withdrawn before starting
    pub removed: u64,

    /// Current queue size (excluding the processing item)
    pub queue_size: usize,
}

#[derive(Debug)]
struct Entry<T> {
    item: T,
    payload_bytes: u64,
}

/// Strict FIFO, one-at-a-time commit scheduler
///
/// Time is passed in explicitly so the owner's event loop (or a test)
/// controls pacing.
///
/// # Example
///
/// ```
/// use imagekeep_scheduler::{FrameEvent, FrameQueue};
/// use std::time::Instant;
///
/// let now = Instant::now();
/// let mut frames = FrameQueue::new(1.0);
///
/// // Idle lane: the first item starts immediately
/// assert!(frames.add("a", 4096, now).is_some());
/// assert!(frames.add("b", 4096, now).is_none());
///
/// // hw_rank 1.0 means zero render time, so both drain in one poll
/// let events = frames.poll(now);
/// assert_eq!(events.len(), 3);
/// assert_eq!(events[0], FrameEvent::Completed("a"));
/// ```
#[derive(Debug)]
pub struct FrameQueue<T> {
    queue: VecDeque<Entry<T>>,
    processing: Option<Dispatch<T>>,
    hw_rank: f64,
    bytes_per_frame: u64,
    frame_duration: Duration,
    stats: FrameQueueStats,
}

impl<T: Clone + PartialEq + Debug> FrameQueue<T> {
    /// Create an idle queue for a device of `hw_rank`
    pub fn new(hw_rank: f64) -> Self {
        Self {
            queue: VecDeque::new(),
            processing: None,
            hw_rank: clamp_hw_rank(hw_rank),
            bytes_per_frame: BYTES_PER_FRAME,
            frame_duration: FRAME_BUDGET_60FPS,
            stats: FrameQueueStats::default(),
        }
    }

    /// Override the number of bytes committed per frame at `hw_rank == 0`
    pub fn with_bytes_per_frame(mut self, bytes_per_frame: u64) -> Self {
        self.bytes_per_frame = bytes_per_frame.max(1);
        self
    }

    /// Override the frame duration (e.g. [`FRAME_BUDGET_120FPS`])
    pub fn with_frame_duration(mut self, frame_duration: Duration) -> Self {
        self.frame_duration = frame_duration;
        self
    }

    /// Get the device capability factor
    pub fn hw_rank(&self) -> f64 {
        self.hw_rank
    }

    /// Set the device capability factor, clamped to `[0, 1]`
    ///
    /// Only affects items dispatched afterwards. NaN is ignored.
    pub fn set_hw_rank(&mut self, hw_rank: f64) {
        if hw_rank.is_nan() {
            return;
        }
        self.hw_rank = clamp_hw_rank(hw_rank);
    }

    /// Render time this queue would assign to `payload_bytes`
    pub fn render_time_for(&self, payload_bytes: u64) -> Duration {
        render_time(
            payload_bytes,
            self.hw_rank,
            self.bytes_per_frame,
            self.frame_duration,
        )
    }

    /// Enqueue an item
    ///
    /// If the lane is idle the item starts immediately and its dispatch is
    /// returned; otherwise it waits behind everything already submitted.
    pub fn add(&mut self, item: T, payload_bytes: u64, now: Instant) -> Option<Dispatch<T>> {
        self.stats.submitted += 1;
        self.queue.push_back(Entry {
            item,
            payload_bytes,
        });

        if self.processing.is_none() {
            self.start_next(now)
        } else {
            None
        }
    }

    /// Advance the lane to `now`
    ///
    /// Completes the processing item once its render time has elapsed and
    /// starts the next one, repeating while items become ready.
    pub fn poll(&mut self, now: Instant) -> Vec<FrameEvent<T>> {
        let mut events = Vec::new();

        if self.processing.is_none() {
            if let Some(dispatch) = self.start_next(now) {
                events.push(FrameEvent::Started(dispatch));
            }
        }

        while let Some(dispatch) = self.processing.take() {
            if dispatch.ready_at() > now {
                self.processing = Some(dispatch);
                break;
            }

            self.stats.completed += 1;
            debug!(item = ?dispatch.item, "commit completed");
            events.push(FrameEvent::Completed(dispatch.item));

            if let Some(next) = self.start_next(now) {
                events.push(FrameEvent::Started(next));
            }
        }

        events
    }

    /// Instant at which the processing item becomes ready, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        self.processing.as_ref().map(Dispatch::ready_at)
    }

    /// Withdraw a queued item that has not started
    ///
    /// The processing item cannot be withdrawn. Returns `true` if removed.
    pub fn remove(&mut self, item: &T) -> bool {
        match self.queue.iter().position(|entry| entry.item == *item) {
            Some(index) => {
                self.queue.remove(index);
                self.stats.removed += 1;
                true
            }
            None => false,
        }
    }

    /// Drop every queued item; the processing item keeps its slot
    ///
    /// Returns the number of items dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        self.stats.removed += dropped as u64;
        dropped
    }

    /// Drop every queued item and abandon the processing one
    pub fn reset(&mut self) {
        self.clear();
        self.processing = None;
    }

    /// The item currently processing
    pub fn processing(&self) -> Option<&T> {
        self.processing.as_ref().map(|dispatch| &dispatch.item)
    }

    /// Check whether an item is processing
    pub fn is_processing(&self) -> bool {
        self.processing.is_some()
    }

    /// Check whether `item` is waiting (not processing)
    pub fn is_queued(&self, item: &T) -> bool {
        self.queue.iter().any(|entry| entry.item == *item)
    }

    /// Number of waiting items
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check whether nothing is waiting or processing
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.processing.is_none()
    }

    /// Get queue statistics
    pub fn stats(&self) -> FrameQueueStats {
        FrameQueueStats {
            queue_size: self.queue.len(),
            ..self.stats
        }
    }

    fn start_next(&mut self, now: Instant) -> Option<Dispatch<T>> {
        let entry = self.queue.pop_front()?;
        let dispatch = Dispatch {
            render_time: self.render_time_for(entry.payload_bytes),
            item: entry.item,
            payload_bytes: entry.payload_bytes,
            started_at: now,
        };
        debug!(
            item = ?dispatch.item,
            render_time_us = dispatch.render_time.as_micros() as u64,
            "commit dispatched"
        );
        self.stats.dispatched += 1;
        self.processing = Some(dispatch.clone());
        Some(dispatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed<T: Clone>(events: &[FrameEvent<T>]) -> Vec<T> {
        events
            .iter()
            .filter_map(|event| match event {
                FrameEvent::Completed(item) => Some(item.clone()),
                FrameEvent::Started(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_render_time_formula() {
        let frame = Duration::from_millis(10);

        assert_eq!(render_time(2048, 0.0, 1024, frame), Duration::from_millis(20));
        assert_eq!(render_time(2048, 0.5, 1024, frame), Duration::from_millis(10));
        assert_eq!(render_time(2048, 1.0, 1024, frame), Duration::ZERO);
        assert_eq!(render_time(0, 0.0, 1024, frame), Duration::ZERO);
    }

    #[test]
    fn test_render_time_decreases_with_hw_rank() {
        let payload = 3 * BYTES_PER_FRAME;
        let mut previous = Duration::MAX;
        for step in 0..=10 {
            let rank = step as f64 / 10.0;
            let time = render_time(payload, rank, BYTES_PER_FRAME, FRAME_BUDGET_60FPS);
            assert!(time <= previous);
            previous = time;
        }
        assert_eq!(previous, Duration::ZERO);
    }

    #[test]
    fn test_render_time_clamps_hw_rank() {
        let frame = FRAME_BUDGET_60FPS;
        assert_eq!(
            render_time(BYTES_PER_FRAME, -3.0, BYTES_PER_FRAME, frame),
            render_time(BYTES_PER_FRAME, 0.0, BYTES_PER_FRAME, frame)
        );
        assert_eq!(render_time(BYTES_PER_FRAME, 2.0, BYTES_PER_FRAME, frame), Duration::ZERO);
        assert_eq!(
            render_time(BYTES_PER_FRAME, f64::NAN, BYTES_PER_FRAME, frame),
            frame
        );
    }

    #[test]
    fn test_nan_hw_rank_keeps_previous_rank() {
        let now = Instant::now();
        let mut frames = FrameQueue::new(f64::NAN).with_frame_duration(Duration::from_millis(10));
        assert_eq!(frames.hw_rank(), 0.0);

        frames.set_hw_rank(0.5);
        frames.set_hw_rank(f64::NAN);
        assert_eq!(frames.hw_rank(), 0.5);

        frames.add("a", BYTES_PER_FRAME, now);
        assert_eq!(frames.next_deadline(), Some(now + Duration::from_millis(5)));
    }

    #[test]
    fn test_add_starts_when_idle() {
        let now = Instant::now();
        let mut frames = FrameQueue::new(0.0).with_frame_duration(Duration::from_millis(10));

        let dispatch = frames.add(1u32, BYTES_PER_FRAME, now).unwrap();
        assert_eq!(dispatch.item, 1);
        assert_eq!(dispatch.render_time, Duration::from_millis(10));
        assert_eq!(frames.processing(), Some(&1));

        assert!(frames.add(2u32, BYTES_PER_FRAME, now).is_none());
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_one_at_a_time_in_fifo_order() {
        let start = Instant::now();
        let frame = Duration::from_millis(10);
        let mut frames = FrameQueue::new(0.0).with_frame_duration(frame);

        for item in 0..4u32 {
            frames.add(item, BYTES_PER_FRAME, start);
        }

        // Not ready yet
        assert!(frames.poll(start + Duration::from_millis(5)).is_empty());

        let mut order = Vec::new();
        let mut now = start;
        for _ in 0..4 {
            now += frame;
            let events = frames.poll(now);
            let done = completed(&events);
            assert_eq!(done.len(), 1, "exactly one commit per render time");
            order.extend(done);
        }

        assert_eq!(order, vec![0, 1, 2, 3]);
        assert!(frames.is_empty());
    }

    #[test]
    fn test_poll_reports_completion_before_next_start() {
        let now = Instant::now();
        let mut frames = FrameQueue::new(1.0);
        frames.add("a", 10, now);
        frames.add("b", 10, now);

        let events = frames.poll(now);
        assert_eq!(events[0], FrameEvent::Completed("a"));
        assert!(matches!(&events[1], FrameEvent::Started(d) if d.item == "b"));
        assert_eq!(events[2], FrameEvent::Completed("b"));
    }

    #[test]
    fn test_remove_only_queued() {
        let now = Instant::now();
        let mut frames = FrameQueue::new(0.0);
        frames.add("a", BYTES_PER_FRAME, now);
        frames.add("b", BYTES_PER_FRAME, now);

        assert!(!frames.remove(&"a"));
        assert!(frames.remove(&"b"));
        assert!(!frames.is_queued(&"b"));
        assert_eq!(frames.processing(), Some(&"a"));
        assert_eq!(frames.stats().removed, 1);
    }

    #[test]
    fn test_clear_keeps_processing_item() {
        let now = Instant::now();
        let mut frames = FrameQueue::new(0.5);
        for item in ["a", "b", "c"] {
            frames.add(item, 1, now);
        }

        assert_eq!(frames.clear(), 2);
        assert_eq!(frames.processing(), Some(&"a"));

        frames.reset();
        assert!(frames.is_empty());
    }

    #[test]
    fn test_next_deadline() {
        let now = Instant::now();
        let mut frames = FrameQueue::new(0.0).with_frame_duration(Duration::from_millis(16));

        assert!(frames.next_deadline().is_none());
        frames.add("a", BYTES_PER_FRAME * 2, now);
        assert_eq!(frames.next_deadline(), Some(now + Duration::from_millis(32)));
    }

    #[test]
    fn test_set_hw_rank_applies_to_later_dispatches() {
        let now = Instant::now();
        let mut frames = FrameQueue::new(0.0).with_frame_duration(Duration::from_millis(10));
        frames.add("slow", BYTES_PER_FRAME, now);
        frames.set_hw_rank(1.0);
        frames.add("fast", BYTES_PER_FRAME, now);

        let events = frames.poll(now + Duration::from_millis(10));
        assert_eq!(completed(&events), vec!["slow", "fast"]);
    }

    #[test]
    fn test_stats() {
        let now = Instant::now();
        let mut frames = FrameQueue::new(1.0);
        frames.add(1u8, 1, now);
        frames.add(2u8, 1, now);
        frames.poll(now);

        let stats = frames.stats();
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.dispatched, 2);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.queue_size, 0);
    }
}
