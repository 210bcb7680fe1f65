//! Render-commit collaborator: the platform paint step.

use crate::image::Size;
use crate::render_request::RequestId;
use std::time::Duration;

/// One commit handed to the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitJob<'a> {
    pub request: RequestId,
    pub url: &'a str,
    pub size: Size,
    /// How long the frame queue will hold this job before completing it
    pub render_time: Duration,
}

/// Performs the paint/commit for a render request.
///
/// The frame queue paces completion on its own clock, so implementations
/// only need to start the work.
pub trait RenderCommit {
    fn commit(&mut self, job: &CommitJob<'_>);
}

/// Headless commit that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCommit;

impl RenderCommit for NullCommit {
    fn commit(&mut self, _job: &CommitJob<'_>) {}
}
