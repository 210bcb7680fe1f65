//! Cached image: one URL's payload, decoded size and byte costs.
//!
//! An [`Image`] owns its [`Loader`] and knows what it costs in RAM (payload
//! plus decoded raster) and in video memory (per requested size, or one
//! shared full-resolution copy in gpuDataFull mode). It tracks which render
//! requests are registered against it but never owns them; the
//! [`Controller`](crate::Controller) drives every transition.

use crate::decode::{DecodeError, ImageInfo};
use crate::loader::{Loader, LoaderOptions};
use crate::render_request::RequestId;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pixel layout used to estimate raster sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorType {
    Gray,
    GrayAlpha,
    Rgb,
    #[default]
    Rgba,
}

impl ColorType {
    pub const fn bytes_per_pixel(self) -> u64 {
        match self {
            ColorType::Gray => 1,
            ColorType::GrayAlpha => 2,
            ColorType::Rgb => 3,
            ColorType::Rgba => 4,
        }
    }
}

/// Target size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Per-image options supplied when the image is first referenced.
///
/// Options only apply on a cache miss; later references to a cached URL reuse
/// the existing image as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageProps {
    pub headers: Vec<(String, String)>,
    pub color_type: ColorType,
    /// Overrides the configured retry budget
    pub retry: Option<u32>,
    /// Overrides the configured transport timeout
    pub timeout: Option<Duration>,
}

impl ImageProps {
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_color_type(mut self, color_type: ColorType) -> Self {
        self.color_type = color_type;
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Loader options for this image, filling gaps from the defaults given
    pub fn loader_options(&self, default_retry: u32, default_timeout: Duration) -> LoaderOptions {
        LoaderOptions {
            headers: self.headers.clone(),
            retry: self.retry.unwrap_or(default_retry),
            timeout: self.timeout.unwrap_or(default_timeout),
        }
    }
}

/// A cached image
#[derive(Debug)]
pub struct Image {
    url: String,
    loader: Loader,
    color_type: ColorType,
    gpu_data_full: bool,
    info: Option<ImageInfo>,
    decode_error: Option<DecodeError>,
    compressed_bytes: u64,
    uncompressed_bytes: u64,
    got_size: bool,
    decoded: bool,
    requests: IndexSet<RequestId>,
    size_waiters: IndexSet<RequestId>,
}

impl Image {
    pub fn new(url: impl Into<String>, props: &ImageProps, options: LoaderOptions, gpu_data_full: bool) -> Self {
        let url = url.into();
        Self {
            loader: Loader::new(url.clone(), options),
            url,
            color_type: props.color_type,
            gpu_data_full,
            info: None,
            decode_error: None,
            compressed_bytes: 0,
            uncompressed_bytes: 0,
            got_size: false,
            decoded: false,
            requests: IndexSet::new(),
            size_waiters: IndexSet::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    pub fn loader_mut(&mut self) -> &mut Loader {
        &mut self.loader
    }

    pub fn color_type(&self) -> ColorType {
        self.color_type
    }

    /// Native size and type, once the probe has resolved
    pub fn info(&self) -> Option<&ImageInfo> {
        self.info.as_ref()
    }

    pub fn decode_error(&self) -> Option<&DecodeError> {
        self.decode_error.as_ref()
    }

    pub fn compressed_bytes(&self) -> u64 {
        self.compressed_bytes
    }

    pub fn uncompressed_bytes(&self) -> u64 {
        self.uncompressed_bytes
    }

    /// Whether the decode probe has resolved the native size
    pub fn got_size(&self) -> bool {
        self.got_size
    }

    /// Whether a commit has made this image GPU-resident
    pub fn is_decoded(&self) -> bool {
        self.decoded
    }

    /// RAM cost: payload plus the decoded raster once its size is known.
    pub fn bytes_ram(&self) -> u64 {
        if self.got_size {
            self.compressed_bytes + self.uncompressed_bytes
        } else {
            self.compressed_bytes
        }
    }

    /// Video cost of committing this image at `size`.
    ///
    /// In gpuDataFull mode every size shares one copy at the native
    /// resolution; before the native size is known the requested size stands
    /// in for it.
    pub fn bytes_video(&self, size: Size) -> u64 {
        let bpp = self.color_type.bytes_per_pixel();
        match (&self.info, self.gpu_data_full) {
            (Some(info), true) => info.pixels() * bpp,
            _ => size.area() * bpp,
        }
    }

    /// Record the payload size after the loader finished.
    pub fn on_loaded(&mut self, compressed_bytes: u64) {
        self.compressed_bytes = compressed_bytes;
    }

    /// Apply the decode probe's result.
    ///
    /// On success returns the newly-charged uncompressed bytes and the
    /// requests that were waiting for the size. On failure the waiters are
    /// dropped: they can never be scheduled.
    pub fn apply_decode(
        &mut self,
        result: Result<ImageInfo, DecodeError>,
    ) -> Result<(u64, Vec<RequestId>), DecodeError> {
        let waiters: Vec<RequestId> = self.size_waiters.drain(..).collect();
        match result {
            Ok(info) => {
                self.uncompressed_bytes = info.pixels() * self.color_type.bytes_per_pixel();
                self.info = Some(info);
                self.got_size = true;
                self.decode_error = None;
                Ok((self.uncompressed_bytes, waiters))
            }
            Err(error) => {
                self.decode_error = Some(error.clone());
                Err(error)
            }
        }
    }

    /// Register a request. Returns `false` if it was already registered.
    pub fn register_request(&mut self, id: RequestId) -> bool {
        self.requests.insert(id)
    }

    /// Unregister a request and any size wait it held.
    pub fn unregister_request(&mut self, id: RequestId) -> bool {
        self.size_waiters.shift_remove(&id);
        self.requests.shift_remove(&id)
    }

    /// Bytes a request committing `bytes_video` actually pays.
    ///
    /// The first commit pays in full and marks the image GPU-resident. After
    /// that, gpuDataFull commits share the resident copy and pay nothing.
    pub fn on_request_rendered(&mut self, bytes_video: u64) -> u64 {
        if self.gpu_data_full && self.decoded {
            return 0;
        }
        self.decoded = true;
        bytes_video
    }

    /// Park a request until the native size is known.
    pub fn wait_for_size(&mut self, id: RequestId) {
        self.size_waiters.insert(id);
    }

    pub fn cancel_size_wait(&mut self, id: RequestId) -> bool {
        self.size_waiters.shift_remove(&id)
    }

    pub fn is_waiting(&self, id: RequestId) -> bool {
        self.size_waiters.contains(&id)
    }

    /// Registered requests, in registration order
    pub fn requests(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.requests.iter().copied()
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    pub fn has_request(&self, id: RequestId) -> bool {
        self.requests.contains(&id)
    }

    pub fn load_progress(&self) -> f64 {
        self.loader.progress()
    }

    pub fn is_loaded(&self) -> bool {
        self.loader.is_loaded()
    }

    /// Reset decode and byte state and release the payload.
    ///
    /// Registered requests must already have been cleared by the caller;
    /// any ids left over are forgotten.
    pub fn clear(&mut self) {
        self.requests.clear();
        self.size_waiters.clear();
        self.info = None;
        self.decode_error = None;
        self.compressed_bytes = 0;
        self.uncompressed_bytes = 0;
        self.got_size = false;
        self.decoded = false;
        self.loader.reset();
    }
}
