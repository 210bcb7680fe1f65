//! Network transfer state machine with bounded retry
//!
//! A [`Loader`] tracks one URL's fetch. It never talks to the network itself:
//! `load` and `abort` are forwarded to a [`Transport`], and every transport
//! callback is fed back through [`Loader::handle`], which returns the
//! consumer-facing [`LoaderEvent`]s the transition produced.

use crate::transport::{FetchRequest, Transport, TransportError, TransportEvent};
use std::time::Duration;
use tracing::{debug, warn};

/// Progress reported while loading without a known content length.
pub const UNKNOWN_TOTAL_PROGRESS: f64 = 0.5;

/// Loader lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoaderState {
    /// Never started, or reset for a retry
    #[default]
    Idle,
    /// Fetch requested, transport has not started yet
    Pending,
    /// Transport reported start
    Loading,
    Loaded,
    /// Transport error after the retry budget was spent
    Errored,
    Aborted,
    /// Timeout after the retry budget was spent
    TimedOut,
}

impl LoaderState {
    /// Whether no further transport events will change this state
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LoaderState::Loaded | LoaderState::Errored | LoaderState::Aborted | LoaderState::TimedOut
        )
    }
}

/// Events emitted by a loader transition
#[derive(Debug, Clone, PartialEq)]
pub enum LoaderEvent {
    LoadStart,
    Progress {
        loaded: u64,
        total: Option<u64>,
        progress: f64,
    },
    /// Payload fully received; `bytes` is its size
    LoadEnd { bytes: u64 },
    Error { status: u16, status_text: String },
    Timeout,
    Abort,
    /// A failed attempt is being retried; `retries` counts retries so far
    Retry { retries: u32 },
}

impl LoaderEvent {
    /// Whether this event ends the loader's transfer for good
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoaderEvent::LoadEnd { .. }
                | LoaderEvent::Error { .. }
                | LoaderEvent::Timeout
                | LoaderEvent::Abort
        )
    }
}

/// Per-loader fetch options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderOptions {
    pub headers: Vec<(String, String)>,
    /// Retries allowed after the first attempt
    pub retry: u32,
    pub timeout: Duration,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            headers: Vec::new(),
            retry: imagekeep_cache::config::DEFAULT_RETRY,
            timeout: Duration::from_millis(imagekeep_cache::config::DEFAULT_TIMEOUT_MS),
        }
    }
}

/// Transfer state for a single URL
#[derive(Debug)]
pub struct Loader {
    url: String,
    options: LoaderOptions,
    state: LoaderState,
    bytes_total: Option<u64>,
    bytes_loaded: u64,
    retries: u32,
    attempts: u32,
    payload: Option<Vec<u8>>,
    error: Option<TransportError>,
}

impl Loader {
    /// Create an idle loader
    pub fn new(url: impl Into<String>, options: LoaderOptions) -> Self {
        Self {
            url: url.into(),
            options,
            state: LoaderState::Idle,
            bytes_total: None,
            bytes_loaded: 0,
            retries: 0,
            attempts: 0,
            payload: None,
            error: None,
        }
    }

    /// Ask the transport to fetch the URL.
    ///
    /// Returns `false` without contacting the transport when a fetch is
    /// already pending or in progress.
    pub fn load(&mut self, transport: &mut dyn Transport) -> bool {
        if matches!(self.state, LoaderState::Pending | LoaderState::Loading) {
            return false;
        }

        self.state = LoaderState::Pending;
        self.bytes_loaded = 0;
        self.bytes_total = None;
        self.error = None;
        self.attempts += 1;
        debug!(url = %self.url, attempt = self.attempts, "loader fetch");

        transport.fetch(&FetchRequest {
            url: self.url.clone(),
            headers: self.options.headers.clone(),
            timeout: self.options.timeout,
        });
        true
    }

    /// Abort the transfer, bypassing retry.
    ///
    /// Only pending or loading transfers are aborted; otherwise nothing is
    /// emitted.
    pub fn abort(&mut self, transport: &mut dyn Transport) -> Vec<LoaderEvent> {
        if !matches!(self.state, LoaderState::Pending | LoaderState::Loading) {
            return Vec::new();
        }
        transport.abort(&self.url);
        self.state = LoaderState::Aborted;
        debug!(url = %self.url, "loader aborted");
        vec![LoaderEvent::Abort]
    }

    /// Apply a transport callback.
    ///
    /// Events for an idle or finished loader are stale and ignored.
    pub fn handle(
        &mut self,
        event: TransportEvent,
        transport: &mut dyn Transport,
    ) -> Vec<LoaderEvent> {
        if self.state == LoaderState::Idle || self.state.is_terminal() {
            debug!(url = %self.url, state = ?self.state, ?event, "stale transport event ignored");
            return Vec::new();
        }

        match event {
            TransportEvent::Start => {
                self.state = LoaderState::Loading;
                vec![LoaderEvent::LoadStart]
            }
            TransportEvent::Progress { loaded, total } => {
                self.state = LoaderState::Loading;
                self.bytes_loaded = loaded;
                self.bytes_total = total;
                vec![LoaderEvent::Progress {
                    loaded,
                    total,
                    progress: self.progress(),
                }]
            }
            TransportEvent::Success { payload } => {
                let bytes = payload.len() as u64;
                self.bytes_loaded = bytes;
                self.bytes_total = Some(bytes);
                self.payload = Some(payload);
                self.state = LoaderState::Loaded;
                debug!(url = %self.url, bytes, "loader finished");
                vec![LoaderEvent::LoadEnd { bytes }]
            }
            TransportEvent::Error {
                status,
                status_text,
            } => self.fail(
                TransportError::Status {
                    status,
                    status_text,
                },
                transport,
            ),
            TransportEvent::Timeout => self.fail(TransportError::Timeout, transport),
            TransportEvent::Abort => {
                self.state = LoaderState::Aborted;
                vec![LoaderEvent::Abort]
            }
        }
    }

    fn fail(&mut self, error: TransportError, transport: &mut dyn Transport) -> Vec<LoaderEvent> {
        if self.retries < self.options.retry {
            self.retries += 1;
            debug!(url = %self.url, retries = self.retries, %error, "loader retrying");
            self.state = LoaderState::Idle;
            self.load(transport);
            return vec![LoaderEvent::Retry {
                retries: self.retries,
            }];
        }

        warn!(url = %self.url, attempts = self.attempts, %error, "loader failed");
        let event = match &error {
            TransportError::Status {
                status,
                status_text,
            } => {
                self.state = LoaderState::Errored;
                LoaderEvent::Error {
                    status: *status,
                    status_text: status_text.clone(),
                }
            }
            TransportError::Timeout => {
                self.state = LoaderState::TimedOut;
                LoaderEvent::Timeout
            }
        };
        self.error = Some(error);
        vec![event]
    }

    /// Drop the payload and return to idle, keeping the retry count.
    pub fn reset(&mut self) {
        self.state = LoaderState::Idle;
        self.payload = None;
        self.bytes_loaded = 0;
        self.bytes_total = None;
        self.error = None;
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> LoaderState {
        self.state
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    /// Fraction of the payload received.
    pub fn progress(&self) -> f64 {
        match (self.state, self.bytes_total) {
            (LoaderState::Loaded, _) => 1.0,
            (_, Some(total)) if total > 0 => (self.bytes_loaded as f64 / total as f64).min(1.0),
            (LoaderState::Loading, _) => UNKNOWN_TOTAL_PROGRESS,
            _ => 0.0,
        }
    }

    pub fn bytes_total(&self) -> Option<u64> {
        self.bytes_total
    }

    pub fn bytes_loaded(&self) -> u64 {
        self.bytes_loaded
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Total fetches issued, including retries
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// Take the payload out of the loader, leaving it loaded.
    pub fn release_payload(&mut self) -> Option<Vec<u8>> {
        self.payload.take()
    }

    /// The failure that finalized the loader, if any
    pub fn error(&self) -> Option<&TransportError> {
        self.error.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_loaded(&self) -> bool {
        self.state == LoaderState::Loaded
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.state, LoaderState::Pending | LoaderState::Loading)
    }
}
