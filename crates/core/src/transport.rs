//! Transport collaborator: the binary fetch behind every [`Loader`].
//!
//! The cache never performs I/O itself. It asks a [`Transport`] to start or
//! abort a fetch, and the embedder feeds the resulting [`TransportEvent`]s
//! back through [`Controller::handle_transport`].
//!
//! [`HttpTransport`] is a ready-made implementation that runs each fetch on
//! its own thread with `ureq` and hands events back through a
//! [`TransportInbox`].
//!
//! [`Loader`]: crate::Loader
//! [`Controller::handle_transport`]: crate::Controller::handle_transport

use std::io::{self, Read};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use imagekeep_scheduler::{CancellationRegistry, CancellationToken};
use tracing::{debug, warn};

/// Size of each body read; one progress event is reported per chunk.
const READ_CHUNK: usize = 64 * 1024;

/// A binary fetch the transport is asked to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

/// Transport callbacks, delivered back to the cache for one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The transfer began.
    Start,
    /// Some of the body arrived; `total` is unknown without a content length.
    Progress { loaded: u64, total: Option<u64> },
    /// The whole body arrived.
    Success { payload: Vec<u8> },
    /// The server or the connection failed.
    Error { status: u16, status_text: String },
    /// The transfer exceeded its timeout.
    Timeout,
    /// The transfer was aborted.
    Abort,
}

/// Terminal transport failure, surfaced after retries are exhausted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request failed with status {status}: {status_text}")]
    Status { status: u16, status_text: String },
    #[error("request timed out")]
    Timeout,
}

/// Performs binary fetches on behalf of the cache.
///
/// Implementations must eventually report a terminal event (`Success`,
/// `Error`, `Timeout` or `Abort`) for every `fetch`, unless the fetch was
/// aborted through [`Transport::abort`].
pub trait Transport {
    /// Start fetching `request.url`.
    fn fetch(&mut self, request: &FetchRequest);

    /// Stop the transfer for `url`, if any.
    fn abort(&mut self, url: &str);
}

/// Receiving side of an [`HttpTransport`].
///
/// The embedder drains it on the cache's thread and forwards every event to
/// `Controller::handle_transport`.
#[derive(Debug)]
pub struct TransportInbox {
    receiver: Receiver<(String, TransportEvent)>,
}

impl TransportInbox {
    /// Every event that has arrived so far, without blocking.
    pub fn drain(&self) -> Vec<(String, TransportEvent)> {
        self.receiver.try_iter().collect()
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<(String, TransportEvent)> {
        self.receiver.recv_timeout(timeout).ok()
    }
}

/// Thread-per-fetch HTTP transport backed by `ureq`.
///
/// Each fetch holds a cancellation token until its worker reports a
/// terminal event, so aborting a finished fetch is silent.
///
/// # Example
///
/// ```no_run
/// use imagekeep_core::{FetchRequest, HttpTransport, Transport};
/// use std::time::Duration;
///
/// let (mut transport, inbox) = HttpTransport::new();
/// transport.fetch(&FetchRequest {
///     url: "https://example.com/photo.jpg".to_string(),
///     headers: Vec::new(),
///     timeout: Duration::from_secs(30),
/// });
///
/// while let Some((url, event)) = inbox.recv_timeout(Duration::from_secs(1)) {
///     println!("{url}: {event:?}");
/// }
/// ```
pub struct HttpTransport {
    agent: ureq::Agent,
    sender: Sender<(String, TransportEvent)>,
    tokens: SharedTokens,
}

type SharedTokens = Arc<Mutex<CancellationRegistry<String>>>;

fn lock(tokens: &SharedTokens) -> MutexGuard<'_, CancellationRegistry<String>> {
    tokens.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HttpTransport {
    pub fn new() -> (Self, TransportInbox) {
        Self::with_agent(ureq::AgentBuilder::new().build())
    }

    /// Use a preconfigured agent (proxy, TLS, user agent, ...).
    pub fn with_agent(agent: ureq::Agent) -> (Self, TransportInbox) {
        let (sender, receiver) = mpsc::channel();
        let transport = Self {
            agent,
            sender,
            tokens: Arc::new(Mutex::new(CancellationRegistry::new())),
        };
        (transport, TransportInbox { receiver })
    }

    /// Number of fetches that have not reported a terminal event yet
    pub fn active_fetches(&self) -> usize {
        lock(&self.tokens).len()
    }
}

impl Transport for HttpTransport {
    fn fetch(&mut self, request: &FetchRequest) {
        let token = lock(&self.tokens).register(request.url.clone());
        let worker = FetchWorker {
            agent: self.agent.clone(),
            request: request.clone(),
            token,
            tokens: Arc::clone(&self.tokens),
            sender: self.sender.clone(),
        };
        thread::spawn(move || worker.run());
    }

    fn abort(&mut self, url: &str) {
        let mut tokens = lock(&self.tokens);
        if tokens.cancel(&url.to_string()) {
            debug!(url, "http fetch aborted");
            let _ = self.sender.send((url.to_string(), TransportEvent::Abort));
        }
    }
}

struct FetchWorker {
    agent: ureq::Agent,
    request: FetchRequest,
    token: CancellationToken,
    tokens: SharedTokens,
    sender: Sender<(String, TransportEvent)>,
}

impl FetchWorker {
    fn run(self) {
        self.send(TransportEvent::Start);

        let mut call = self
            .agent
            .get(&self.request.url)
            .timeout(self.request.timeout);
        for (name, value) in &self.request.headers {
            call = call.set(name, value);
        }

        match call.call() {
            Ok(response) => {
                let total = response
                    .header("Content-Length")
                    .and_then(|value| value.parse::<u64>().ok());
                self.read_body(response.into_reader(), total);
            }
            Err(ureq::Error::Status(status, response)) => {
                self.finish(TransportEvent::Error {
                    status,
                    status_text: response.status_text().to_string(),
                });
            }
            Err(ureq::Error::Transport(error)) => {
                let timed_out = std::error::Error::source(&error)
                    .and_then(|source| source.downcast_ref::<io::Error>())
                    .is_some_and(is_timeout);
                if timed_out {
                    self.finish(TransportEvent::Timeout);
                } else {
                    warn!(url = %self.request.url, %error, "http transport error");
                    self.finish(TransportEvent::Error {
                        status: 0,
                        status_text: error.to_string(),
                    });
                }
            }
        }
    }

    fn read_body(&self, mut reader: impl Read, total: Option<u64>) {
        let mut payload = Vec::with_capacity(total.unwrap_or(0).min(64 << 20) as usize);
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            if self.token.is_cancelled() {
                return;
            }
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(read) => {
                    payload.extend_from_slice(&chunk[..read]);
                    self.send(TransportEvent::Progress {
                        loaded: payload.len() as u64,
                        total,
                    });
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) if is_timeout(&error) => {
                    self.finish(TransportEvent::Timeout);
                    return;
                }
                Err(error) => {
                    self.finish(TransportEvent::Error {
                        status: 0,
                        status_text: error.to_string(),
                    });
                    return;
                }
            }
        }

        self.finish(TransportEvent::Success { payload });
    }

    /// Report the terminal event and release the token.
    ///
    /// Runs under the registry lock so an abort either precedes the event
    /// and suppresses it, or follows it and finds nothing to cancel.
    fn finish(&self, event: TransportEvent) {
        let mut tokens = lock(&self.tokens);
        if self.token.is_cancelled() {
            return;
        }
        let _ = self.sender.send((self.request.url.clone(), event));
        tokens.release(&self.request.url, &self.token);
    }

    fn send(&self, event: TransportEvent) {
        if !self.token.is_cancelled() {
            let _ = self.sender.send((self.request.url.clone(), event));
        }
    }
}

fn is_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}
