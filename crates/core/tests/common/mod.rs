#![allow(dead_code)]

use imagekeep_cache::CacheConfig;
use imagekeep_core::{
    BucketEventKind, BucketId, Collaborators, CommitJob, Controller, ControllerEvent, DecodeError,
    DecodeProbe, FetchRequest, ImageInfo, RenderCommit, RequestId, Transport, TransportEvent,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct TransportLog {
    pub fetches: Vec<String>,
    pub aborts: Vec<String>,
}

/// Records fetches and aborts; the test delivers callbacks by hand.
#[derive(Clone, Default)]
pub struct RecordingTransport(pub Rc<RefCell<TransportLog>>);

impl Transport for RecordingTransport {
    fn fetch(&mut self, request: &FetchRequest) {
        self.0.borrow_mut().fetches.push(request.url.clone());
    }

    fn abort(&mut self, url: &str) {
        self.0.borrow_mut().aborts.push(url.to_string());
    }
}

/// Reads `WIDTHxHEIGHT` from the first line of the payload.
pub struct TextProbe;

impl DecodeProbe for TextProbe {
    fn probe(&self, payload: &[u8]) -> Result<ImageInfo, DecodeError> {
        let header = payload
            .split(|byte| *byte == b'\n')
            .next()
            .ok_or(DecodeError::Empty)?;
        let header = std::str::from_utf8(header).map_err(|_| DecodeError::Unsupported)?;
        let (width, height) = header.split_once('x').ok_or(DecodeError::Unsupported)?;
        let parse = |value: &str| {
            value
                .parse::<u32>()
                .map_err(|e| DecodeError::Invalid(e.to_string()))
        };
        Ok(ImageInfo {
            width: parse(width)?,
            height: parse(height)?,
            mime_type: "image/x-test".to_string(),
        })
    }
}

/// Records every commit job.
#[derive(Clone, Default)]
pub struct RecordingCommit(pub Rc<RefCell<Vec<(RequestId, Duration)>>>);

impl RenderCommit for RecordingCommit {
    fn commit(&mut self, job: &CommitJob<'_>) {
        self.0.borrow_mut().push((job.request, job.render_time));
    }
}

pub struct Harness {
    pub controller: Controller,
    pub transport: Rc<RefCell<TransportLog>>,
    pub commits: Rc<RefCell<Vec<(RequestId, Duration)>>>,
    pub events: Rc<RefCell<Vec<ControllerEvent>>>,
}

impl Harness {
    pub fn new(config: CacheConfig) -> Self {
        let transport = RecordingTransport::default();
        let commit = RecordingCommit::default();
        let transport_log = Rc::clone(&transport.0);
        let commits = Rc::clone(&commit.0);

        let collaborators = Collaborators::new(transport)
            .with_probe(TextProbe)
            .with_commit(commit);
        let mut controller =
            Controller::new(config, collaborators).expect("config should be valid");

        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        controller.subscribe(move |event| sink.borrow_mut().push(event.clone()));

        Self {
            controller,
            transport: transport_log,
            commits,
            events,
        }
    }

    /// Run the transport to completion for `url`.
    pub fn deliver(&mut self, url: &str, payload: Vec<u8>) {
        self.controller.handle_transport(url, TransportEvent::Start);
        self.controller
            .handle_transport(url, TransportEvent::Success { payload });
    }

    /// Resolve decodes and every commit whose render time has passed.
    pub fn settle(&mut self) {
        let now = self.controller.now();
        self.controller.poll(now);
    }

    pub fn fetches(&self) -> Vec<String> {
        self.transport.borrow().fetches.clone()
    }

    pub fn overflows(&self) -> Vec<ControllerEvent> {
        self.events
            .borrow()
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    ControllerEvent::RamOverflow { .. } | ControllerEvent::VideoOverflow { .. }
                )
            })
            .cloned()
            .collect()
    }

    /// Record every event the bucket emits from now on.
    pub fn record_bucket(&mut self, bucket: BucketId) -> Rc<RefCell<Vec<BucketEventKind>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        self.controller
            .subscribe_bucket(bucket, move |event| sink.borrow_mut().push(event.kind.clone()))
            .expect("bucket should exist");
        log
    }
}

/// A payload of exactly `len` bytes whose header decodes to `width`x`height`.
pub fn payload(width: u32, height: u32, len: usize) -> Vec<u8> {
    let mut bytes = format!("{width}x{height}\n").into_bytes();
    assert!(bytes.len() <= len, "payload too small for its header");
    bytes.resize(len, 0);
    bytes
}
