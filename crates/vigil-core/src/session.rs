//! Recognition sessions: the confidence policy, temporal dedup, still-image
//! recognition and the live-stream loop.

use crate::gallery::Gallery;
use crate::pipeline::Pipeline;
use crate::types::{Annotation, Identity, MatchResult, Outcome, RecognitionEvent};
use chrono::{DateTime, Local};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// --- Named constants ---
const DEFAULT_MATCH_THRESHOLD: f64 = 80.0;
const DEFAULT_DEDUP_COOLDOWN: Duration = Duration::from_secs(3);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("camera unavailable: {0}")]
    Unavailable(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("frame source disconnected: {0}")]
    Disconnected(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("no enrolled identities, enroll a person first")]
    NoEnrolledIdentities,
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Thresholds that turn a match into an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Distances strictly below this are matches.
    pub threshold: f64,
    /// Minimum time between two events for the same identity in a stream.
    #[serde(with = "duration_secs")]
    pub cooldown: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            cooldown: DEFAULT_DEDUP_COOLDOWN,
        }
    }
}

impl Policy {
    pub fn classify(&self, result: &MatchResult, gallery: &Gallery) -> Outcome {
        // A NaN threshold or distance never matches.
        if result.distance.partial_cmp(&self.threshold) != Some(std::cmp::Ordering::Less) {
            return Outcome::Unknown;
        }
        match gallery.get(&result.identity) {
            Some(entry) => Outcome::Recognized {
                identity: entry.identity.clone(),
                label: entry.label.clone(),
            },
            None => {
                tracing::debug!(identity = %result.identity, "matched identity is no longer enrolled");
                Outcome::Unresolved { identity: result.identity.clone() }
            }
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// `100 − distance`, clamped to `[0, 100]` and truncated.
pub fn confidence_percent(distance: f64) -> u8 {
    (100.0 - distance).clamp(0.0, 100.0) as u8
}

/// Source of wall-clock time for event timestamps and dedup.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Last emission time per identity, owned by one stream session.
#[derive(Debug, Default)]
pub struct DedupState {
    last_emitted: HashMap<Identity, DateTime<Local>>,
}

impl DedupState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an event for `identity` at `now` may be emitted. Records `now`
    /// only when it may.
    ///
    /// A clock that went backwards suppresses the event.
    pub fn should_emit(&mut self, identity: &Identity, now: DateTime<Local>, cooldown: Duration) -> bool {
        if let Some(last) = self.last_emitted.get(identity) {
            match (now - *last).to_std() {
                Ok(elapsed) if elapsed > cooldown => {}
                _ => return false,
            }
        }
        self.last_emitted.insert(identity.clone(), now);
        true
    }

    pub fn len(&self) -> usize {
        self.last_emitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_emitted.is_empty()
    }
}

/// A blocking producer of grayscale frames.
pub trait FrameSource {
    /// Next frame, or `None` once the stream has ended.
    ///
    /// `InvalidFrame` means this frame is unusable but the source is healthy;
    /// any other error ends the stream.
    fn read_frame(&mut self) -> Result<Option<GrayImage>, SourceError>;
}

/// Opens a frame source. Dropping the source closes it.
pub trait SourceOpener {
    type Source: FrameSource;

    fn open(&self) -> Result<Self::Source, SourceError>;
}

/// Downstream consumer of annotations and recognition events.
pub trait RecognitionObserver {
    /// Called once per processed frame or image, after its events.
    fn on_frame(&mut self, frame: &GrayImage, annotations: &[Annotation]);

    fn on_event(&mut self, event: &RecognitionEvent);
}

/// Everything one image produced.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FrameReport {
    pub annotations: Vec<Annotation>,
    pub events: Vec<RecognitionEvent>,
}

impl FrameReport {
    pub fn recognized(&self) -> usize {
        self.annotations.iter().filter(|a| a.outcome.is_recognized()).count()
    }
}

fn event_for(annotation: &Annotation, timestamp: DateTime<Local>) -> Option<RecognitionEvent> {
    match &annotation.outcome {
        Outcome::Recognized { identity, label } => Some(RecognitionEvent {
            identity: identity.clone(),
            label: label.clone(),
            timestamp,
            confidence: annotation.confidence,
        }),
        _ => None,
    }
}

/// Recognize every face of one still image.
///
/// Each recognized face yields exactly one event; there is no dedup.
pub fn recognize_still(
    pipeline: &Pipeline,
    image: &GrayImage,
    clock: &dyn Clock,
) -> Result<FrameReport, SessionError> {
    let annotations = pipeline.analyze(image)?;
    let now = clock.now();
    let events = annotations.iter().filter_map(|a| event_for(a, now)).collect();
    Ok(FrameReport { annotations, events })
}

/// Why a stream session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    EndOfStream,
    Disconnected(String),
    GalleryEmptied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    pub frames: u64,
    pub skipped: u64,
    pub events: u64,
    pub reason: StopReason,
}

/// An active live-recognition session.
///
/// Holding a `StreamSession` means the model was trained and the source
/// opened; dropping it closes the source and discards the dedup state.
pub struct StreamSession<S: FrameSource> {
    pipeline: Arc<Pipeline>,
    source: S,
    dedup: DedupState,
    clock: Arc<dyn Clock>,
    frames: u64,
    skipped: u64,
    events: u64,
}

impl<S: FrameSource> StreamSession<S> {
    /// Enter the active state. Refuses before touching the device when
    /// nobody is enrolled.
    pub fn start<O>(pipeline: Arc<Pipeline>, opener: &O, clock: Arc<dyn Clock>) -> Result<Self, SessionError>
    where
        O: SourceOpener<Source = S>,
    {
        if !pipeline.is_trained() {
            return Err(SessionError::NoEnrolledIdentities);
        }
        let source = opener.open()?;
        tracing::info!(enrolled = pipeline.gallery().len(), "stream session started");
        Ok(Self {
            pipeline,
            source,
            dedup: DedupState::new(),
            clock,
            frames: 0,
            skipped: 0,
            events: 0,
        })
    }

    /// Pull and process one frame. Returns the stop reason once the session
    /// cannot continue.
    pub fn step(&mut self, observer: &mut dyn RecognitionObserver) -> Option<StopReason> {
        if !self.pipeline.is_trained() {
            return Some(StopReason::GalleryEmptied);
        }

        let frame = match self.source.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Some(StopReason::EndOfStream),
            Err(SourceError::InvalidFrame(reason)) => {
                tracing::debug!(%reason, "skipping invalid frame");
                self.skipped += 1;
                return None;
            }
            Err(e) => return Some(StopReason::Disconnected(e.to_string())),
        };

        let annotations = match self.pipeline.analyze(&frame) {
            Ok(a) => a,
            Err(_) => return Some(StopReason::GalleryEmptied),
        };
        self.frames += 1;

        let now = self.clock.now();
        let cooldown = self.pipeline.policy().cooldown;
        for annotation in &annotations {
            let Some(event) = event_for(annotation, now) else {
                continue;
            };
            if self.dedup.should_emit(&event.identity, now, cooldown) {
                tracing::info!(identity = %event.identity, confidence = event.confidence, "recognized");
                self.events += 1;
                observer.on_event(&event);
            }
        }
        observer.on_frame(&frame, &annotations);
        None
    }

    /// Process frames until `stop` is raised or the stream ends.
    pub fn run(mut self, stop: &AtomicBool, observer: &mut dyn RecognitionObserver) -> StreamSummary {
        let reason = loop {
            if stop.load(Ordering::SeqCst) {
                break StopReason::Requested;
            }
            if let Some(reason) = self.step(observer) {
                break reason;
            }
        };

        tracing::info!(
            frames = self.frames,
            skipped = self.skipped,
            events = self.events,
            reason = ?reason,
            "stream session stopped"
        );
        StreamSummary {
            frames: self.frames,
            skipped: self.skipped,
            events: self.events,
            reason,
        }
    }
}
