//! vigil-core: face localization, template gallery and recognition engine.
//!
//! Uses the SeetaFace cascade (via `rustface`) for face localization and
//! local binary pattern histograms (LBPH) for face recognition, both on the CPU.

pub mod detector;
pub mod gallery;
pub mod normalizer;
pub mod pipeline;
pub mod recognizer;
pub mod session;
pub mod types;

pub use detector::{DetectParams, DetectorError, FaceLocator, Regions, SeetaDetector};
pub use gallery::{Gallery, GalleryEntry};
pub use normalizer::{largest_region, normalize, NormalizeError};
pub use pipeline::{Pipeline, ReloadReport};
pub use recognizer::{LbphParams, ModelError, RecognitionModel};
pub use session::{
    confidence_percent, recognize_still, Clock, DedupState, FrameReport, FrameSource, Policy,
    RecognitionObserver, SessionError, SourceError, SourceOpener, StopReason, StreamSession,
    StreamSummary, SystemClock,
};
pub use types::{
    Annotation, FaceRect, FaceTemplate, Identity, MatchResult, Outcome, RecognitionEvent,
    TEMPLATE_SIZE,
};
