//! Engine glue: keeps the recognition pipeline in sync with the person store
//! and runs live recognition on a dedicated camera thread.

use crate::store::{PersonFields, PersonStore, StoreError, StoredPerson};
use image::GrayImage;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use vigil_core::{
    recognize_still, Clock, FrameReport, FrameSource, GalleryEntry, Identity, Pipeline,
    RecognitionObserver, ReloadReport, SessionError, SourceError, SourceOpener, StreamSession,
    StreamSummary, SystemClock,
};
use vigil_hw::{Camera, CameraError, CameraStream};

/// Frames read before giving up on a still capture.
const CAPTURE_ATTEMPTS: usize = 5;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("failed to load image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("no face detected in the image")]
    NoFaceDetected,
    #[error("no usable frame after {0} attempts")]
    NoFrame(usize),
    #[error("failed to spawn stream thread: {0}")]
    Spawn(std::io::Error),
    #[error("stream thread exited")]
    ChannelClosed,
}

/// Person store plus the shared recognition pipeline built from it.
pub struct Engine<S: PersonStore> {
    store: S,
    pipeline: Arc<Pipeline>,
    clock: Arc<dyn Clock>,
}

impl<S: PersonStore> Engine<S> {
    /// Wrap a store and pipeline and train from the current store contents.
    pub fn new(store: S, pipeline: Pipeline) -> Result<Self, EngineError> {
        Self::with_clock(store, pipeline, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, pipeline: Pipeline, clock: Arc<dyn Clock>) -> Result<Self, EngineError> {
        let engine = Self {
            store,
            pipeline: Arc::new(pipeline),
            clock,
        };
        engine.reload()?;
        Ok(engine)
    }

    pub fn pipeline(&self) -> Arc<Pipeline> {
        self.pipeline.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Rebuild the gallery from the store and retrain.
    pub fn reload(&self) -> Result<ReloadReport, EngineError> {
        let entries = gallery_entries(self.store.list_all()?);
        let report = self.pipeline.reload(entries);
        tracing::info!(entries = report.entries, trained = report.trained, "gallery reloaded");
        Ok(report)
    }

    /// Enroll the largest face of `image` under `identity`.
    pub fn enroll_image(
        &mut self,
        identity: &Identity,
        fields: PersonFields,
        image: &GrayImage,
    ) -> Result<ReloadReport, EngineError> {
        let fields = fields.normalized();
        fields.validate()?;
        let template = self
            .pipeline
            .enrollment_template(image)
            .ok_or(EngineError::NoFaceDetected)?;
        self.store.enroll(identity, &fields, &template)?;
        self.reload()
    }

    pub fn enroll_file(
        &mut self,
        identity: &Identity,
        fields: PersonFields,
        path: &Path,
    ) -> Result<ReloadReport, EngineError> {
        let image = load_grayscale(path)?;
        self.enroll_image(identity, fields, &image)
    }

    pub fn update(&mut self, identity: &Identity, fields: PersonFields) -> Result<ReloadReport, EngineError> {
        self.store.update(identity, &fields.normalized())?;
        self.reload()
    }

    pub fn delete(&mut self, identity: &Identity) -> Result<ReloadReport, EngineError> {
        self.store.delete(identity)?;
        self.reload()
    }

    pub fn list(&self) -> Result<Vec<StoredPerson>, EngineError> {
        Ok(self.store.list_all()?)
    }

    /// Recognize every face of a still image; one event per recognized face.
    pub fn recognize_image(&self, image: &GrayImage) -> Result<FrameReport, EngineError> {
        Ok(recognize_still(&self.pipeline, image, self.clock.as_ref())?)
    }

    pub fn recognize_file(&self, path: &Path) -> Result<FrameReport, EngineError> {
        let image = load_grayscale(path)?;
        self.recognize_image(&image)
    }
}

fn gallery_entries(persons: Vec<StoredPerson>) -> Vec<GalleryEntry> {
    persons
        .into_iter()
        .filter_map(|p| {
            let label = p.fields.display_name();
            p.template.map(|template| GalleryEntry {
                identity: p.identity,
                label,
                template,
            })
        })
        .collect()
}

/// Decode any supported image file to 8-bit grayscale.
pub fn load_grayscale(path: &Path) -> Result<GrayImage, EngineError> {
    let image = image::open(path).map_err(|source| EngineError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(image.to_luma8())
}

/// Opens the configured camera, or probes for one.
#[derive(Debug, Clone)]
pub struct CameraOpener {
    /// Device path; `None` probes `/dev/video0..2`.
    pub device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub warmup: Duration,
}

impl SourceOpener for CameraOpener {
    type Source = CameraSource;

    fn open(&self) -> Result<CameraSource, SourceError> {
        let stream = match &self.device {
            Some(path) => Camera::open(path, self.width, self.height)
                .and_then(|camera| camera.into_stream(self.warmup)),
            None => vigil_hw::open_auto(self.width, self.height, self.warmup),
        }
        .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        let camera = stream.camera();
        tracing::info!(
            device = %camera.device_path,
            width = camera.width,
            height = camera.height,
            fourcc = ?camera.fourcc,
            "camera opened"
        );
        Ok(CameraSource { stream })
    }
}

/// Live camera frames as a [`FrameSource`]. The camera never ends on its own.
pub struct CameraSource {
    stream: CameraStream,
}

impl FrameSource for CameraSource {
    fn read_frame(&mut self) -> Result<Option<GrayImage>, SourceError> {
        match self.stream.next_frame() {
            Ok(frame) => frame
                .into_image()
                .map(Some)
                .map_err(|e| SourceError::InvalidFrame(e.to_string())),
            Err(CameraError::Frame(e)) => Err(SourceError::InvalidFrame(e.to_string())),
            Err(e) => Err(SourceError::Disconnected(e.to_string())),
        }
    }
}

/// Open a source, read one usable frame and close it again.
pub fn capture_still<O: SourceOpener>(opener: &O) -> Result<GrayImage, EngineError> {
    let mut source = opener.open().map_err(SessionError::from)?;
    for attempt in 1..=CAPTURE_ATTEMPTS {
        match source.read_frame() {
            Ok(Some(frame)) => return Ok(frame),
            Ok(None) => break,
            Err(SourceError::InvalidFrame(reason)) => {
                tracing::debug!(attempt, %reason, "discarding invalid frame");
            }
            Err(e) => return Err(SessionError::from(e).into()),
        }
    }
    Err(EngineError::NoFrame(CAPTURE_ATTEMPTS))
}

/// Handle to a running stream session.
pub struct StreamHandle {
    stop: Arc<AtomicBool>,
    done: oneshot::Receiver<StreamSummary>,
}

impl StreamHandle {
    /// Ask the session to stop before it pulls its next frame.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Wait for the session to end. Cancel-safe.
    pub async fn wait(&mut self) -> Result<StreamSummary, EngineError> {
        (&mut self.done).await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Start a live session on a dedicated OS thread.
///
/// The source is opened on that thread; this returns once the session is
/// active, or with the reason it could not start.
pub async fn start_stream<O, R>(
    pipeline: Arc<Pipeline>,
    opener: O,
    mut observer: R,
    clock: Arc<dyn Clock>,
) -> Result<StreamHandle, EngineError>
where
    O: SourceOpener + Send + 'static,
    R: RecognitionObserver + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let (started_tx, started_rx) = oneshot::channel::<Result<(), SessionError>>();
    let (done_tx, done_rx) = oneshot::channel();

    let thread_stop = stop.clone();
    std::thread::Builder::new()
        .name("vigil-stream".into())
        .spawn(move || {
            let session = match StreamSession::start(pipeline, &opener, clock) {
                Ok(session) => {
                    let _ = started_tx.send(Ok(()));
                    session
                }
                Err(e) => {
                    let _ = started_tx.send(Err(e));
                    return;
                }
            };
            tracing::info!("stream thread started");
            let summary = session.run(&thread_stop, &mut observer);
            let _ = done_tx.send(summary);
            tracing::info!("stream thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    started_rx.await.map_err(|_| EngineError::ChannelClosed)??;
    Ok(StreamHandle { stop, done: done_rx })
}
