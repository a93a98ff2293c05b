//! Face localizer backed by `rustface` (SeetaFace funnel-structured cascade).
//!
//! The three tuning knobs map onto the detector as follows: `scale_factor` is
//! the downscale between pyramid levels (rustface takes its reciprocal),
//! `score_threshold` trades recall for precision the way a neighbor-agreement
//! threshold does, and `min_size` is the smallest face searched for.

use crate::types::FaceRect;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

// --- Named constants ---
const DEFAULT_SCALE_FACTOR: f64 = 1.1;
const DEFAULT_SCORE_THRESHOLD: f64 = 2.0;
const DEFAULT_MIN_SIZE: u32 = 100;
/// rustface refuses smaller faces.
const MIN_FACE_SIZE_FLOOR: u32 = 20;
const SLIDE_WINDOW_STEP: u32 = 4;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("face model not found: {0} (set VIGIL_MODEL_PATH to seeta_fd_frontal_v1.0.bin)")]
    ModelNotFound(String),
    #[error("failed to read face model: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid face model: {0}")]
    Model(String),
    #[error("invalid detector parameters: {0}")]
    InvalidParams(String),
}

/// Tuning knobs of the multi-scale search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectParams {
    /// Downscale factor between successive pyramid levels (> 1).
    pub scale_factor: f64,
    /// Candidates scoring below this are dropped. Higher is stricter.
    pub score_threshold: f64,
    /// Smallest reported region side, in source pixels (>= 20).
    pub min_size: u32,
}

impl Default for DetectParams {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            min_size: DEFAULT_MIN_SIZE,
        }
    }
}

impl DetectParams {
    pub fn validate(&self) -> Result<(), DetectorError> {
        if !(self.scale_factor > 1.0 && self.scale_factor.is_finite()) {
            return Err(DetectorError::InvalidParams(format!(
                "scale factor must be greater than 1, got {}",
                self.scale_factor
            )));
        }
        if !self.score_threshold.is_finite() {
            return Err(DetectorError::InvalidParams(format!(
                "score threshold must be finite, got {}",
                self.score_threshold
            )));
        }
        if self.min_size < MIN_FACE_SIZE_FLOOR {
            return Err(DetectorError::InvalidParams(format!(
                "minimum face size must be at least {MIN_FACE_SIZE_FLOOR}, got {}",
                self.min_size
            )));
        }
        Ok(())
    }

    /// Pyramid scale in rustface's convention (0..1).
    fn pyramid_scale(&self) -> f32 {
        (1.0 / self.scale_factor) as f32
    }
}

/// Candidate face regions of one image. Finite and consumed once.
pub type Regions = std::vec::IntoIter<FaceRect>;

/// Anything that can find face regions in a grayscale image.
///
/// Implementations must be deterministic and must return no regions (rather
/// than fail) for an empty image.
pub trait FaceLocator: Send + Sync {
    fn locate(&self, image: &GrayImage) -> Regions;
}

/// SeetaFace frontal detector.
pub struct SeetaDetector {
    // rustface detectors are neither Sync nor reusable across threads; one is
    // built per call from the model bytes.
    model: Arc<[u8]>,
    params: DetectParams,
}

impl SeetaDetector {
    /// Load a SeetaFace model file (`seeta_fd_frontal_v1.0.bin`).
    pub fn load(model_path: &Path, params: DetectParams) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }
        let bytes = std::fs::read(model_path)?;
        let detector = Self::from_bytes(bytes, params)?;
        tracing::info!(path = %model_path.display(), ?params, "loaded face model");
        Ok(detector)
    }

    /// Validate `params` and the model bytes up front.
    pub fn from_bytes(bytes: Vec<u8>, params: DetectParams) -> Result<Self, DetectorError> {
        params.validate()?;
        rustface::read_model(Cursor::new(&bytes[..])).map_err(|e| DetectorError::Model(e.to_string()))?;
        Ok(Self {
            model: bytes.into(),
            params,
        })
    }

    pub fn params(&self) -> &DetectParams {
        &self.params
    }

    fn detector(&self) -> Result<Box<dyn rustface::Detector>, DetectorError> {
        let model = rustface::read_model(Cursor::new(&self.model[..]))
            .map_err(|e| DetectorError::Model(e.to_string()))?;
        let mut detector = rustface::create_detector_with_model(model);
        detector.set_min_face_size(self.params.min_size);
        detector.set_score_thresh(self.params.score_threshold);
        detector.set_pyramid_scale_factor(self.params.pyramid_scale());
        detector.set_slide_window_step(SLIDE_WINDOW_STEP, SLIDE_WINDOW_STEP);
        Ok(detector)
    }
}

impl FaceLocator for SeetaDetector {
    fn locate(&self, image: &GrayImage) -> Regions {
        let (width, height) = image.dimensions();
        if width < self.params.min_size || height < self.params.min_size {
            return Vec::new().into_iter();
        }
        let mut detector = match self.detector() {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "face detector unavailable");
                return Vec::new().into_iter();
            }
        };

        let faces = detector.detect(&rustface::ImageData::new(image.as_raw(), width, height));
        let candidates = faces.iter().map(|face| {
            let bbox = face.bbox();
            Candidate {
                x: bbox.x() as i64,
                y: bbox.y() as i64,
                width: bbox.width() as i64,
                height: bbox.height() as i64,
                score: face.score() as f64,
            }
        });
        let regions = to_regions(candidates, width, height);
        tracing::debug!(faces = regions.len(), "face localization");
        regions.into_iter()
    }
}

/// One raw detection in image coordinates; may extend past the borders.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    x: i64,
    y: i64,
    width: i64,
    height: i64,
    score: f64,
}

/// Clip candidates to the image, drop empty ones and order them by
/// descending score, then top-to-bottom, then left-to-right.
fn to_regions(candidates: impl IntoIterator<Item = Candidate>, width: u32, height: u32) -> Vec<FaceRect> {
    let (w, h) = (i64::from(width), i64::from(height));
    let mut kept: Vec<(f64, FaceRect)> = candidates
        .into_iter()
        .filter_map(|c| {
            let x0 = c.x.clamp(0, w);
            let y0 = c.y.clamp(0, h);
            let x1 = (c.x + c.width).clamp(0, w);
            let y1 = (c.y + c.height).clamp(0, h);
            (x1 > x0 && y1 > y0).then(|| {
                let rect = FaceRect::new(x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32);
                (c.score, rect)
            })
        })
        .collect();
    kept.sort_by(|(sa, a), (sb, b)| {
        sb.total_cmp(sa)
            .then(a.y.cmp(&b.y))
            .then(a.x.cmp(&b.x))
    });
    kept.into_iter().map(|(_, rect)| rect).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(x: i64, y: i64, width: i64, height: i64, score: f64) -> Candidate {
        Candidate { x, y, width, height, score }
    }

    #[test]
    fn test_default_params_are_valid() {
        let params = DetectParams::default();
        params.validate().unwrap();
        assert!((params.pyramid_scale() - 1.0 / 1.1).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_params() {
        for params in [
            DetectParams { scale_factor: 1.0, ..DetectParams::default() },
            DetectParams { scale_factor: f64::NAN, ..DetectParams::default() },
            DetectParams { score_threshold: f64::INFINITY, ..DetectParams::default() },
            DetectParams { min_size: 19, ..DetectParams::default() },
        ] {
            assert!(matches!(params.validate(), Err(DetectorError::InvalidParams(_))), "{params:?}");
        }
    }

    #[test]
    fn test_load_missing_model() {
        let result = SeetaDetector::load(Path::new("/nonexistent/seeta.bin"), DetectParams::default());
        assert!(matches!(result, Err(DetectorError::ModelNotFound(_))));
    }

    #[test]
    fn test_empty_model_is_rejected() {
        let result = SeetaDetector::from_bytes(Vec::new(), DetectParams::default());
        assert!(matches!(result, Err(DetectorError::Model(_))));
    }

    #[test]
    fn test_params_checked_before_model() {
        let params = DetectParams { min_size: 5, ..DetectParams::default() };
        let result = SeetaDetector::from_bytes(Vec::new(), params);
        assert!(matches!(result, Err(DetectorError::InvalidParams(_))));
    }

    #[test]
    fn test_regions_are_clipped_to_image() {
        let regions = to_regions(
            [candidate(-10, -5, 50, 40, 3.0), candidate(80, 90, 40, 40, 2.5)],
            100,
            100,
        );
        assert_eq!(
            regions,
            vec![FaceRect::new(0, 0, 40, 35), FaceRect::new(80, 90, 20, 10)]
        );
    }

    #[test]
    fn test_regions_outside_image_are_dropped() {
        let regions = to_regions(
            [candidate(120, 10, 30, 30, 5.0), candidate(-40, 10, 30, 30, 5.0)],
            100,
            100,
        );
        assert!(regions.is_empty());
    }

    #[test]
    fn test_regions_ordered_by_score_then_position() {
        let regions = to_regions(
            [
                candidate(60, 10, 20, 20, 2.0),
                candidate(10, 50, 20, 20, 4.0),
                candidate(10, 10, 20, 20, 2.0),
            ],
            100,
            100,
        );
        assert_eq!(
            regions,
            vec![
                FaceRect::new(10, 50, 20, 20),
                FaceRect::new(10, 10, 20, 20),
                FaceRect::new(60, 10, 20, 20),
            ]
        );
    }

    #[test]
    fn test_image_smaller_than_min_size_yields_nothing() {
        // Never reaches model parsing.
        let detector = SeetaDetector {
            model: Vec::new().into(),
            params: DetectParams::default(),
        };
        assert_eq!(detector.locate(&GrayImage::new(0, 0)).count(), 0);
        assert_eq!(detector.locate(&GrayImage::new(99, 400)).count(), 0);
    }

    #[test]
    fn test_unusable_model_yields_nothing() {
        let detector = SeetaDetector {
            model: Vec::new().into(),
            params: DetectParams::default(),
        };
        assert_eq!(detector.locate(&GrayImage::new(200, 200)).count(), 0);
    }
}
