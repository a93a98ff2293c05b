//! LBPH face recognizer.
//!
//! Describes each template by a grid of rotation-invariant local binary
//! pattern histograms and matches a probe against every enrolled signature
//! with the alternative chi-square distance.
//!
//! Distance scale: each cell contributes at most 4, so an 8×8 grid ranges over
//! `[0, 256]`. Identical templates score exactly 0 and same-person matches
//! typically fall well below 100.

use crate::gallery::GalleryEntry;
use crate::types::{FaceTemplate, Identity, MatchResult, TEMPLATE_SIZE};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use thiserror::Error;

// --- Named constants ---
const DEFAULT_RADIUS: u32 = 1;
const DEFAULT_NEIGHBORS: u32 = 8;
const DEFAULT_GRID: u32 = 8;
const MAX_NEIGHBORS: u32 = 16;
/// Interpolated samples this close to the center count as equal to it.
const EQUAL_TOLERANCE: f64 = 1e-6;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ModelError {
    #[error("cannot train on an empty gallery")]
    EmptyGallery,
    #[error("invalid LBPH parameters: {0}")]
    InvalidParams(String),
}

/// LBPH operator and grid configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LbphParams {
    pub radius: u32,
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            radius: DEFAULT_RADIUS,
            neighbors: DEFAULT_NEIGHBORS,
            grid_x: DEFAULT_GRID,
            grid_y: DEFAULT_GRID,
        }
    }
}

impl LbphParams {
    pub fn validate(&self) -> Result<(), ModelError> {
        if !(1..=MAX_NEIGHBORS).contains(&self.neighbors) {
            return Err(ModelError::InvalidParams(format!(
                "neighbors must be within 1..={MAX_NEIGHBORS}, got {}",
                self.neighbors
            )));
        }
        if self.radius == 0 || 2 * self.radius >= TEMPLATE_SIZE {
            return Err(ModelError::InvalidParams(format!(
                "radius {} does not fit a {TEMPLATE_SIZE}px template",
                self.radius
            )));
        }
        let span = TEMPLATE_SIZE - 2 * self.radius;
        if self.grid_x == 0 || self.grid_y == 0 || self.grid_x > span || self.grid_y > span {
            return Err(ModelError::InvalidParams(format!(
                "grid {}x{} does not fit a {span}px code image",
                self.grid_x, self.grid_y
            )));
        }
        Ok(())
    }
}

/// Bilinear sampling point on the circle around a center pixel.
#[derive(Debug, Clone, Copy)]
struct Sample {
    fx: isize,
    fy: isize,
    cx: isize,
    cy: isize,
    w1: f64,
    w2: f64,
    w3: f64,
    w4: f64,
}

/// Computes template signatures for one parameter set.
#[derive(Debug, Clone)]
struct Extractor {
    params: LbphParams,
    samples: Vec<Sample>,
    /// Raw LBP code → rotation-invariant class.
    class_of: Vec<u16>,
    classes: usize,
}

impl Extractor {
    fn new(params: LbphParams) -> Self {
        let n = params.neighbors;
        let r = params.radius as f64;

        let samples = (0..n)
            .map(|i| {
                let angle = 2.0 * PI * i as f64 / n as f64;
                let x = r * angle.cos();
                let y = -r * angle.sin();
                let (fx, fy) = (x.floor(), y.floor());
                let (cx, cy) = (x.ceil(), y.ceil());
                let (tx, ty) = (x - fx, y - fy);
                Sample {
                    fx: fx as isize,
                    fy: fy as isize,
                    cx: cx as isize,
                    cy: cy as isize,
                    w1: (1.0 - tx) * (1.0 - ty),
                    w2: tx * (1.0 - ty),
                    w3: (1.0 - tx) * ty,
                    w4: tx * ty,
                }
            })
            .collect();

        let (class_of, classes) = rotation_invariant_classes(n);
        Self { params, samples, class_of, classes }
    }

    fn bins(&self) -> usize {
        (self.params.grid_x * self.params.grid_y) as usize * self.classes
    }

    /// Circular LBP code of the pixel at `(x, y)`; all samples must be in bounds.
    fn code_at(&self, pixels: &[u8], stride: usize, x: usize, y: usize) -> usize {
        let at = |dx: isize, dy: isize| -> f64 {
            let px = (x as isize + dx) as usize;
            let py = (y as isize + dy) as usize;
            pixels[py * stride + px] as f64
        };
        let center = pixels[y * stride + x] as f64;

        let mut code = 0usize;
        for (bit, s) in self.samples.iter().enumerate() {
            let t = s.w1 * at(s.fx, s.fy)
                + s.w2 * at(s.cx, s.fy)
                + s.w3 * at(s.fx, s.cy)
                + s.w4 * at(s.cx, s.cy);
            if t > center || (t - center).abs() < EQUAL_TOLERANCE {
                code |= 1 << bit;
            }
        }
        code
    }

    /// Concatenated per-cell class histograms, each normalized to sum 1.
    fn signature(&self, template: &FaceTemplate) -> Vec<f32> {
        let image = template.image();
        let stride = image.width() as usize;
        let pixels = image.as_raw();
        let r = self.params.radius as usize;
        let (grid_x, grid_y) = (self.params.grid_x as usize, self.params.grid_y as usize);
        let cell_w = (image.width() as usize - 2 * r) / grid_x;
        let cell_h = (image.height() as usize - 2 * r) / grid_y;

        let mut hist = vec![0.0f32; self.bins()];
        for y in 0..grid_y * cell_h {
            let row = (y / cell_h) * grid_x;
            for x in 0..grid_x * cell_w {
                let cell = row + x / cell_w;
                let code = self.code_at(pixels, stride, x + r, y + r);
                hist[cell * self.classes + self.class_of[code] as usize] += 1.0;
            }
        }

        let scale = 1.0 / (cell_w * cell_h) as f32;
        for v in &mut hist {
            *v *= scale;
        }
        hist
    }
}

/// Map every `n`-bit code to the index of its minimum circular rotation.
///
/// Class indices follow ascending order of the canonical (minimum) code.
fn rotation_invariant_classes(n: u32) -> (Vec<u16>, usize) {
    let size = 1usize << n;
    let mask = size - 1;
    let canonical: Vec<usize> = (0..size)
        .map(|code| {
            (0..n)
                .map(|k| ((code >> k) | (code << (n - k))) & mask)
                .min()
                .unwrap_or(code)
        })
        .collect();

    let mut index = vec![u16::MAX; size];
    let mut classes = 0usize;
    for code in 0..size {
        // A code that is its own minimum rotation opens a new class.
        if canonical[code] == code {
            index[code] = classes as u16;
            classes += 1;
        }
    }
    let class_of = canonical.iter().map(|&c| index[c]).collect();
    (class_of, classes)
}

/// Alternative chi-square distance: `2 · Σ (a−b)² / (a+b)` over non-empty bins.
fn chi_square(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&a, &b)| {
            let (a, b) = (a as f64, b as f64);
            let sum = a + b;
            if sum > f64::EPSILON {
                (a - b) * (a - b) / sum
            } else {
                0.0
            }
        })
        .sum::<f64>()
        * 2.0
}

/// A trained nearest-template classifier.
///
/// Immutable once built; retraining produces a new model.
#[derive(Debug, Clone)]
pub struct RecognitionModel {
    extractor: Extractor,
    identities: Vec<Identity>,
    signatures: Vec<Vec<f32>>,
}

impl RecognitionModel {
    /// Fit a model over every gallery entry.
    pub fn train(entries: &[GalleryEntry], params: LbphParams) -> Result<Self, ModelError> {
        params.validate()?;
        if entries.is_empty() {
            return Err(ModelError::EmptyGallery);
        }

        let extractor = Extractor::new(params);
        let signatures = entries
            .iter()
            .map(|e| extractor.signature(&e.template))
            .collect();
        let identities = entries.iter().map(|e| e.identity.clone()).collect();

        tracing::info!(
            entries = entries.len(),
            bins = extractor.bins(),
            classes = extractor.classes,
            "LBPH model trained"
        );

        Ok(Self { extractor, identities, signatures })
    }

    /// Closest enrolled identity and its distance.
    ///
    /// Equidistant signatures resolve to one of them; which one is not
    /// guaranteed.
    pub fn match_template(&self, template: &FaceTemplate) -> MatchResult {
        let probe = self.extractor.signature(template);

        let mut best = 0usize;
        let mut best_distance = f64::INFINITY;
        for (i, signature) in self.signatures.iter().enumerate() {
            let distance = chi_square(&probe, signature);
            if distance < best_distance {
                best_distance = distance;
                best = i;
            }
        }

        MatchResult {
            identity: self.identities[best].clone(),
            distance: best_distance,
        }
    }

    /// Number of enrolled signatures (always at least one).
    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    pub fn params(&self) -> &LbphParams {
        &self.extractor.params
    }
}
