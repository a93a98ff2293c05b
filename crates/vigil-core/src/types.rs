use chrono::{DateTime, Local};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Side length of every normalized face template, in pixels.
pub const TEMPLATE_SIZE: u32 = 200;

/// Stable key of one enrolled person (their registration number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Axis-aligned face region in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Clamp the region to an image of the given size.
    ///
    /// A region lying entirely outside the image collapses to the nearest
    /// 1×1 border pixel. Returns `None` only for an empty image.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<FaceRect> {
        if width == 0 || height == 0 {
            return None;
        }
        let x = self.x.min(width - 1);
        let y = self.y.min(height - 1);
        let w = self.width.min(width - x).max(1);
        let h = self.height.min(height - y).max(1);
        Some(FaceRect::new(x, y, w, h))
    }
}

/// A normalized `TEMPLATE_SIZE`×`TEMPLATE_SIZE` grayscale face crop.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceTemplate(GrayImage);

impl FaceTemplate {
    /// Wrap an image, rejecting anything that is not template-sized.
    pub fn from_image(image: GrayImage) -> Option<Self> {
        (image.width() == TEMPLATE_SIZE && image.height() == TEMPLATE_SIZE).then_some(Self(image))
    }

    /// Rebuild a template from its stored row-major pixel buffer.
    pub fn from_raw(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        GrayImage::from_raw(width, height, pixels).and_then(Self::from_image)
    }

    pub fn image(&self) -> &GrayImage {
        &self.0
    }

    pub fn width(&self) -> u32 {
        self.0.width()
    }

    pub fn height(&self) -> u32 {
        self.0.height()
    }

    /// Row-major pixel buffer (`width * height` bytes).
    pub fn as_raw(&self) -> &[u8] {
        self.0.as_raw()
    }
}

/// Closest gallery template for one probe. Lower distance = better match.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub identity: Identity,
    pub distance: f64,
}

/// Policy decision for one detected face.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// Close enough and the identity is still enrolled.
    Recognized { identity: Identity, label: String },
    /// Close enough, but the identity is no longer in the gallery.
    Unresolved { identity: Identity },
    /// Distance at or above the match threshold.
    Unknown,
}

impl Outcome {
    pub fn is_recognized(&self) -> bool {
        matches!(self, Outcome::Recognized { .. })
    }

    /// Text drawn next to the face region.
    pub fn label(&self) -> &str {
        match self {
            Outcome::Recognized { label, .. } => label,
            Outcome::Unresolved { .. } => "Unknown",
            Outcome::Unknown => "Unknown person",
        }
    }
}

/// Rendering instruction for one face of a processed frame or image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Annotation {
    pub rect: FaceRect,
    pub outcome: Outcome,
    pub distance: f64,
    pub confidence: u8,
}

/// A recognition worth reporting to the audit log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionEvent {
    pub identity: Identity,
    pub label: String,
    pub timestamp: DateTime<Local>,
    pub confidence: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_inside_is_unchanged() {
        let r = FaceRect::new(10, 20, 30, 40);
        assert_eq!(r.clamp_to(100, 100), Some(r));
    }

    #[test]
    fn test_clamp_overshoot_is_trimmed() {
        let r = FaceRect::new(80, 90, 50, 50);
        assert_eq!(r.clamp_to(100, 100), Some(FaceRect::new(80, 90, 20, 10)));
    }

    #[test]
    fn test_clamp_outside_collapses_to_border_pixel() {
        let r = FaceRect::new(500, 500, 10, 10);
        assert_eq!(r.clamp_to(100, 50), Some(FaceRect::new(99, 49, 1, 1)));
    }

    #[test]
    fn test_clamp_empty_image() {
        assert_eq!(FaceRect::new(0, 0, 1, 1).clamp_to(0, 10), None);
    }

    #[test]
    fn test_template_rejects_wrong_size() {
        assert!(FaceTemplate::from_image(GrayImage::new(100, 100)).is_none());
        assert!(FaceTemplate::from_raw(TEMPLATE_SIZE, TEMPLATE_SIZE, vec![0; 10]).is_none());
        let ok = FaceTemplate::from_raw(
            TEMPLATE_SIZE,
            TEMPLATE_SIZE,
            vec![7; (TEMPLATE_SIZE * TEMPLATE_SIZE) as usize],
        );
        assert!(ok.is_some_and(|t| t.as_raw().iter().all(|&p| p == 7)));
    }

    #[test]
    fn test_outcome_labels() {
        let id = Identity::from("A-1");
        let recognized = Outcome::Recognized { identity: id.clone(), label: "Ada Lovelace".into() };
        assert_eq!(recognized.label(), "Ada Lovelace");
        assert!(recognized.is_recognized());
        assert_eq!(Outcome::Unresolved { identity: id }.label(), "Unknown");
        assert_eq!(Outcome::Unknown.label(), "Unknown person");
    }
}
