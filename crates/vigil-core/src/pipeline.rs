//! Shared recognition state: locator, gallery and the trained model.
//!
//! The gallery and model are immutable snapshots behind atomic pointers.
//! Readers take a snapshot per frame and never wait on a retrain; retrains
//! are serialized by a mutex and publish the gallery before the model.

use crate::detector::{FaceLocator, Regions};
use crate::gallery::{Gallery, GalleryEntry};
use crate::normalizer::{self, largest_region};
use crate::recognizer::{LbphParams, ModelError, RecognitionModel};
use crate::session::{confidence_percent, Policy, SessionError};
use crate::types::{Annotation, FaceTemplate};
use arc_swap::{ArcSwap, ArcSwapOption};
use image::GrayImage;
use std::sync::{Arc, Mutex};

/// What a reload produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadReport {
    pub entries: usize,
    pub trained: bool,
}

pub struct Pipeline {
    locator: Box<dyn FaceLocator>,
    lbph: LbphParams,
    policy: Policy,
    gallery: ArcSwap<Gallery>,
    model: ArcSwapOption<RecognitionModel>,
    retrain: Mutex<()>,
}

impl Pipeline {
    /// Create an untrained pipeline with an empty gallery.
    pub fn new(
        locator: Box<dyn FaceLocator>,
        lbph: LbphParams,
        policy: Policy,
    ) -> Result<Self, ModelError> {
        lbph.validate()?;
        Ok(Self {
            locator,
            lbph,
            policy,
            gallery: ArcSwap::from_pointee(Gallery::new()),
            model: ArcSwapOption::empty(),
            retrain: Mutex::new(()),
        })
    }

    /// Replace the gallery with `entries` and retrain the model from it.
    ///
    /// An empty gallery, or a failed training, leaves the model untrained.
    pub fn reload(&self, entries: Vec<GalleryEntry>) -> ReloadReport {
        let _guard = self.retrain.lock().unwrap_or_else(|e| e.into_inner());

        let gallery = Gallery::load(entries);
        let model = if gallery.is_empty() {
            tracing::info!("gallery is empty, model left untrained");
            None
        } else {
            match RecognitionModel::train(gallery.entries(), self.lbph) {
                Ok(model) => Some(Arc::new(model)),
                Err(e) => {
                    tracing::warn!(error = %e, "training failed, model left untrained");
                    None
                }
            }
        };

        let report = ReloadReport {
            entries: gallery.len(),
            trained: model.is_some(),
        };
        self.gallery.store(Arc::new(gallery));
        self.model.store(model);
        report
    }

    pub fn is_trained(&self) -> bool {
        self.model.load().is_some()
    }

    pub fn gallery(&self) -> Arc<Gallery> {
        self.gallery.load_full()
    }

    pub fn model(&self) -> Option<Arc<RecognitionModel>> {
        self.model.load_full()
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn locate(&self, image: &GrayImage) -> Regions {
        self.locator.locate(image)
    }

    /// Locate, normalize, match and classify every face of one image.
    ///
    /// Annotations follow detection order. Regions that cannot be normalized
    /// are skipped.
    pub fn analyze(&self, image: &GrayImage) -> Result<Vec<Annotation>, SessionError> {
        let model = self.model().ok_or(SessionError::NoEnrolledIdentities)?;
        let gallery = self.gallery();

        let mut annotations = Vec::new();
        for rect in self.locate(image) {
            let template = match normalizer::normalize(image, rect) {
                Ok(t) => t,
                Err(e) => {
                    tracing::debug!(error = %e, ?rect, "skipping region");
                    continue;
                }
            };
            let result = model.match_template(&template);
            let confidence = confidence_percent(result.distance);
            let outcome = self.policy.classify(&result, &gallery);
            tracing::debug!(
                identity = %result.identity,
                distance = result.distance,
                confidence,
                recognized = outcome.is_recognized(),
                "face matched"
            );
            annotations.push(Annotation {
                rect,
                outcome,
                distance: result.distance,
                confidence,
            });
        }
        Ok(annotations)
    }

    /// Template of the largest face in `image`, if any face is found.
    pub fn enrollment_template(&self, image: &GrayImage) -> Option<FaceTemplate> {
        let rect = largest_region(self.locate(image))?;
        normalizer::normalize(image, rect).ok()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::recognizer::tests::{blocks, entry, noise, stripes};
    use crate::types::{FaceRect, Identity, Outcome, TEMPLATE_SIZE};

    /// Reports the same regions for every image.
    pub(crate) struct FixedLocator(pub Vec<FaceRect>);

    impl FaceLocator for FixedLocator {
        fn locate(&self, image: &GrayImage) -> Regions {
            if image.width() == 0 || image.height() == 0 {
                return Vec::new().into_iter();
            }
            self.0.clone().into_iter()
        }
    }

    pub(crate) fn full_frame() -> FaceRect {
        FaceRect::new(0, 0, TEMPLATE_SIZE, TEMPLATE_SIZE)
    }

    pub(crate) fn pipeline_with(regions: Vec<FaceRect>) -> Pipeline {
        Pipeline::new(Box::new(FixedLocator(regions)), LbphParams::default(), Policy::default()).unwrap()
    }

    #[test]
    fn test_new_pipeline_is_untrained() {
        let pipeline = pipeline_with(vec![full_frame()]);
        assert!(!pipeline.is_trained());
        assert!(pipeline.gallery().is_empty());
        let frame = blocks(20, 200).image().clone();
        assert!(matches!(pipeline.analyze(&frame), Err(SessionError::NoEnrolledIdentities)));
    }

    #[test]
    fn test_reload_trains_and_empty_reload_untrains() {
        let pipeline = pipeline_with(vec![full_frame()]);
        let report = pipeline.reload(vec![entry("1", blocks(20, 200))]);
        assert_eq!(report, ReloadReport { entries: 1, trained: true });
        assert!(pipeline.is_trained());

        let report = pipeline.reload(Vec::new());
        assert_eq!(report, ReloadReport { entries: 0, trained: false });
        assert!(!pipeline.is_trained());
        assert!(pipeline.model().is_none());
    }

    #[test]
    fn test_analyze_recognizes_enrolled_face() {
        let pipeline = pipeline_with(vec![full_frame()]);
        pipeline.reload(vec![entry("1", blocks(20, 200)), entry("2", stripes())]);

        let annotations = pipeline.analyze(stripes().image()).unwrap();
        assert_eq!(annotations.len(), 1);
        assert_eq!(
            annotations[0].outcome,
            Outcome::Recognized { identity: Identity::from("2"), label: "Person 2".into() }
        );
        assert_eq!(annotations[0].confidence, 100);
        assert_eq!(annotations[0].distance, 0.0);
    }

    #[test]
    fn test_analyze_reports_unknown_for_noise() {
        let pipeline = pipeline_with(vec![full_frame()]);
        pipeline.reload(vec![entry("1", blocks(20, 200))]);
        let annotations = pipeline.analyze(noise(11).image()).unwrap();
        assert_eq!(annotations[0].outcome, Outcome::Unknown);
    }

    #[test]
    fn test_analyze_keeps_detection_order() {
        let left = FaceRect::new(0, 0, 100, 100);
        let right = FaceRect::new(100, 100, 100, 100);
        let pipeline = pipeline_with(vec![right, left]);
        pipeline.reload(vec![entry("1", stripes())]);
        let rects: Vec<FaceRect> = pipeline
            .analyze(stripes().image())
            .unwrap()
            .into_iter()
            .map(|a| a.rect)
            .collect();
        assert_eq!(rects, vec![right, left]);
    }

    #[test]
    fn test_no_regions_no_annotations() {
        let pipeline = pipeline_with(Vec::new());
        pipeline.reload(vec![entry("1", stripes())]);
        assert!(pipeline.analyze(stripes().image()).unwrap().is_empty());
    }

    #[test]
    fn test_deleted_identity_is_unresolved_with_stale_model() {
        let pipeline = pipeline_with(vec![full_frame()]);
        pipeline.reload(vec![entry("1", stripes()), entry("2", blocks(20, 200))]);
        // Publish a gallery without "1" while keeping the old model.
        pipeline.gallery.store(Arc::new(Gallery::load(vec![entry("2", blocks(20, 200))])));

        let annotations = pipeline.analyze(stripes().image()).unwrap();
        assert_eq!(annotations[0].outcome, Outcome::Unresolved { identity: Identity::from("1") });
        assert_eq!(annotations[0].outcome.label(), "Unknown");
    }

    #[test]
    fn test_delete_then_reload_drops_template() {
        let pipeline = pipeline_with(vec![full_frame()]);
        pipeline.reload(vec![entry("1", blocks(20, 200)), entry("2", stripes())]);
        pipeline.reload(vec![entry("1", blocks(20, 200))]);

        assert!(!pipeline.gallery().contains(&Identity::from("2")));
        let model = pipeline.model().unwrap();
        assert_eq!(model.len(), 1);
        assert_eq!(model.match_template(&stripes()).identity, Identity::from("1"));
    }

    #[test]
    fn test_enrollment_template_uses_largest_region() {
        let small = FaceRect::new(0, 0, 20, 20);
        let large = FaceRect::new(0, 0, 200, 200);
        let pipeline = pipeline_with(vec![small, large]);
        let image = stripes().image().clone();
        let template = pipeline.enrollment_template(&image).unwrap();
        assert_eq!(template, stripes());
    }

    #[test]
    fn test_enrollment_template_without_face() {
        let pipeline = pipeline_with(Vec::new());
        assert!(pipeline.enrollment_template(stripes().image()).is_none());
    }
}
