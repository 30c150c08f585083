use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::labels::coco_class_names;
use crate::detect::result::Detection;

/// Scripted backend. Returns the same detections for every image, clipped to
/// the image bounds, or a fixed error.
pub struct StubBackend {
    detections: Vec<Detection>,
    failure: Option<String>,
    class_names: Vec<String>,
    calls: usize,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            detections: Vec::new(),
            failure: None,
            class_names: coco_class_names(),
            calls: 0,
        }
    }

    pub fn with_detections(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            ..Self::new()
        }
    }

    /// Backend whose every `detect` call fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>> {
        self.calls += 1;
        if let Some(message) = &self.failure {
            return Err(anyhow!("{}", message));
        }
        let (width, height) = image.dimensions();
        Ok(self
            .detections
            .iter()
            .map(|det| Detection {
                bbox: det.bbox.clamp_to(width, height),
                ..det.clone()
            })
            .filter(|det| det.bbox.is_valid())
            .collect())
    }
}
