use std::any::Any;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use image::RgbImage;

use crate::detect::result::Detection;

/// What kind of detection backend this process ended up with.
///
/// Computed once by model resolution and carried by the pipeline; it is never
/// recomputed per request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionCapability {
    /// A model was loaded and can run inference.
    RealModel,
    /// The inference runtime is available but no weights could be loaded.
    MissingModel,
    /// The inference runtime was not compiled into this build.
    MissingDependency,
}

impl DetectionCapability {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionCapability::RealModel => "real_model",
            DetectionCapability::MissingModel => "missing_model",
            DetectionCapability::MissingDependency => "missing_dependency",
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, DetectionCapability::RealModel)
    }
}

impl std::fmt::Display for DetectionCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detector backend trait.
///
/// Backends receive a decoded RGB image and return detections in the pixel
/// coordinates of that image. They must not keep the image past the call.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Class names indexed by class id, when the backend knows them.
    fn class_names(&self) -> &[String] {
        &[]
    }

    /// Run detection on an image.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Backend handle shared between request threads.
///
/// Wrapped in `Mutex` because `DetectorBackend::detect` takes `&mut self`.
pub type SharedBackend = Arc<Mutex<dyn DetectorBackend>>;

/// Text of a caught backend panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "backend panicked".to_string())
}
