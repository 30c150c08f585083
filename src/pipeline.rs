//! Degrading detection pipeline.
//!
//! One upload in, one report out. A loaded backend is invoked once per
//! image; without one the pipeline fabricates a clearly flagged simulated
//! report (or refuses, when simulation is disabled). Failures come back as
//! `PipelineError`, never as panics.

use std::panic::{catch_unwind, AssertUnwindSafe};

use image::RgbImage;
use rand::Rng;
use serde::Serialize;

use crate::annotate::{annotate, encode_for_transport, LabelStyle, DEFAULT_JPEG_QUALITY};
use crate::detect::labels::{default_vehicle_labels, is_vehicle, VehicleLabels};
use crate::detect::{panic_message, Detection, DetectionCapability, Resolution, SharedBackend};
use crate::estimate::{SpaceEstimate, SpaceEstimator};
use crate::simulate::{simulate, SimulationProfile};

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineOptions {
    pub simulate_on_missing_backend: bool,
    pub vehicle_labels: VehicleLabels,
    pub simulation: SimulationProfile,
    pub spaces: SpaceEstimator,
    pub jpeg_quality: u8,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            simulate_on_missing_backend: true,
            vehicle_labels: default_vehicle_labels(),
            simulation: SimulationProfile::default(),
            spaces: SpaceEstimator::default(),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// JSON body returned by `POST /detect`.
#[derive(Clone, Debug, Serialize)]
pub struct DetectionReport {
    pub success: bool,
    pub detections: Vec<Detection>,
    pub car_count: u32,
    pub empty_spaces: u32,
    pub total_spaces: u32,
    pub occupancy_rate: f64,
    pub annotated_image: Option<String>,
    pub message: String,
    pub is_simulation: bool,
    pub backend: &'static str,
    pub image_width: u32,
    pub image_height: u32,
}

#[derive(Debug)]
pub enum PipelineError {
    /// Upload had no bytes.
    EmptyImage,
    /// Upload could not be decoded as an image.
    Decode(String),
    /// No backend and simulation is disabled.
    BackendUnavailable(DetectionCapability),
    /// Backend returned an error or panicked.
    Backend(String),
    /// Annotated image could not be encoded.
    Encode(String),
}

impl PipelineError {
    /// HTTP status this failure maps to.
    pub fn status(&self) -> u16 {
        match self {
            PipelineError::EmptyImage => 400,
            PipelineError::BackendUnavailable(_) => 503,
            PipelineError::Decode(_) | PipelineError::Backend(_) | PipelineError::Encode(_) => 500,
        }
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::EmptyImage => write!(f, "Uploaded image is empty"),
            PipelineError::Decode(msg) => write!(f, "cannot decode image: {}", msg),
            PipelineError::BackendUnavailable(cap) => {
                write!(f, "no detection backend available ({})", cap)
            }
            PipelineError::Backend(msg) => write!(f, "detection failed: {}", msg),
            PipelineError::Encode(msg) => write!(f, "cannot encode annotated image: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {}

pub struct DetectionPipeline {
    capability: DetectionCapability,
    backend: Option<SharedBackend>,
    options: PipelineOptions,
}

impl DetectionPipeline {
    pub fn new(resolution: Resolution, options: PipelineOptions) -> Self {
        Self {
            capability: resolution.capability,
            backend: resolution.backend,
            options,
        }
    }

    pub fn capability(&self) -> DetectionCapability {
        self.capability
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Run detection on an uploaded, still-encoded image.
    pub fn detect_upload(&self, bytes: &[u8]) -> Result<DetectionReport, PipelineError> {
        self.detect_upload_with_rng(bytes, &mut rand::thread_rng())
    }

    pub fn detect_upload_with_rng<R: Rng + ?Sized>(
        &self,
        bytes: &[u8],
        rng: &mut R,
    ) -> Result<DetectionReport, PipelineError> {
        if bytes.is_empty() {
            return Err(PipelineError::EmptyImage);
        }
        let image = image::load_from_memory(bytes)
            .map_err(|e| PipelineError::Decode(e.to_string()))?
            .into_rgb8();
        self.detect_image_with_rng(&image, rng)
    }

    /// Run detection on a decoded image.
    pub fn detect_image_with_rng<R: Rng + ?Sized>(
        &self,
        image: &RgbImage,
        rng: &mut R,
    ) -> Result<DetectionReport, PipelineError> {
        match &self.backend {
            Some(backend) => self.detect_real(backend, image, rng),
            None if self.options.simulate_on_missing_backend => self.detect_simulated(image, rng),
            None => Err(PipelineError::BackendUnavailable(self.capability)),
        }
    }

    fn detect_real<R: Rng + ?Sized>(
        &self,
        backend: &SharedBackend,
        image: &RgbImage,
        rng: &mut R,
    ) -> Result<DetectionReport, PipelineError> {
        let detections = invoke_backend(backend, image)?;
        let vehicles = detections
            .iter()
            .filter(|d| is_vehicle(&self.options.vehicle_labels, &d.label))
            .count() as u32;
        let spaces = self.options.spaces.estimate(vehicles, rng);
        let annotated = annotate(image, &detections, LabelStyle::ClassAndConfidence);
        let message = format!(
            "AI Detection: Found {} vehicles, {} spaces available",
            vehicles, spaces.empty_spaces
        );
        log::debug!(
            "{} detections, {} vehicles, {}/{} spaces",
            detections.len(),
            vehicles,
            spaces.empty_spaces,
            spaces.total_spaces
        );
        self.report(detections, spaces, &annotated, message, false)
    }

    fn detect_simulated<R: Rng + ?Sized>(
        &self,
        image: &RgbImage,
        rng: &mut R,
    ) -> Result<DetectionReport, PipelineError> {
        let outcome = simulate(self.options.simulation, image, &self.options.spaces, rng);
        let message = format!(
            "Simulation: Detected {} cars (AI not available)",
            outcome.spaces.vehicle_count
        );
        self.report(
            outcome.detections,
            outcome.spaces,
            &outcome.annotated,
            message,
            true,
        )
    }

    fn report(
        &self,
        detections: Vec<Detection>,
        spaces: SpaceEstimate,
        annotated: &RgbImage,
        message: String,
        is_simulation: bool,
    ) -> Result<DetectionReport, PipelineError> {
        let encoded = encode_for_transport(annotated, self.options.jpeg_quality)
            .map_err(|e| PipelineError::Encode(format!("{:#}", e)))?;
        Ok(DetectionReport {
            success: true,
            detections,
            car_count: spaces.vehicle_count,
            empty_spaces: spaces.empty_spaces,
            total_spaces: spaces.total_spaces,
            occupancy_rate: spaces.occupancy_rate,
            annotated_image: Some(encoded),
            message,
            is_simulation,
            backend: self.capability.as_str(),
            image_width: annotated.width(),
            image_height: annotated.height(),
        })
    }
}

/// Lock the backend and run it once, converting errors and panics alike.
fn invoke_backend(
    backend: &SharedBackend,
    image: &RgbImage,
) -> Result<Vec<Detection>, PipelineError> {
    let mut guard = backend
        .lock()
        .map_err(|_| PipelineError::Backend("backend lock poisoned".into()))?;
    match catch_unwind(AssertUnwindSafe(|| guard.detect(image))) {
        Ok(Ok(detections)) => Ok(detections),
        Ok(Err(err)) => Err(PipelineError::Backend(format!("{:#}", err))),
        Err(panic) => Err(PipelineError::Backend(panic_message(panic.as_ref()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, DetectorBackend, StubBackend};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, image::Rgb([30, 60, 90]));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn stub_pipeline(dets: Vec<Detection>) -> DetectionPipeline {
        DetectionPipeline::new(
            Resolution::with_backend(StubBackend::with_detections(dets), None),
            PipelineOptions::default(),
        )
    }

    struct PanickingBackend;

    impl DetectorBackend for PanickingBackend {
        fn name(&self) -> &'static str {
            "panics"
        }

        fn detect(&mut self, _image: &RgbImage) -> anyhow::Result<Vec<Detection>> {
            panic!("tensor shape mismatch")
        }
    }

    #[test]
    fn counts_only_vehicle_labels() {
        let pipeline = stub_pipeline(vec![
            Detection::new(BoundingBox::new(1.0, 1.0, 20.0, 20.0), 0.9, 2, "car"),
            Detection::new(BoundingBox::new(30.0, 1.0, 60.0, 20.0), 0.8, 7, "truck"),
            Detection::new(BoundingBox::new(1.0, 30.0, 10.0, 60.0), 0.7, 0, "person"),
        ]);
        let mut rng = StdRng::seed_from_u64(1);
        let report = pipeline
            .detect_upload_with_rng(&png_bytes(64, 64), &mut rng)
            .unwrap();

        assert!(report.success);
        assert!(!report.is_simulation);
        assert_eq!(report.detections.len(), 3);
        assert_eq!(report.car_count, 2);
        assert_eq!(report.empty_spaces, report.total_spaces - report.car_count);
        assert!(report.total_spaces >= 15);
        assert_eq!((report.image_width, report.image_height), (64, 64));
        assert_eq!(report.backend, "real_model");
        assert!(report.message.starts_with("AI Detection: Found 2 vehicles"));
    }

    #[test]
    fn no_vehicles_still_reports_floor_capacity() {
        let pipeline = stub_pipeline(Vec::new());
        let report = pipeline.detect_upload(&png_bytes(16, 16)).unwrap();
        assert_eq!(report.car_count, 0);
        assert!(report.total_spaces >= 15);
        assert_eq!(report.empty_spaces, report.total_spaces);
        assert_eq!(report.occupancy_rate, 0.0);
    }

    #[test]
    fn missing_backend_simulates() {
        let pipeline = DetectionPipeline::new(
            Resolution::unavailable(DetectionCapability::MissingModel),
            PipelineOptions::default(),
        );
        let report = pipeline.detect_upload(&png_bytes(32, 32)).unwrap();
        assert!(report.is_simulation);
        assert!((8..=25).contains(&report.car_count));
        assert!(report.message.starts_with("Simulation:"));
        assert_eq!(report.backend, "missing_model");
    }

    #[test]
    fn missing_backend_without_simulation_is_unavailable() {
        let pipeline = DetectionPipeline::new(
            Resolution::unavailable(DetectionCapability::MissingDependency),
            PipelineOptions {
                simulate_on_missing_backend: false,
                ..PipelineOptions::default()
            },
        );
        let err = pipeline.detect_upload(&png_bytes(8, 8)).unwrap_err();
        assert_eq!(err.status(), 503);
    }

    // Smallest valid GIF89a: one white pixel.
    const GIF_1X1: &[u8] = b"GIF89a\x01\x00\x01\x00\x80\x00\x00\xff\xff\xff\x00\x00\x00!\xf9\x04\x01\x00\x00\x00\x00,\x00\x00\x00\x00\x01\x00\x01\x00\x00\x02\x02D\x01\x00;";

    fn encoded(width: u32, height: u32, format: image::ImageFormat) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, image::Rgb([120, 40, 200]));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, format).unwrap();
        out.into_inner()
    }

    #[test]
    fn accepts_gif_webp_and_tiff_uploads() {
        let pipeline = stub_pipeline(Vec::new());

        let report = pipeline.detect_upload(GIF_1X1).unwrap();
        assert!(report.success);
        assert_eq!((report.image_width, report.image_height), (1, 1));

        for format in [image::ImageFormat::WebP, image::ImageFormat::Tiff] {
            let report = pipeline.detect_upload(&encoded(24, 18, format)).unwrap();
            assert!(report.success, "{:?} upload failed", format);
            assert_eq!((report.image_width, report.image_height), (24, 18));
        }
    }

    #[test]
    fn empty_and_corrupt_uploads_are_errors() {
        let pipeline = stub_pipeline(Vec::new());
        assert_eq!(pipeline.detect_upload(&[]).unwrap_err().status(), 400);
        let err = pipeline.detect_upload(b"not an image at all").unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
        assert_eq!(err.status(), 500);
    }

    #[test]
    fn backend_failures_are_contained() {
        let failing = DetectionPipeline::new(
            Resolution::with_backend(StubBackend::failing("model exploded"), None),
            PipelineOptions::default(),
        );
        let err = failing.detect_upload(&png_bytes(8, 8)).unwrap_err();
        assert!(err.to_string().contains("model exploded"));

        let panicking = DetectionPipeline::new(
            Resolution::with_backend(PanickingBackend, None),
            PipelineOptions::default(),
        );
        let err = panicking.detect_upload(&png_bytes(8, 8)).unwrap_err();
        assert!(err.to_string().contains("tensor shape mismatch"));
        // The pipeline is still usable after a contained panic.
        let err = panicking.detect_upload(&png_bytes(8, 8)).unwrap_err();
        assert_eq!(err.status(), 500);
    }
}
