//! Model resolution: find the best detection backend this process can run.
//!
//! Tiers are tried in order: custom weights at each configured candidate
//! path, then the generic pretrained model in the cache directory (fetched
//! on first use when a download URL is configured). Failing every tier is
//! not an error; the caller gets a `Resolution` without a backend and
//! degrades to simulation.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};

use crate::detect::backend::{panic_message, DetectionCapability, DetectorBackend, SharedBackend};

pub const DEFAULT_MODEL_CANDIDATES: &[&str] = &["models/parking_model.onnx", "parking_model.onnx"];
pub const DEFAULT_PRETRAINED_MODEL: &str = "yolov8n.onnx";
pub const DEFAULT_MODEL_CACHE_DIR: &str = "models";
pub const DEFAULT_INPUT_SIZE: u32 = 640;
pub const DEFAULT_CONFIDENCE: f32 = 0.25;
pub const DEFAULT_IOU: f32 = 0.45;

#[cfg(feature = "model-download")]
const MAX_MODEL_DOWNLOAD_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq)]
pub struct ResolverConfig {
    /// Custom weights, most preferred first.
    pub candidates: Vec<PathBuf>,
    /// File name of the generic pretrained model inside `cache_dir`.
    pub pretrained: String,
    pub cache_dir: PathBuf,
    /// Where to fetch the pretrained model from when it is not cached.
    pub download_url: Option<String>,
    /// Newline-separated class names; COCO names when unset.
    pub class_names_path: Option<PathBuf>,
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            candidates: DEFAULT_MODEL_CANDIDATES.iter().map(PathBuf::from).collect(),
            pretrained: DEFAULT_PRETRAINED_MODEL.to_string(),
            cache_dir: PathBuf::from(DEFAULT_MODEL_CACHE_DIR),
            download_url: None,
            class_names_path: None,
            input_size: DEFAULT_INPUT_SIZE,
            confidence_threshold: DEFAULT_CONFIDENCE,
            iou_threshold: DEFAULT_IOU,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptKind {
    Custom,
    Pretrained,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelAttempt {
    pub kind: AttemptKind,
    pub path: PathBuf,
}

/// Outcome of model resolution. Built once per process and handed to the
/// pipeline.
#[derive(Clone)]
pub struct Resolution {
    pub capability: DetectionCapability,
    pub backend: Option<SharedBackend>,
    /// Weights file the backend was loaded from.
    pub source: Option<PathBuf>,
}

impl Resolution {
    pub fn with_backend<B: DetectorBackend + 'static>(backend: B, source: Option<PathBuf>) -> Self {
        Self {
            capability: DetectionCapability::RealModel,
            backend: Some(Arc::new(Mutex::new(backend))),
            source,
        }
    }

    pub fn unavailable(capability: DetectionCapability) -> Self {
        Self {
            capability,
            backend: None,
            source: None,
        }
    }
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolution")
            .field("capability", &self.capability)
            .field("has_backend", &self.backend.is_some())
            .field("source", &self.source)
            .finish()
    }
}

pub struct ModelResolver {
    cfg: ResolverConfig,
}

impl ModelResolver {
    pub fn new(cfg: ResolverConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.cfg
    }

    /// Paths tried by `resolve`, in order.
    pub fn attempts(&self) -> Vec<ModelAttempt> {
        let mut attempts: Vec<ModelAttempt> = self
            .cfg
            .candidates
            .iter()
            .map(|path| ModelAttempt {
                kind: AttemptKind::Custom,
                path: path.clone(),
            })
            .collect();
        attempts.push(ModelAttempt {
            kind: AttemptKind::Pretrained,
            path: self.cfg.cache_dir.join(&self.cfg.pretrained),
        });
        attempts
    }

    /// Walk the tiers and return the first backend that loads.
    pub fn resolve(&self) -> Resolution {
        if !cfg!(feature = "backend-tract") {
            log::warn!("object detection runtime not built in (feature backend-tract); using simulation");
            return Resolution::unavailable(DetectionCapability::MissingDependency);
        }

        for attempt in self.attempts() {
            let path = &attempt.path;
            match attempt.kind {
                AttemptKind::Custom => {
                    if !path.exists() {
                        log::info!("custom model not found at {}", path.display());
                        continue;
                    }
                    log::info!("loading custom parking model from {}", path.display());
                }
                AttemptKind::Pretrained => {
                    if !path.exists() {
                        if let Err(err) = self.fetch_pretrained(path) {
                            log::warn!("pretrained model unavailable: {:#}", err);
                            continue;
                        }
                    }
                    log::info!("loading pretrained model from {}", path.display());
                }
            }

            match load_guarded(|| self.load(path)) {
                Ok(backend) => {
                    let fingerprint = fingerprint(path).unwrap_or_else(|_| "unknown".into());
                    log::info!(
                        "{} backend loaded from {} (sha256 {})",
                        backend.name(),
                        path.display(),
                        fingerprint
                    );
                    return Resolution {
                        capability: DetectionCapability::RealModel,
                        backend: Some(Arc::new(Mutex::new(BoxedBackend(backend)))),
                        source: Some(path.clone()),
                    };
                }
                Err(err) => {
                    log::warn!("error loading model from {}: {:#}", path.display(), err);
                }
            }
        }

        log::warn!("no detection model could be loaded; using simulation");
        Resolution::unavailable(DetectionCapability::MissingModel)
    }

    /// Class names the backend will report.
    pub fn class_names(&self) -> Result<Vec<String>> {
        match &self.cfg.class_names_path {
            Some(path) => crate::detect::labels::load_class_names(path),
            None => Ok(crate::detect::labels::coco_class_names()),
        }
    }

    #[cfg(feature = "backend-tract")]
    fn load(&self, path: &Path) -> Result<Box<dyn DetectorBackend>> {
        let backend = crate::detect::backends::TractBackend::new(
            path,
            self.cfg.input_size,
            self.class_names()?,
        )?
        .with_thresholds(self.cfg.confidence_threshold, self.cfg.iou_threshold);
        Ok(Box::new(backend))
    }

    #[cfg(not(feature = "backend-tract"))]
    fn load(&self, path: &Path) -> Result<Box<dyn DetectorBackend>> {
        Err(anyhow!(
            "cannot load {}: built without backend-tract",
            path.display()
        ))
    }

    fn fetch_pretrained(&self, dest: &Path) -> Result<()> {
        let url = self.cfg.download_url.as_deref().ok_or_else(|| {
            anyhow!(
                "{} not cached and no download url configured",
                dest.display()
            )
        })?;
        log::info!("fetching pretrained model from {}", url);
        download(url, dest)
    }
}

/// Load and warm up a backend. A panic in either step is reported as an
/// error so one bad weights file only skips its tier.
fn load_guarded<F>(load: F) -> Result<Box<dyn DetectorBackend>>
where
    F: FnOnce() -> Result<Box<dyn DetectorBackend>>,
{
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let mut backend = load()?;
        backend.warm_up().context("warm-up failed")?;
        Ok(backend)
    }));
    match outcome {
        Ok(result) => result,
        Err(panic) => Err(anyhow!("model panicked: {}", panic_message(panic.as_ref()))),
    }
}

/// Owned backend behind the shared handle.
struct BoxedBackend(Box<dyn DetectorBackend>);

impl DetectorBackend for BoxedBackend {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn class_names(&self) -> &[String] {
        self.0.class_names()
    }

    fn detect(&mut self, image: &image::RgbImage) -> Result<Vec<crate::detect::Detection>> {
        self.0.detect(image)
    }

    fn warm_up(&mut self) -> Result<()> {
        self.0.warm_up()
    }
}

#[cfg(feature = "model-download")]
fn download(url: &str, dest: &Path) -> Result<()> {
    use std::io::Read;

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create model cache dir {}", parent.display()))?;
    }
    let response = ureq::get(url)
        .call()
        .with_context(|| format!("fetch model from {}", url))?;
    let partial = dest.with_extension("part");
    let mut file = std::fs::File::create(&partial)
        .with_context(|| format!("create {}", partial.display()))?;
    let written = std::io::copy(
        &mut response.into_reader().take(MAX_MODEL_DOWNLOAD_BYTES),
        &mut file,
    )
    .context("write downloaded model")?;
    if written == 0 {
        let _ = std::fs::remove_file(&partial);
        return Err(anyhow!("model download from {} was empty", url));
    }
    file.sync_all()?;
    std::fs::rename(&partial, dest)
        .with_context(|| format!("move downloaded model to {}", dest.display()))?;
    log::info!("cached {} bytes at {}", written, dest.display());
    Ok(())
}

#[cfg(not(feature = "model-download"))]
fn download(url: &str, _dest: &Path) -> Result<()> {
    Err(anyhow!(
        "cannot fetch {}: built without model-download",
        url
    ))
}

/// Short SHA-256 fingerprint of a weights file for the status log.
pub fn fingerprint(path: &Path) -> Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("read {} for hashing", path.display()))?;
    let digest = Sha256::digest(&bytes);
    Ok(hex::encode(&digest[..6]))
}
