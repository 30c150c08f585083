//! lot_probe - operator checks for the detection model
//!
//! `check-model` reports which tier resolves and what the model knows.
//! `detect` runs one image through the model and writes an annotated copy
//! per confidence threshold.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use lot_watch::annotate::{annotate, encode_jpeg, LabelStyle, DEFAULT_JPEG_QUALITY};
use lot_watch::detect::labels::is_vehicle;
use lot_watch::{Detection, ModelResolver, Resolution, ServiceConfig};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Model file tried before the configured candidates.
    #[arg(long, global = true)]
    model: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve the model and print what was loaded.
    CheckModel,
    /// Run detection on an image at one or more confidence thresholds.
    Detect {
        /// Image to analyze.
        image: PathBuf,
        /// Confidence threshold; repeat for several.
        #[arg(long = "conf", default_values_t = vec![0.1, 0.25, 0.5, 0.75])]
        confidences: Vec<f32>,
        /// Directory for result_conf_{conf}.jpg outputs.
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let mut config = ServiceConfig::load()?;
    if let Some(model) = args.model {
        config.model.candidates.insert(0, model);
    }

    match args.command {
        Command::CheckModel => check_model(config),
        Command::Detect {
            image,
            confidences,
            out,
        } => detect(config, &image, &confidences, &out),
    }
}

fn check_model(config: ServiceConfig) -> Result<()> {
    let resolver = ModelResolver::new(config.model);
    let settings = resolver.config();
    println!(
        "input {}px, confidence >= {}, iou {}",
        settings.input_size, settings.confidence_threshold, settings.iou_threshold
    );
    for attempt in resolver.attempts() {
        let status = if attempt.path.exists() { "present" } else { "missing" };
        println!("candidate {:?}: {} ({})", attempt.kind, attempt.path.display(), status);
    }

    let resolution = resolver.resolve();
    println!("backend: {}", resolution.capability);
    let Some(source) = &resolution.source else {
        println!("no model loaded; the service would fall back to simulation");
        return Ok(());
    };
    let size = fs::metadata(source)
        .with_context(|| format!("stat {}", source.display()))?
        .len();
    println!("model: {}", source.display());
    println!("size: {:.2} MB", size as f64 / (1024.0 * 1024.0));

    let (backend_name, names) = describe_backend(&resolution)?;
    println!("runtime: {}", backend_name);
    println!("classes: {}", names.len());
    for (id, name) in names.iter().enumerate() {
        println!("  {:>3}: {}", id, name);
    }
    Ok(())
}

fn detect(
    mut config: ServiceConfig,
    image_path: &Path,
    confidences: &[f32],
    out_dir: &Path,
) -> Result<()> {
    if confidences.is_empty() {
        return Err(anyhow!("at least one --conf value is required"));
    }
    if let Some(bad) = confidences.iter().find(|c| !(**c > 0.0 && **c <= 1.0)) {
        return Err(anyhow!("confidence {} is outside (0, 1]", bad));
    }
    let lowest = confidences.iter().copied().fold(f32::INFINITY, f32::min);
    config.model.confidence_threshold = lowest;

    let image = image::open(image_path)
        .with_context(|| format!("open {}", image_path.display()))?
        .into_rgb8();
    println!(
        "image: {} ({}x{})",
        image_path.display(),
        image.width(),
        image.height()
    );

    let resolution = ModelResolver::new(config.model).resolve();
    let backend = resolution
        .backend
        .as_ref()
        .ok_or_else(|| anyhow!("no detection model available ({})", resolution.capability))?;
    let all = {
        let mut guard = backend
            .lock()
            .map_err(|_| anyhow!("backend lock poisoned"))?;
        guard.detect(&image)?
    };

    fs::create_dir_all(out_dir).with_context(|| format!("create {}", out_dir.display()))?;
    for &conf in confidences {
        let kept: Vec<Detection> = all.iter().filter(|d| d.confidence >= conf).cloned().collect();
        let vehicles = kept
            .iter()
            .filter(|d| is_vehicle(&config.pipeline.vehicle_labels, &d.label))
            .count();
        println!();
        println!("conf >= {}: {} detections, {} vehicles", conf, kept.len(), vehicles);
        for (label, count) in count_by_label(&kept) {
            println!("  {}: {}", label, count);
        }

        let annotated = annotate(&image, &kept, LabelStyle::ClassAndConfidence);
        let path = out_dir.join(format!("result_conf_{}.jpg", conf));
        fs::write(&path, encode_jpeg(&annotated, DEFAULT_JPEG_QUALITY)?)
            .with_context(|| format!("write {}", path.display()))?;
        println!("  saved {}", path.display());
    }
    Ok(())
}

fn describe_backend(resolution: &Resolution) -> Result<(&'static str, Vec<String>)> {
    let backend = resolution
        .backend
        .as_ref()
        .ok_or_else(|| anyhow!("no backend loaded"))?;
    let guard = backend
        .lock()
        .map_err(|_| anyhow!("backend lock poisoned"))?;
    Ok((guard.name(), guard.class_names().to_vec()))
}

fn count_by_label(detections: &[Detection]) -> BTreeMap<&str, usize> {
    let mut counts = BTreeMap::new();
    for detection in detections {
        *counts.entry(detection.label.as_str()).or_insert(0) += 1;
    }
    counts
}
