use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::api::{ApiConfig, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_UPLOAD_BYTES};
use crate::detect::labels::VehicleLabels;
use crate::detect::ResolverConfig;
use crate::estimate::SpaceEstimator;
use crate::pipeline::PipelineOptions;
use crate::simulate::SimulationProfile;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 5000;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ServiceConfigFile {
    host: Option<String>,
    port: Option<u16>,
    max_upload_bytes: Option<usize>,
    max_connections: Option<usize>,
    model: Option<ModelConfigFile>,
    pipeline: Option<PipelineConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ModelConfigFile {
    candidates: Option<Vec<PathBuf>>,
    pretrained: Option<String>,
    cache_dir: Option<PathBuf>,
    download_url: Option<String>,
    class_names_path: Option<PathBuf>,
    input_size: Option<u32>,
    confidence: Option<f32>,
    iou: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PipelineConfigFile {
    simulate_on_missing_backend: Option<bool>,
    simulation: Option<String>,
    vehicle_labels: Option<Vec<String>>,
    space_floor: Option<u32>,
    space_increment: Option<[u32; 2]>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub max_upload_bytes: usize,
    pub max_connections: usize,
    pub model: ResolverConfig,
    pub pipeline: PipelineOptions,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            model: ResolverConfig::default(),
            pipeline: PipelineOptions::default(),
        }
    }
}

impl ServiceConfig {
    /// Defaults, then the JSON file named by `LOT_WATCH_CONFIG`, then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("LOT_WATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Listen address for the API server.
    pub fn api_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            addr: self.api_addr(),
            max_upload_bytes: self.max_upload_bytes,
            max_connections: self.max_connections,
        }
    }

    fn from_file(file: ServiceConfigFile) -> Result<Self> {
        let defaults = Self::default();
        let model_file = file.model.unwrap_or_default();
        let model = ResolverConfig {
            candidates: model_file.candidates.unwrap_or(defaults.model.candidates),
            pretrained: model_file.pretrained.unwrap_or(defaults.model.pretrained),
            cache_dir: model_file.cache_dir.unwrap_or(defaults.model.cache_dir),
            download_url: model_file.download_url,
            class_names_path: model_file.class_names_path,
            input_size: model_file.input_size.unwrap_or(defaults.model.input_size),
            confidence_threshold: model_file
                .confidence
                .unwrap_or(defaults.model.confidence_threshold),
            iou_threshold: model_file.iou.unwrap_or(defaults.model.iou_threshold),
        };

        let pipeline_file = file.pipeline.unwrap_or_default();
        let simulation = match pipeline_file.simulation.as_deref() {
            Some(name) => name.parse::<SimulationProfile>()?,
            None => defaults.pipeline.simulation,
        };
        let vehicle_labels = match pipeline_file.vehicle_labels {
            Some(labels) => normalize_labels(labels),
            None => defaults.pipeline.vehicle_labels,
        };
        let spaces = SpaceEstimator::new(
            pipeline_file
                .space_floor
                .unwrap_or(defaults.pipeline.spaces.floor),
            match pipeline_file.space_increment {
                Some([lo, hi]) => lo..=hi,
                None => defaults.pipeline.spaces.increment,
            },
        );
        let pipeline = PipelineOptions {
            simulate_on_missing_backend: pipeline_file
                .simulate_on_missing_backend
                .unwrap_or(defaults.pipeline.simulate_on_missing_backend),
            vehicle_labels,
            simulation,
            spaces,
            jpeg_quality: pipeline_file
                .jpeg_quality
                .unwrap_or(defaults.pipeline.jpeg_quality),
        };

        Ok(Self {
            host: file.host.unwrap_or(defaults.host),
            port: file.port.unwrap_or(defaults.port),
            max_upload_bytes: file.max_upload_bytes.unwrap_or(defaults.max_upload_bytes),
            max_connections: file.max_connections.unwrap_or(defaults.max_connections),
            model,
            pipeline,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(port) = non_empty_env("PORT") {
            self.port = port
                .parse()
                .map_err(|_| anyhow!("PORT must be a port number, got '{}'", port))?;
        }
        if let Some(host) = non_empty_env("LOT_WATCH_HOST") {
            self.host = host;
        }
        if let Some(path) = non_empty_env("LOT_WATCH_MODEL_PATH") {
            self.model.candidates.insert(0, PathBuf::from(path));
        }
        if let Some(url) = non_empty_env("LOT_WATCH_MODEL_URL") {
            self.model.download_url = Some(url);
        }
        if let Some(conf) = non_empty_env("LOT_WATCH_CONFIDENCE") {
            self.model.confidence_threshold = conf
                .parse()
                .map_err(|_| anyhow!("LOT_WATCH_CONFIDENCE must be a number in (0, 1]"))?;
        }
        if let Some(profile) = non_empty_env("LOT_WATCH_SIMULATION") {
            self.pipeline.simulation = profile.parse()?;
        }
        if let Some(flag) = non_empty_env("LOT_WATCH_SIMULATE") {
            self.pipeline.simulate_on_missing_backend = parse_bool(&flag)
                .ok_or_else(|| anyhow!("LOT_WATCH_SIMULATE must be true or false"))?;
        }
        if let Some(labels) = non_empty_env("LOT_WATCH_VEHICLE_LABELS") {
            let parsed = split_csv(&labels);
            if !parsed.is_empty() {
                self.pipeline.vehicle_labels = normalize_labels(parsed);
            }
        }
        if let Some(limit) = non_empty_env("LOT_WATCH_MAX_UPLOAD_BYTES") {
            self.max_upload_bytes = limit
                .parse()
                .map_err(|_| anyhow!("LOT_WATCH_MAX_UPLOAD_BYTES must be an integer"))?;
        }
        if let Some(limit) = non_empty_env("LOT_WATCH_MAX_CONNECTIONS") {
            self.max_connections = limit
                .parse()
                .map_err(|_| anyhow!("LOT_WATCH_MAX_CONNECTIONS must be an integer"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let conf = self.model.confidence_threshold;
        if !(conf > 0.0 && conf <= 1.0) {
            return Err(anyhow!("confidence threshold must be in (0, 1], got {}", conf));
        }
        let iou = self.model.iou_threshold;
        if !(iou > 0.0 && iou <= 1.0) {
            return Err(anyhow!("iou threshold must be in (0, 1], got {}", iou));
        }
        if self.model.input_size == 0 || self.model.input_size % 32 != 0 {
            return Err(anyhow!(
                "model input size must be a positive multiple of 32, got {}",
                self.model.input_size
            ));
        }
        if self.pipeline.vehicle_labels.is_empty() {
            return Err(anyhow!("vehicle label set must not be empty"));
        }
        if self.pipeline.spaces.increment.is_empty() {
            return Err(anyhow!(
                "space increment range {:?} is empty",
                self.pipeline.spaces.increment
            ));
        }
        if self.max_upload_bytes == 0 {
            return Err(anyhow!("max upload size must be greater than zero"));
        }
        if self.max_connections == 0 {
            return Err(anyhow!("max connections must be greater than zero"));
        }
        if self.pipeline.jpeg_quality == 0 || self.pipeline.jpeg_quality > 100 {
            return Err(anyhow!("jpeg quality must be in 1..=100"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ServiceConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn normalize_labels(labels: Vec<String>) -> VehicleLabels {
    labels
        .into_iter()
        .map(|label| label.trim().to_lowercase())
        .filter(|label| !label.is_empty())
        .collect()
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
