//! Lot Watch
//!
//! Counts vehicles in a still photo of a parking lot and estimates how many
//! spaces are left.
//!
//! # Architecture
//!
//! Detection degrades in tiers. At startup the resolver tries a custom
//! parking model, then a general pretrained model, and falls back to a
//! simulated detector when neither loads. Every report says which tier
//! produced it, so a simulated answer is never mistaken for a real one.
//!
//! # Module Structure
//!
//! - `detect`: Backend trait, YOLO output decoding, model resolution
//! - `estimate`: Space total / occupancy arithmetic
//! - `simulate`: Synthetic detections when no model is available
//! - `annotate`: Box and label overlay, JPEG + base64 encoding
//! - `pipeline`: One upload in, one `DetectionReport` out
//! - `api`: HTTP surface (`/`, `/health`, `/detect`)
//! - `config`: JSON file + environment configuration

pub mod annotate;
pub mod api;
pub mod config;
pub mod detect;
pub mod estimate;
pub mod pipeline;
pub mod simulate;

pub use api::{ApiConfig, ApiHandle, ApiServer};
pub use config::ServiceConfig;
pub use detect::{
    BoundingBox, Detection, DetectionCapability, DetectorBackend, ModelResolver, Resolution,
    ResolverConfig,
};
pub use estimate::{SpaceEstimate, SpaceEstimator};
pub use pipeline::{DetectionPipeline, DetectionReport, PipelineError, PipelineOptions};
pub use simulate::SimulationProfile;
