mod backend;
pub mod backends;
pub mod labels;
pub mod resolve;
mod result;

pub(crate) use backend::panic_message;
pub use backend::{DetectionCapability, DetectorBackend, SharedBackend};
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use labels::{is_vehicle, VehicleLabels, COCO_CLASSES, DEFAULT_VEHICLE_LABELS};
pub use resolve::{ModelResolver, Resolution, ResolverConfig};
pub use result::{non_max_suppression, BoundingBox, Detection};
