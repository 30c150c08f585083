//! Class name tables and the vehicle label set.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};

/// COCO class names, in the order pretrained YOLO models emit them.
pub const COCO_CLASSES: &[&str] = &[
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat",
    "dog", "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack",
    "umbrella", "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball",
    "kite", "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket",
    "bottle", "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple",
    "sandwich", "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair",
    "couch", "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse",
    "remote", "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator",
    "book", "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

/// Labels that count toward lot occupancy.
pub const DEFAULT_VEHICLE_LABELS: &[&str] = &["car", "truck", "bus", "motorcycle"];

/// Class id of `car` in the COCO table.
pub const COCO_CAR_CLASS_ID: usize = 2;

pub type VehicleLabels = BTreeSet<String>;

pub fn default_vehicle_labels() -> VehicleLabels {
    DEFAULT_VEHICLE_LABELS.iter().map(|s| s.to_string()).collect()
}

pub fn coco_class_names() -> Vec<String> {
    COCO_CLASSES.iter().map(|s| s.to_string()).collect()
}

/// Case-insensitive membership test against a vehicle label set.
pub fn is_vehicle(labels: &VehicleLabels, label: &str) -> bool {
    let label = label.trim();
    labels.contains(label) || labels.iter().any(|l| l.eq_ignore_ascii_case(label))
}

/// Load a newline-separated class name file. Blank lines and `#` comments are skipped.
pub fn load_class_names(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read class names from {}", path.display()))?;
    let names: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();
    if names.is_empty() {
        return Err(anyhow!("class names file {} is empty", path.display()));
    }
    Ok(names)
}

/// Name for a class id, `object` when the table has no entry.
pub fn label_for(names: &[String], class_id: usize) -> String {
    names
        .get(class_id)
        .cloned()
        .unwrap_or_else(|| "object".to_string())
}
