//! Simulation tier: plausible-looking results when no model is available.

use std::ops::RangeInclusive;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use image::RgbImage;
use rand::Rng;

use crate::annotate::{annotate, LabelStyle};
use crate::detect::labels::COCO_CAR_CLASS_ID;
use crate::detect::{BoundingBox, Detection};
use crate::estimate::{SpaceEstimate, SpaceEstimator};

const SYNTHETIC_WIDTH: RangeInclusive<u32> = 80..=150;
const SYNTHETIC_HEIGHT: RangeInclusive<u32> = 60..=100;
const SYNTHETIC_MARGIN: u32 = 50;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SimulationProfile {
    /// Busy lot: 8 to 25 cars, no boxes, image returned as uploaded.
    #[default]
    FullLot,
    /// Sparse lot: 3 to 8 cars drawn as synthetic boxes.
    FewCars,
}

impl SimulationProfile {
    pub fn vehicle_range(&self) -> RangeInclusive<u32> {
        match self {
            SimulationProfile::FullLot => 8..=25,
            SimulationProfile::FewCars => 3..=8,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SimulationProfile::FullLot => "full_lot",
            SimulationProfile::FewCars => "few_cars",
        }
    }
}

impl FromStr for SimulationProfile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full_lot" | "full" => Ok(SimulationProfile::FullLot),
            "few_cars" | "few" => Ok(SimulationProfile::FewCars),
            other => Err(anyhow!(
                "unknown simulation profile '{}'; expected full_lot or few_cars",
                other
            )),
        }
    }
}

/// Fabricated detection outcome for one image.
#[derive(Clone, Debug)]
pub struct SimulatedOutcome {
    pub detections: Vec<Detection>,
    pub spaces: SpaceEstimate,
    pub annotated: RgbImage,
}

pub fn simulate<R: Rng + ?Sized>(
    profile: SimulationProfile,
    image: &RgbImage,
    estimator: &SpaceEstimator,
    rng: &mut R,
) -> SimulatedOutcome {
    let vehicles = rng.gen_range(profile.vehicle_range());
    let spaces = estimator.simulated(vehicles, rng);
    match profile {
        SimulationProfile::FullLot => SimulatedOutcome {
            detections: Vec::new(),
            spaces,
            annotated: image.clone(),
        },
        SimulationProfile::FewCars => {
            let (width, height) = image.dimensions();
            let detections: Vec<Detection> = (0..vehicles)
                .map(|_| synthetic_car(width, height, rng))
                .collect();
            let annotated = annotate(image, &detections, LabelStyle::Index);
            SimulatedOutcome {
                detections,
                spaces,
                annotated,
            }
        }
    }
}

/// Random car-sized box kept inside the image, inset by a margin when the
/// image is large enough for one.
fn synthetic_car<R: Rng + ?Sized>(width: u32, height: u32, rng: &mut R) -> Detection {
    let w = rng.gen_range(SYNTHETIC_WIDTH).min(width.max(1));
    let h = rng.gen_range(SYNTHETIC_HEIGHT).min(height.max(1));
    let x = place(width, w, rng);
    let y = place(height, h, rng);
    let confidence = (rng.gen_range(0.70f32..=0.95) * 100.0).round() / 100.0;
    Detection::new(
        BoundingBox::new(x as f32, y as f32, (x + w) as f32, (y + h) as f32),
        confidence,
        COCO_CAR_CLASS_ID,
        "car",
    )
}

fn place<R: Rng + ?Sized>(extent: u32, size: u32, rng: &mut R) -> u32 {
    let max_start = extent.saturating_sub(size);
    if max_start > SYNTHETIC_MARGIN * 2 {
        rng.gen_range(SYNTHETIC_MARGIN..=max_start - SYNTHETIC_MARGIN)
    } else {
        rng.gen_range(0..=max_start)
    }
}
