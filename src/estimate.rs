//! Parking space estimate.
//!
//! The service has no lot geometry, so total capacity is a cosmetic guess:
//! the vehicle count inflated by a small random increment, never below a
//! fixed floor.

use std::ops::RangeInclusive;

use rand::Rng;

pub const DEFAULT_SPACE_FLOOR: u32 = 15;
pub const DEFAULT_SPACE_INCREMENT: RangeInclusive<u32> = 5..=15;

#[derive(Clone, Debug, PartialEq)]
pub struct SpaceEstimator {
    pub floor: u32,
    pub increment: RangeInclusive<u32>,
}

impl Default for SpaceEstimator {
    fn default() -> Self {
        Self {
            floor: DEFAULT_SPACE_FLOOR,
            increment: DEFAULT_SPACE_INCREMENT,
        }
    }
}

impl SpaceEstimator {
    pub fn new(floor: u32, increment: RangeInclusive<u32>) -> Self {
        Self { floor, increment }
    }

    /// Estimate for a real detection: `max(floor, vehicles + increment)`.
    pub fn estimate<R: Rng + ?Sized>(&self, vehicle_count: u32, rng: &mut R) -> SpaceEstimate {
        let total = vehicle_count
            .saturating_add(self.draw_increment(rng))
            .max(self.floor);
        SpaceEstimate::from_counts(vehicle_count, total)
    }

    /// Estimate for the simulation tier: `vehicles + increment`, no floor.
    pub fn simulated<R: Rng + ?Sized>(&self, vehicle_count: u32, rng: &mut R) -> SpaceEstimate {
        let total = vehicle_count.saturating_add(self.draw_increment(rng));
        SpaceEstimate::from_counts(vehicle_count, total)
    }

    fn draw_increment<R: Rng + ?Sized>(&self, rng: &mut R) -> u32 {
        if self.increment.is_empty() {
            return *self.increment.start();
        }
        rng.gen_range(self.increment.clone())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpaceEstimate {
    pub vehicle_count: u32,
    pub total_spaces: u32,
    pub empty_spaces: u32,
    pub occupancy_rate: f64,
}

impl SpaceEstimate {
    /// Build an estimate, raising `total_spaces` to `vehicle_count` if needed
    /// so `empty_spaces` never goes negative.
    pub fn from_counts(vehicle_count: u32, total_spaces: u32) -> Self {
        let total_spaces = total_spaces.max(vehicle_count);
        Self {
            vehicle_count,
            total_spaces,
            empty_spaces: total_spaces - vehicle_count,
            occupancy_rate: occupancy_rate(vehicle_count, total_spaces),
        }
    }
}

/// Percentage of occupied spaces; 0 for an empty lot with no capacity.
pub fn occupancy_rate(vehicle_count: u32, total_spaces: u32) -> f64 {
    if total_spaces == 0 {
        return 0.0;
    }
    100.0 * vehicle_count as f64 / total_spaces as f64
}
