//! Latency models for the simulated network.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;

use crate::error::{DhtError, Result};

/// How long a simulated operation takes to reach the other side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LatencyType {
    None,
    /// Uniform between 5 and 250 ms, drawn from the simulator's seeded RNG.
    Random,
    /// Region to region delay from [`region_latency`].
    Real,
    Fixed,
}

const RANDOM_MIN_MS: f64 = 5.0;
const RANDOM_MAX_MS: f64 = 250.0;

/// Number of regions known to the `Real` model.
pub const REGION_COUNT: u32 = 16;

/// Representative city per region as (latitude, longitude).
const REGIONS: [(f64, f64); REGION_COUNT as usize] = [
    (60.17, 24.94),   // Helsinki
    (51.51, -0.13),   // London
    (50.11, 8.68),    // Frankfurt
    (48.86, 2.35),    // Paris
    (40.71, -74.01),  // New York
    (41.88, -87.63),  // Chicago
    (37.77, -122.42), // San Francisco
    (-23.55, -46.63), // Sao Paulo
    (19.08, 72.88),   // Mumbai
    (1.35, 103.82),   // Singapore
    (35.68, 139.69),  // Tokyo
    (37.57, 126.98),  // Seoul
    (-33.87, 151.21), // Sydney
    (-26.20, 28.05),  // Johannesburg
    (25.20, 55.27),   // Dubai
    (43.65, -79.38),  // Toronto
];

const EARTH_RADIUS_KM: f64 = 6371.0;
/// Light in fibre covers roughly 200 km per millisecond.
const FIBRE_KM_PER_MS: f64 = 200.0;
/// Real routes are longer than the great circle.
const ROUTE_FACTOR: f64 = 1.5;
const BASE_DELAY_MS: f64 = 1.0;

fn great_circle_km(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let h = ((lat2 - lat1) / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * ((lon2 - lon1) / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// One-way delay between two regions.
pub fn region_latency(from: u32, to: u32) -> Result<Duration> {
    let (Some(a), Some(b)) = (REGIONS.get(from as usize), REGIONS.get(to as usize)) else {
        return Err(DhtError::Configuration(format!(
            "invalid region index given to simulator: {from} -> {to}"
        )));
    };
    let ms = BASE_DELAY_MS + great_circle_km(*a, *b) * ROUTE_FACTOR / FIBRE_KM_PER_MS;
    Ok(Duration::from_secs_f64(ms / 1000.0))
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct LatencyModel {
    kind: LatencyType,
    fixed: Duration,
}

impl LatencyModel {
    pub(crate) fn new(kind: LatencyType, fixed: Option<Duration>) -> Result<Self> {
        let fixed = match (kind, fixed) {
            (LatencyType::Fixed, None) => {
                return Err(DhtError::Configuration(
                    "fixed latency requires a latency value".into(),
                ))
            }
            (_, value) => value.unwrap_or_default(),
        };
        Ok(Self { kind, fixed })
    }

    pub(crate) fn sample(
        &self,
        rng: &mut StdRng,
        from: Option<u32>,
        to: Option<u32>,
    ) -> Result<Duration> {
        match self.kind {
            LatencyType::None => Ok(Duration::ZERO),
            LatencyType::Fixed => Ok(self.fixed),
            LatencyType::Random => {
                let ms = rng.gen_range(RANDOM_MIN_MS..RANDOM_MAX_MS);
                Ok(Duration::from_secs_f64(ms / 1000.0))
            }
            LatencyType::Real => match (from, to) {
                (Some(from), Some(to)) => region_latency(from, to),
                _ => Err(DhtError::Configuration(
                    "real latency requires a region on both peers".into(),
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn fixed_latency_needs_a_value() {
        assert!(matches!(
            LatencyModel::new(LatencyType::Fixed, None),
            Err(DhtError::Configuration(_))
        ));
        let model = LatencyModel::new(LatencyType::Fixed, Some(Duration::from_millis(40))).expect("model");
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(model.sample(&mut rng, None, None).expect("sample"), Duration::from_millis(40));
    }

    #[test]
    fn region_matrix_is_symmetric_and_local_is_cheapest() {
        let local = region_latency(2, 2).expect("local");
        let across = region_latency(2, 12).expect("across");
        assert_eq!(across, region_latency(12, 2).expect("reverse"));
        assert!(local < across);
        assert!(across > Duration::from_millis(50));
    }

    #[test]
    fn out_of_range_region_is_a_configuration_error() {
        assert!(matches!(region_latency(0, REGION_COUNT), Err(DhtError::Configuration(_))));
        let model = LatencyModel::new(LatencyType::Real, None).expect("model");
        let mut rng = StdRng::seed_from_u64(1);
        assert!(model.sample(&mut rng, Some(1), None).is_err());
    }

    #[test]
    fn random_latency_stays_in_range() {
        let model = LatencyModel::new(LatencyType::Random, None).expect("model");
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let sample = model.sample(&mut rng, None, None).expect("sample");
            assert!(sample >= Duration::from_millis(5) && sample < Duration::from_millis(250));
        }
    }
}
