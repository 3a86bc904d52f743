use crate::geo::haversine_km;
use crate::models::coordinate::Coordinate;

/// Running travelled distance for one tracking session.
///
/// Every consecutive pair of samples contributes its haversine distance,
/// GPS jitter included. There is no smoothing and no outlier rejection.
#[derive(Debug, Clone, Default)]
pub struct DistanceAccumulator {
    total_km: f64,
    last: Option<Coordinate>,
}

impl DistanceAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.total_km = 0.0;
        self.last = None;
    }

    /// Returns the total after applying `coordinate`.
    pub fn add_sample(&mut self, coordinate: Coordinate) -> f64 {
        if let Some(last) = self.last {
            self.total_km += haversine_km(&last, &coordinate);
        }
        self.last = Some(coordinate);
        self.total_km
    }

    pub fn total_km(&self) -> f64 {
        self.total_km
    }

    pub fn last(&self) -> Option<Coordinate> {
        self.last
    }
}
