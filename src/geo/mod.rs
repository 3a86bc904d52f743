pub mod accumulator;

use crate::models::coordinate::Coordinate;

pub use accumulator::DistanceAccumulator;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters on a spherical Earth.
pub fn haversine_m(from: &Coordinate, to: &Coordinate) -> f64 {
    let lat1 = from.lat.to_radians();
    let lat2 = to.lat.to_radians();
    let delta_lat = (to.lat - from.lat).to_radians();
    let delta_lng = (to.lng - from.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().atan2((1.0 - haversine).sqrt());

    EARTH_RADIUS_M * central_angle
}

pub fn haversine_km(from: &Coordinate, to: &Coordinate) -> f64 {
    haversine_m(from, to) / 1000.0
}
