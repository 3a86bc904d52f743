pub mod coordinate;
pub mod duty;
pub mod live_location;
