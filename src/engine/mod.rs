pub mod duty;
pub mod eviction;
pub mod session;
