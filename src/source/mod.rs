pub mod channel;

use futures::stream::BoxStream;
use thiserror::Error;

use crate::models::coordinate::{OperatorId, PositionSample};

pub use channel::ChannelPositionSource;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SensorError {
    #[error("location permission denied: {0}")]
    PermissionDenied(String),

    #[error("position unavailable: {0}")]
    Unavailable(String),

    #[error("timed out waiting for a position fix")]
    Timeout,
}

pub type PositionStream = BoxStream<'static, Result<PositionSample, SensorError>>;

/// A device's continuous coordinate feed.
///
/// The stream ends when the source gives up on the operator; errors inside
/// the stream are transient and later items may still arrive.
pub trait PositionSource: Send + Sync {
    fn watch(&self, operator_id: &OperatorId) -> Result<PositionStream, SensorError>;

    /// Called when the consumer cancels, so the source can drop any
    /// per-operator resources.
    fn release(&self, _operator_id: &OperatorId) {}
}
