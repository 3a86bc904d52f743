use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::error::AppError;
use crate::models::coordinate::{OperatorId, PositionSample};
use crate::source::{PositionSource, PositionStream, SensorError};

type Delivery = Result<PositionSample, SensorError>;

/// Position source fed by devices pushing readings through the API.
///
/// Each `watch` opens a bounded channel for the operator; pushes block while
/// the consumer is behind, so samples are never dropped or reordered.
pub struct ChannelPositionSource {
    senders: DashMap<OperatorId, mpsc::Sender<Delivery>>,
    buffer: usize,
}

impl ChannelPositionSource {
    pub fn new(buffer: usize) -> Self {
        Self {
            senders: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    pub async fn push(&self, operator_id: &OperatorId, sample: PositionSample) -> Result<(), AppError> {
        self.deliver(operator_id, Ok(sample)).await
    }

    pub async fn report_error(&self, operator_id: &OperatorId, error: SensorError) -> Result<(), AppError> {
        self.deliver(operator_id, Err(error)).await
    }

    #[cfg(test)]
    fn is_watched(&self, operator_id: &OperatorId) -> bool {
        self.senders
            .get(operator_id)
            .is_some_and(|sender| !sender.is_closed())
    }

    async fn deliver(&self, operator_id: &OperatorId, delivery: Delivery) -> Result<(), AppError> {
        // Clone out so the map shard is not locked across the await.
        let sender = self
            .senders
            .get(operator_id)
            .map(|sender| sender.value().clone())
            .ok_or(AppError::NoActiveDuty)?;

        if sender.send(delivery).await.is_err() {
            self.senders
                .remove_if(operator_id, |_, current| current.same_channel(&sender));
            return Err(AppError::NoActiveDuty);
        }
        Ok(())
    }
}

impl PositionSource for ChannelPositionSource {
    fn watch(&self, operator_id: &OperatorId) -> Result<PositionStream, SensorError> {
        let (tx, rx) = mpsc::channel(self.buffer);
        if self.senders.insert(operator_id.clone(), tx).is_some() {
            debug!(operator_id = %operator_id, "replaced previous position watch");
        }
        Ok(ReceiverStream::new(rx).boxed())
    }

    fn release(&self, operator_id: &OperatorId) {
        self.senders.remove(operator_id);
    }
}
