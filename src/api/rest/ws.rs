use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{Sink, SinkExt, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::models::live_location::LiveLocationEntry;
use crate::registry::{FeedEvents, FeedNotice, LiveLocationRegistry, RegistryEvent};
use crate::state::AppState;

/// Pushed to dispatcher consoles: the mutation that triggered the update (if
/// known) plus the full registry as of right after it.
#[derive(Serialize)]
struct LiveUpdate {
    event: Option<RegistryEvent>,
    locations: Vec<LiveLocationEntry>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (sender, mut receiver) = socket.split();

    // Subscribe before the initial snapshot so nothing falls in between.
    let (events, unsubscribe) = state.registry.subscribe();

    info!("observer connected");

    let registry = state.registry.clone();
    let send_task = tokio::spawn(async move { forward_updates(&registry, events, sender).await });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    unsubscribe.unsubscribe();
    info!("observer disconnected");
}

/// Sends a snapshot right away, then a fresh snapshot per notice, until the
/// subscription closes or the sink fails.
async fn forward_updates<S>(registry: &LiveLocationRegistry, mut events: FeedEvents, mut sink: S)
where
    S: Sink<Message> + Unpin,
{
    let mut update = LiveUpdate {
        event: None,
        locations: registry.snapshot(),
    };

    loop {
        match serde_json::to_string(&update) {
            Ok(json) => {
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!(error = %err, "failed to serialize live update for ws"),
        }

        let event = match events.recv().await {
            Some(FeedNotice::Changed(event)) => Some(event),
            Some(FeedNotice::Resync { missed }) => {
                warn!(missed, "observer lagged; resending snapshot");
                None
            }
            None => break,
        };
        update = LiveUpdate {
            event,
            locations: registry.snapshot(),
        };
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::channel::mpsc;
    use serde_json::Value;

    use super::*;
    use crate::clock::SystemClock;
    use crate::models::coordinate::{Coordinate, OperatorId};
    use crate::registry::ChangeFeed;

    async fn next_update(rx: &mut mpsc::UnboundedReceiver<Message>) -> Value {
        let message = tokio::time::timeout(Duration::from_secs(1), rx.next())
            .await
            .expect("no update in time")
            .expect("sink closed");
        match message {
            Message::Text(json) => serde_json::from_str(&json).unwrap(),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn observer_gets_snapshot_then_update_per_change() {
        let registry = Arc::new(LiveLocationRegistry::new(ChangeFeed::new(16), Arc::new(SystemClock)));
        let a = OperatorId::new("op-a").unwrap();
        registry.upsert(&a, Coordinate::new(19.07, 72.87).unwrap());

        let (events, unsubscribe) = registry.subscribe();
        let (tx, mut rx) = mpsc::unbounded();
        let forwarder = {
            let registry = registry.clone();
            tokio::spawn(async move { forward_updates(&registry, events, tx).await })
        };

        let initial = next_update(&mut rx).await;
        assert!(initial["event"].is_null());
        assert_eq!(initial["locations"][0]["operator_id"], "op-a");

        registry.upsert(&a, Coordinate::new(19.08, 72.87).unwrap());
        let moved = next_update(&mut rx).await;
        assert_eq!(moved["event"]["kind"], "Upserted");
        assert_eq!(moved["locations"][0]["coordinate"]["lat"], 19.08);

        registry.remove(&a);
        let removed = next_update(&mut rx).await;
        assert_eq!(removed["event"]["kind"], "Removed");
        assert_eq!(removed["locations"].as_array().unwrap().len(), 0);

        unsubscribe.unsubscribe();
        tokio::time::timeout(Duration::from_secs(1), forwarder)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(registry.subscriber_count(), 0);
    }
}
