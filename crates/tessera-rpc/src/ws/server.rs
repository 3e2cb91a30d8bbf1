use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use super::events::EventBroadcaster;

/// Router serving `/ws`
pub fn create_ws_router(broadcaster: Arc<EventBroadcaster>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(broadcaster)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(broadcaster): State<Arc<EventBroadcaster>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, broadcaster))
}

/// Forward events to one client until either side goes away
async fn handle_socket(socket: WebSocket, broadcaster: Arc<EventBroadcaster>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = broadcaster.subscribe();
    info!(
        "WebSocket subscriber connected ({} total)",
        broadcaster.subscriber_count()
    );

    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        warn!("WebSocket subscriber lagged {} events", n);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize event: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sender.send(Message::Text(json.into())).await {
                    debug!("WebSocket send failed: {}", e);
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!("WebSocket error: {}", e);
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    info!("WebSocket subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_router() {
        let broadcaster = Arc::new(EventBroadcaster::new(8));
        let _router = create_ws_router(broadcaster);
    }
}
