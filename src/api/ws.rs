//! Live event push over WebSocket.
//!
//! The server streams event envelopes as they are emitted. The client may
//! send one `subscribe` control message to request a replay starting point
//! and `ping` to keep the connection alive. A per-client overflow surfaces
//! as a `{"type":"gap","from":N}` control frame.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde::Deserialize;

use crate::event_bus::{Event, StreamItem};
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { from_sequence: Option<u64> },
    Ping,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut rx = state.bus.subscribe(None).rx;
    // Highest sequence already delivered; replay is filtered against it so
    // a late subscribe never duplicates frames.
    let mut sent_up_to: u64 = 0;

    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(StreamItem::Event(event)) => {
                    if event.sequence <= sent_up_to {
                        continue;
                    }
                    sent_up_to = event.sequence;
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
                Some(StreamItem::Gap { from }) => {
                    let frame = serde_json::json!({ "type": "gap", "from": from });
                    if send_text(&mut socket, frame.to_string()).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            message = socket.recv() => match message {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientMessage>(text.as_str()) {
                        Ok(ClientMessage::Subscribe { from_sequence }) => {
                            let replay = state.bus.subscribe(Some(from_sequence.unwrap_or(0)));
                            let mut failed = false;
                            for event in &replay.backlog {
                                if event.sequence <= sent_up_to {
                                    continue;
                                }
                                sent_up_to = event.sequence;
                                if send_event(&mut socket, event).await.is_err() {
                                    failed = true;
                                    break;
                                }
                            }
                            if failed {
                                break;
                            }
                            rx = replay.rx;
                        }
                        Ok(ClientMessage::Ping) => {
                            let frame = serde_json::json!({ "type": "pong" });
                            if send_text(&mut socket, frame.to_string()).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            log::debug!("ignoring malformed client message: {e}");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("websocket receive error: {e}");
                    break;
                }
            },
        }
    }

    log::debug!("websocket client disconnected");
}

async fn send_event(socket: &mut WebSocket, event: &Event) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event)
        .expect("event envelopes always serialize");
    send_text(socket, text).await
}

async fn send_text(socket: &mut WebSocket, text: String) -> Result<(), axum::Error> {
    socket.send(Message::Text(text.into())).await
}
