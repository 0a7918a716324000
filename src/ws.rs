use axum::{
    debug_handler,
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{session, AppState};

#[debug_handler]
pub async fn chat_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_connection(state, socket))
}

async fn serve_connection(state: AppState, socket: WebSocket) {
    let conn = Uuid::now_v7();
    let (mut rx, closed) = state.hub.attach_socket(conn);
    let (mut sender, mut receiver) = socket.split();
    info!(conn_id = %conn, "connection opened");

    let mut outbound = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame.to_string().into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let inbound = async {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(msg @ (Message::Text(_) | Message::Binary(_))) => {
                    session::dispatch_frame(&state, conn, &msg.into_data()).await;
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!(conn_id = %conn, error = %e, "transport error");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = inbound => {},
        _ = &mut outbound => {},
        // evicted as a slow consumer, or torn down elsewhere
        _ = closed.notified() => {},
    };

    session::disconnect(&state, conn).await;
    outbound.abort();
    info!(conn_id = %conn, "connection closed");
}
