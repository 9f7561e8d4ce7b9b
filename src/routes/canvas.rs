use crate::{
    prediction::InferenceChannel,
    server::SharedState,
    session::{CanvasEvent, CanvasUpdate, DrawingSession},
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::time::Instant;
use tracing::instrument;

#[instrument(skip(ws, state))]
pub async fn canvas_socket(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    state.metrics.record_request("/ws");
    ws.on_upgrade(move |socket| drive_session(socket, state))
}

async fn drive_session(socket: WebSocket, state: SharedState) {
    let channel = InferenceChannel::connect(
        &state.inference_config,
        state.metrics.clone(),
        state.shutdown.subscribe(),
    );
    let mut session = DrawingSession::new(&state.canvas_config, channel, state.metrics.clone());
    let mut shutdown_rx = state.shutdown.subscribe();
    let (mut sender, mut receiver) = socket.split();

    tracing::info!("Drawing surface connected");

    for update in [CanvasUpdate::baseline(), session.brush_size()] {
        if send_update(&mut sender, &update).await.is_err() {
            return;
        }
    }

    loop {
        let update = tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<CanvasEvent>(text.as_str()) {
                        Ok(event) => session.handle(event, Instant::now()),
                        Err(e) => {
                            tracing::warn!("Ignoring malformed canvas event: {}", e);
                            None
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => None,
                Some(Err(e)) => {
                    tracing::warn!("Canvas socket error: {}", e);
                    break;
                }
            },
            Some(vector) = session.next_prediction() => Some(session.accept_prediction(vector)),
            _ = shutdown_rx.recv() => break,
        };

        if let Some(update) = update {
            if send_update(&mut sender, &update).await.is_err() {
                break;
            }
        }
    }

    tracing::info!("Drawing surface disconnected");
}

async fn send_update(
    sender: &mut SplitSink<WebSocket, Message>,
    update: &CanvasUpdate,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(update) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!("Failed to serialize canvas update: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}
