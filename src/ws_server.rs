//! WebSocket endpoint: one connection, one execution.

use crate::protocol::OutputFrame;
use crate::session::ExecutionSession;
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::io;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Frames buffered between the session and the socket writer.
const FRAME_BUFFER: usize = 64;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on an already bound listener until the process exits.
pub async fn serve(listener: TcpListener, state: AppState) -> io::Result<()> {
    axum::serve(listener, router(state)).await
}

/// Bind the configured loopback address and serve.
pub async fn run_server(state: AppState) -> io::Result<()> {
    let addr = state.config.bind_addr();
    let listener = TcpListener::bind(addr).await?;
    info!("WebSocket server is running on ws://{}", listener.local_addr()?);
    serve(listener, state).await
}

async fn upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let connection_id = state.next_connection_id();
    info!(connection_id, "Client connected");
    let (mut sender, mut receiver) = socket.split();

    let message = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(Message::Binary(bytes))) => break String::from_utf8_lossy(&bytes).into_owned(),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                debug!(connection_id, "Closed before sending a request");
                return;
            }
            Some(Err(error)) => {
                debug!(connection_id, %error, "Failed to read request");
                return;
            }
        }
    };

    let disconnected = {
        let (tx, mut rx) = mpsc::channel::<OutputFrame>(FRAME_BUFFER);
        let mut session = ExecutionSession::new(connection_id, state);
        let execution = session.execute(&message, tx);
        tokio::pin!(execution);
        let mut finished = false;

        loop {
            tokio::select! {
                biased;
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        if sender.send(Message::Text(frame.encode())).await.is_err() {
                            break true;
                        }
                    }
                    // Session is over and every frame has been written.
                    None => break false,
                },
                _ = &mut execution, if !finished => finished = true,
                incoming = receiver.next() => match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break true,
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(_)) => debug!(connection_id, "Ignoring extra message; one request per connection"),
                },
            }
        }
        // Dropping an unfinished execution kills its process and workspace.
    };

    if disconnected {
        info!(connection_id, "Client disconnected; execution abandoned");
    } else {
        let _ = sender.send(Message::Close(None)).await;
        debug!(connection_id, "Connection closed");
    }
}
