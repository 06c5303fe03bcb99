//! HTTP server hosting the signalling WebSocket endpoint.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use ssfu_core::{
    transport::CLOSE_INTERNAL, Config, OutboundFrame, Session, SessionParams, SfuState,
    SignalTransport,
};

#[derive(Clone)]
struct AppState {
    sfu: Arc<SfuState>,
}

/// Query parameters for the signalling WebSocket.
#[derive(Debug, Deserialize)]
struct WsQuery {
    id: Option<String>,
    #[serde(rename = "readRooms")]
    read_rooms: Option<String>,
    #[serde(rename = "writeRooms")]
    write_rooms: Option<String>,
}

/// Run the HTTP server until a shutdown signal, then drain the clients.
pub async fn serve(config: Config, sfu: Arc<SfuState>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/signalling", get(ws_handler))
        .with_state(AppState { sfu: sfu.clone() });

    let listener = tokio::net::TcpListener::bind(config.listen_address()).await?;
    info!("listening on {}", config.listen_address());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(sfu))
        .await?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal(sfu: Arc<SfuState>) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => error!(error = %err, "failed to listen for SIGTERM"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    info!("shutdown signal received");
    sfu.shutdown().await;
}

fn origin_allowed(config: &Config, headers: &HeaderMap) -> bool {
    let allowed = &config.server.allowed_origins;
    if allowed.is_empty() {
        return true;
    }
    headers
        .get("origin")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|origin| allowed.iter().any(|candidate| candidate == origin))
}

async fn ws_handler(
    State(app): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !origin_allowed(app.sfu.config(), &headers) {
        warn!("rejecting signalling connection from disallowed origin");
        return StatusCode::FORBIDDEN.into_response();
    }

    let params = SessionParams::from_query(query.id, query.read_rooms, query.write_rooms);
    ws.on_upgrade(move |socket| handle_socket(app, params, socket))
}

async fn handle_socket(app: AppState, params: SessionParams, socket: WebSocket) {
    let peer_id = params.peer_id.clone();
    info!(peer = %peer_id, "signalling connection established");

    let (transport, mut outbound) =
        SignalTransport::pair(app.sfu.config().transport.outbound_queue);
    let (mut sink, mut stream) = socket.split();

    // Writer task: the only place frames touch the socket, so concurrent
    // sends can never interleave.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            match frame {
                OutboundFrame::Message(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let session = match Session::start(app.sfu.clone(), params, transport.clone()).await {
        Ok(session) => session,
        Err(err) => {
            error!(peer = %peer_id, error = %err, "failed to start session");
            transport.close(CLOSE_INTERNAL, "session setup failed");
            return;
        }
    };

    loop {
        tokio::select! {
            // The transport closes on eviction, slow consumers and server
            // shutdown; stop reading right away in all three cases.
            () = transport.closed() => break,
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => session.handle_frame(&text).await,
                Some(Ok(Message::Close(_))) | None => break,
                // Binary, ping and pong frames carry nothing for us.
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(peer = %peer_id, error = %err, "signalling read error");
                    break;
                }
            }
        }
    }

    session.shutdown().await;
    writer.abort();
    info!(peer = %peer_id, "signalling connection closed");
}
