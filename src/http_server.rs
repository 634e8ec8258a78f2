//! HTTP and WebSocket transport over the engine, using Axum.
//!
//! The streaming endpoint keeps per-client byte cursors over the session
//! buffers and polls them on a fixed cadence; session semantics stay inside
//! `Session`/`Engine`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::session::{OutputStream, Session, SessionState};

// Request/Response types
#[derive(Deserialize)]
struct CreateSessionRequest {
    language: String,
    code: String,
}

#[derive(Serialize)]
struct CreateSessionResponse {
    session_id: String,
}

#[derive(Deserialize)]
struct RunRequest {
    language: String,
    code: String,
    #[serde(default = "default_time_limit_ms")]
    time_limit_ms: u64,
}

fn default_time_limit_ms() -> u64 {
    2000
}

#[derive(Serialize)]
struct SessionInfo {
    id: String,
    language: String,
    state: SessionState,
    active_clients: usize,
    container_id: Option<String>,
    exit_code: Option<i64>,
    uptime_secs: u64,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Server-to-client stream frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerFrame {
    Stdout { data: String },
    Stderr { data: String },
    State { state: SessionState },
}

/// Client-to-server stream frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame {
    Input { data: String },
}

/// Run the HTTP server on the given port over the provided engine.
pub async fn run_server(port: u16, engine: Arc<Engine>) {
    let app = Router::new()
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/:id", get(get_session).delete(stop_session))
        .route("/sessions/:id/ws", get(stream_session))
        .route("/run", post(run_oneshot))
        .route("/health", get(health))
        .with_state(engine.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("starting http server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(engine))
        .await
        .unwrap();
}

async fn shutdown_signal(engine: Arc<Engine>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    engine.shutdown().await;
}

async fn health() -> &'static str {
    "OK"
}

fn error_response(err: EngineError) -> Response {
    let status = match &err {
        EngineError::UnsupportedLanguage(_) | EngineError::InvalidRequest(_) => {
            StatusCode::BAD_REQUEST
        }
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::InvalidState(_) => StatusCode::CONFLICT,
        EngineError::Sandbox(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

fn session_info(session: &Session) -> SessionInfo {
    SessionInfo {
        id: session.id().to_string(),
        language: session.language().to_string(),
        state: session.state(),
        active_clients: session.active_clients(),
        container_id: session.container_id(),
        exit_code: session.exit_code(),
        uptime_secs: session.uptime().as_secs(),
    }
}

async fn create_session(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<CreateSessionRequest>,
) -> Response {
    match engine.start_session(&req.language, &req.code).await {
        Ok(session) => (
            StatusCode::CREATED,
            Json(CreateSessionResponse {
                session_id: session.id().to_string(),
            }),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

async fn list_sessions(State(engine): State<Arc<Engine>>) -> Json<Vec<SessionInfo>> {
    let sessions = engine.list_sessions().await;
    Json(sessions.iter().map(|s| session_info(s)).collect())
}

async fn get_session(State(engine): State<Arc<Engine>>, Path(id): Path<String>) -> Response {
    match engine.get_session(&id).await {
        Some(session) => Json(session_info(&session)).into_response(),
        None => error_response(EngineError::NotFound(id)),
    }
}

async fn stop_session(State(engine): State<Arc<Engine>>, Path(id): Path<String>) -> Response {
    match engine.get_session(&id).await {
        Some(session) => {
            session.stop();
            StatusCode::NO_CONTENT.into_response()
        }
        None => error_response(EngineError::NotFound(id)),
    }
}

async fn run_oneshot(State(engine): State<Arc<Engine>>, Json(req): Json<RunRequest>) -> Response {
    let time_limit = Duration::from_millis(req.time_limit_ms.max(1));
    match engine.execute(&req.language, &req.code, time_limit).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => error_response(err),
    }
}

async fn stream_session(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(engine): State<Arc<Engine>>,
) -> Response {
    match engine.get_session(&id).await {
        Some(session) => {
            let poll = engine.config().poll_interval;
            ws.on_upgrade(move |socket| serve_stream(socket, session, poll))
        }
        None => error_response(EngineError::NotFound(id)),
    }
}

#[derive(Default)]
struct Cursors {
    stdout: usize,
    stderr: usize,
}

/// One attached client: forwards its input frames to the program's stdin
/// and flushes new buffer bytes on the poll cadence. A final flush precedes
/// the single terminal state frame.
async fn serve_stream(socket: WebSocket, session: Arc<Session>, poll: Duration) {
    let clients = session.attach_client();
    debug!(session = %session.id(), clients, "client attached");

    let (mut sender, mut receiver) = socket.split();

    let input_session = session.clone();
    let mut input_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            let Message::Text(text) = message else { continue };
            match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Input { data }) => {
                    if let Err(err) = input_session.write_input(data.as_bytes()).await {
                        debug!(session = %input_session.id(), error = %err, "input rejected");
                    }
                }
                Err(err) => {
                    debug!(session = %input_session.id(), error = %err, "bad client frame");
                }
            }
        }
    });

    let mut cursors = Cursors::default();
    let mut ticker = tokio::time::interval(poll);
    loop {
        tokio::select! {
            _ = session.done() => {
                let _ = flush(&mut sender, &session, &mut cursors).await;
                let _ = send_frame(&mut sender, &ServerFrame::State { state: session.state() }).await;
                break;
            }
            _ = ticker.tick() => {
                if flush(&mut sender, &session, &mut cursors).await.is_err() {
                    break;
                }
            }
            _ = &mut input_task => break,
        }
    }

    input_task.abort();
    let clients = session.detach_client();
    debug!(session = %session.id(), clients, "client detached");
}

async fn flush(
    sender: &mut SplitSink<WebSocket, Message>,
    session: &Arc<Session>,
    cursors: &mut Cursors,
) -> Result<(), axum::Error> {
    let (chunk, cursor) = session.read_since(OutputStream::Stdout, cursors.stdout);
    cursors.stdout = cursor;
    if !chunk.is_empty() {
        let data = String::from_utf8_lossy(&chunk).into_owned();
        send_frame(sender, &ServerFrame::Stdout { data }).await?;
    }

    let (chunk, cursor) = session.read_since(OutputStream::Stderr, cursors.stderr);
    cursors.stderr = cursor;
    if !chunk.is_empty() {
        let data = String::from_utf8_lossy(&chunk).into_owned();
        send_frame(sender, &ServerFrame::Stderr { data }).await?;
    }
    Ok(())
}

async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(frame).expect("stream frame is serializable");
    sender.send(Message::Text(payload)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdout_frame_shape() {
        let frame = ServerFrame::Stdout {
            data: "hi\n".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&frame).unwrap(),
            r#"{"type":"stdout","data":"hi\n"}"#
        );
    }

    #[test]
    fn stderr_frame_shape() {
        let frame = ServerFrame::Stderr {
            data: "boom".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&frame).unwrap(),
            r#"{"type":"stderr","data":"boom"}"#
        );
    }

    #[test]
    fn state_frame_uses_the_state_name() {
        let frame = ServerFrame::State {
            state: SessionState::Finished,
        };
        assert_eq!(
            serde_json::to_string(&frame).unwrap(),
            r#"{"type":"state","state":"Finished"}"#
        );
    }

    #[test]
    fn input_frame_parses() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"input","data":"ping\n"}"#).unwrap();
        let ClientFrame::Input { data } = frame;
        assert_eq!(data, "ping\n");
    }

    #[test]
    fn unknown_client_frame_is_rejected() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"resize","cols":80}"#).is_err());
    }
}
