use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

use porthole_core::exec::{AuditAction, AuditEvent, AuditSink, Geometry, TargetRef};
use porthole_core::protocol::{decode_client_text, is_heartbeat, ClientInput, ControlMessage, HEARTBEAT};
use porthole_core::session::{CloseReason, Session, SessionConfig, SessionState};

use crate::state::AppState;

/// Idle and lifetime limits are checked on this cadence.
const HOUSEKEEPING_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(default = "default_user")]
    user: String,
}

fn default_user() -> String {
    "unknown_user".to_string()
}

/// GET /ws/:namespace/:name - upgrades to a bidirectional terminal stream.
pub async fn ws_terminal(
    ws: WebSocketUpgrade,
    Path((namespace, name)): Path<(String, String)>,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let target = TargetRef::new(namespace, name);
    ws.on_upgrade(move |socket| handle_terminal(socket, state, target, params.user))
}

async fn handle_terminal(socket: WebSocket, state: AppState, target: TargetRef, user: String) {
    info!("terminal requested for {} by {}", target, user);
    record_audit(&state, &target, &user, AuditAction::Connected);

    let exists = state.cache.exists(&target).await.unwrap_or(false);
    if !exists {
        warn!("rejecting terminal for unknown target {}", target);
        reject(socket, format!("target {target} does not exist")).await;
        record_audit(&state, &target, &user, AuditAction::Disconnected);
        return;
    }

    let session = Session::new(
        target.clone(),
        user.clone(),
        Geometry::default(),
        SessionConfig {
            // The PTY fails loudly on its own, and a probe would feed
            // sentinel bytes straight into the shell's stdin. The
            // WebSocket leg is kept alive by the relay loop instead.
            liveness_timeout: None,
            chunk: state.config.chunk,
        },
    );

    let (output_tx, mut output_rx) = mpsc::unbounded_channel();
    if let Err(err) = session.open(state.backend.as_ref(), output_tx).await {
        warn!("failed to open session for {}: {}", target, err);
        reject(socket, format!("failed to attach to {target}: {err}")).await;
        record_audit(&state, &target, &user, AuditAction::Disconnected);
        return;
    }

    state.sessions.insert(session.clone());
    let reason = relay(socket, &state, &session, &mut output_rx).await;
    state.sessions.remove(&session.id());

    record_audit(&state, &target, &user, AuditAction::Disconnected);
    info!("session {} for {} closed: {}", session.id(), target, reason);
}

/// Shuttles frames between the WebSocket and the session until either
/// side closes, then reports how it ended.
async fn relay(
    socket: WebSocket,
    state: &AppState,
    session: &Session,
    output: &mut UnboundedReceiver<Bytes>,
) -> CloseReason {
    let (mut sink, mut stream) = socket.split();
    let mut last_input = Instant::now();
    let started = Instant::now();

    let mut keepalive = interval(state.config.liveness_timeout / 3);
    let mut housekeeping = interval(HOUSEKEEPING_PERIOD);
    // the first tick of an interval fires immediately
    keepalive.tick().await;
    housekeeping.tick().await;

    let wait = session.wait_closed();
    tokio::pin!(wait);

    let reason = loop {
        tokio::select! {
            reason = &mut wait => break reason,
            chunk = output.recv() => match chunk {
                Some(chunk) => {
                    if sink.send(Message::Binary(chunk.to_vec())).await.is_err() {
                        session.close(CloseReason::UserRequested);
                        break wait.await;
                    }
                }
                None => break wait.await,
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Ping(payload))) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        session.close(CloseReason::UserRequested);
                        break wait.await;
                    }
                }
                Some(Ok(message)) => {
                    if let Some(reason) =
                        handle_frame(session, &mut last_input, message, state.config.chunk.threshold).await
                    {
                        session.close(reason);
                        break wait.await;
                    }
                }
                Some(Err(err)) => {
                    debug!("websocket error for {}: {}", session.target(), err);
                    session.close(CloseReason::UserRequested);
                    break wait.await;
                }
                None => {
                    session.close(CloseReason::UserRequested);
                    break wait.await;
                }
            },
            _ = keepalive.tick() => {
                if sink.send(Message::Binary(vec![HEARTBEAT])).await.is_err() {
                    session.close(CloseReason::UserRequested);
                    break wait.await;
                }
            }
            _ = housekeeping.tick() => {
                if last_input.elapsed() >= state.config.idle_timeout {
                    info!("session {} idle for {:?}", session.id(), last_input.elapsed());
                    session.close(CloseReason::IdleTimeout);
                } else if started.elapsed() >= state.config.connection_timeout {
                    info!("session {} reached its lifetime limit", session.id());
                    session.close(CloseReason::LifetimeExceeded);
                }
            }
        }
    };

    // flush whatever the remote managed to say before the close landed
    while let Ok(chunk) = output.try_recv() {
        if sink.send(Message::Binary(chunk.to_vec())).await.is_err() {
            break;
        }
    }

    let code = if reason.is_clean() {
        close_code::NORMAL
    } else {
        close_code::ERROR
    };
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;

    reason
}

/// Applies one client frame to the session. Returns the close reason
/// when the frame asks for one. Heartbeats never advance `last_input`;
/// the idle clock tracks the user, not the transport.
async fn handle_frame(
    session: &Session,
    last_input: &mut Instant,
    message: Message,
    paste_threshold: usize,
) -> Option<CloseReason> {
    match message {
        Message::Text(text) => match decode_client_text(&text) {
            Ok(ClientInput::Heartbeat) => {
                debug!("heartbeat from client of {}", session.target());
            }
            Ok(ClientInput::Control(ControlMessage::Resize { cols, rows })) => {
                *last_input = Instant::now();
                session.resize(cols, rows);
            }
            Ok(ClientInput::Data(data)) => {
                *last_input = Instant::now();
                // multi-line or oversized text is pasted, not typed, and
                // goes through newline normalization and chunking
                if text.contains('\n') || text.len() > paste_threshold {
                    session.send_text(&text).await;
                } else {
                    session.send(data);
                }
            }
            Err(err) => {
                warn!("dropping bad frame for {}: {}", session.target(), err);
            }
        },
        Message::Binary(data) => {
            if is_heartbeat(&data) {
                debug!("heartbeat from client of {}", session.target());
            } else {
                *last_input = Instant::now();
                session.send(Bytes::from(data));
            }
        }
        Message::Ping(_) | Message::Pong(_) => {}
        Message::Close(_) => return Some(CloseReason::UserRequested),
    }
    None
}

/// Tells the client why it cannot have a terminal, then hangs up.
async fn reject(mut socket: WebSocket, message: String) {
    let _ = socket.send(Message::Text(format!("{message}\r\n"))).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::ERROR,
            reason: message.into(),
        })))
        .await;
}

fn record_audit(state: &AppState, target: &TargetRef, user: &str, action: AuditAction) {
    let audit = state.audit.clone();
    let event = AuditEvent::now(target, user, action);
    tokio::spawn(async move { audit.record(event).await });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalExec;
    use porthole_core::chunk::ChunkPolicy;

    async fn open_shell_session() -> (Session, UnboundedReceiver<Bytes>) {
        let session = Session::new(
            TargetRef::new("default", "web-0"),
            "tester",
            Geometry::default(),
            SessionConfig {
                liveness_timeout: None,
                chunk: ChunkPolicy::default(),
            },
        );
        let backend = LocalExec::new("sh");
        let (tx, rx) = mpsc::unbounded_channel();
        session.open(&backend, tx).await.expect("shell should spawn");
        (session, rx)
    }

    /// A marker instant taken strictly before the frame under test.
    async fn stale_mark() -> Instant {
        let mark = Instant::now();
        tokio::time::sleep(Duration::from_millis(5)).await;
        mark
    }

    #[tokio::test]
    async fn close_frames_request_a_clean_close() {
        let (session, _rx) = open_shell_session().await;
        let mut last_input = Instant::now();
        let reason = handle_frame(&session, &mut last_input, Message::Close(None), 1000).await;
        assert_eq!(reason, Some(CloseReason::UserRequested));
        session.close(CloseReason::UserRequested);
        session.wait_closed().await;
    }

    #[tokio::test]
    async fn heartbeats_do_not_advance_the_idle_clock() {
        let (session, _rx) = open_shell_session().await;
        let stale = stale_mark().await;

        let mut last_input = stale;
        handle_frame(&session, &mut last_input, Message::Binary(vec![HEARTBEAT]), 1000).await;
        assert_eq!(last_input, stale);

        handle_frame(&session, &mut last_input, Message::Text("\u{0}".to_string()), 1000).await;
        assert_eq!(last_input, stale);

        session.close(CloseReason::UserRequested);
        session.wait_closed().await;
    }

    #[tokio::test]
    async fn input_advances_the_idle_clock() {
        let (session, _rx) = open_shell_session().await;
        let stale = stale_mark().await;
        let mut last_input = stale;
        handle_frame(&session, &mut last_input, Message::Binary(b"ls".to_vec()), 1000).await;
        assert!(last_input > stale);
        session.close(CloseReason::UserRequested);
        session.wait_closed().await;
    }

    #[tokio::test]
    async fn resize_frames_reshape_the_session() {
        let (session, _rx) = open_shell_session().await;
        let stale = stale_mark().await;
        let mut last_input = stale;
        let frame = Message::Text(r#"{"type":"resize","cols":100,"rows":30}"#.to_string());
        let reason = handle_frame(&session, &mut last_input, frame, 1000).await;
        assert_eq!(reason, None);
        assert_eq!(session.geometry(), Geometry::new(100, 30));
        assert!(last_input > stale);
        session.close(CloseReason::UserRequested);
        session.wait_closed().await;
    }

    #[tokio::test]
    async fn malformed_control_frames_are_dropped() {
        let (session, _rx) = open_shell_session().await;
        let before = session.geometry();
        let stale = stale_mark().await;
        let mut last_input = stale;
        let frame = Message::Text(r#"{"type":"resize","cols":0,"rows":0}"#.to_string());
        let reason = handle_frame(&session, &mut last_input, frame, 1000).await;
        assert_eq!(reason, None);
        assert_eq!(session.geometry(), before);
        assert_eq!(last_input, stale);
        session.close(CloseReason::UserRequested);
        session.wait_closed().await;
    }

    #[tokio::test]
    async fn session_state_reflects_the_relay_lifecycle() {
        let (session, _rx) = open_shell_session().await;
        assert_eq!(session.state(), SessionState::Open);
        session.close(CloseReason::UserRequested);
        let reason = session.wait_closed().await;
        assert_eq!(reason, CloseReason::UserRequested);
        // the pumps wind down shortly after the close reason lands
        let settled = tokio::time::timeout(Duration::from_secs(5), async {
            while session.state() != SessionState::Closed {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(settled.is_ok(), "session never reached the closed state");
    }
}
