//! The session multiplexer (C6) and the stats/quota loop (C7): a
//! full-duplex channel bound to the same listener as the HTTP API,
//! authenticated by a handshake frame, routed by URL to either an
//! exec/log session or a periodic stats session.

use crate::AppState;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use dashmap::DashMap;
use futures::StreamExt;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

const LOG_BUFFER_CAPACITY: usize = 1000;

const ANSI_GREEN: &str = "\x1b[32m";
const ANSI_CYAN: &str = "\x1b[36m";
const ANSI_RESET: &str = "\x1b[0m";

struct LogEntry {
    content: String,
}

#[derive(Default)]
struct LogBuffer {
    entries: VecDeque<LogEntry>,
}

impl LogBuffer {
    fn push(&mut self, content: String) {
        if self.entries.len() >= LOG_BUFFER_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry { content });
    }
}

/// Log buffers keyed by `container_id`, shared across every session
/// attached to that container; written only by each session's own
/// log-stream subscriber.
#[derive(Default)]
pub struct SessionRegistry {
    log_buffers: DashMap<String, Mutex<LogBuffer>>,
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    event: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    command: Option<String>,
}

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Path(params): Path<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let kind = params.get("kind").cloned().unwrap_or_default();
    let container_id = params.get("container_id").cloned().unwrap_or_default();
    let volume_id = params.get("volume_id").cloned();
    ws.on_upgrade(move |socket| handle_socket(socket, state, kind, container_id, volume_id))
}

async fn handle_socket(
    mut socket: WebSocket,
    state: Arc<AppState>,
    kind: String,
    container_id: String,
    volume_id: Option<String>,
) {
    if container_id.is_empty() {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: 1008,
                reason: "Container ID not specified".into(),
            })))
            .await;
        return;
    }

    if kind != "exec" && kind != "stats" {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: 1002,
                reason: "".into(),
            })))
            .await;
        return;
    }

    if !authenticate(&mut socket, &state).await {
        return;
    }

    info!(%container_id, %kind, "session authenticated");
    match kind.as_str() {
        "exec" => run_exec_session(socket, state, container_id).await,
        "stats" => run_stats_session(socket, state, container_id, volume_id).await,
        _ => unreachable!("kind validated above"),
    }
}

/// Drains inbound frames until the handshake frame `{event: "auth", args:
/// [secret]}` succeeds. Invalid JSON gets an inline reply and the
/// connection stays open; anything else before auth is treated as a
/// failed handshake.
async fn authenticate(socket: &mut WebSocket, state: &AppState) -> bool {
    loop {
        let Some(Ok(msg)) = socket.recv().await else {
            return false;
        };
        let Message::Text(text) = msg else {
            continue;
        };
        let frame: InboundFrame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(_) => {
                let _ = socket.send(Message::Text("Invalid JSON".into())).await;
                continue;
            }
        };

        if frame.event != "auth" {
            let _ = socket.send(Message::Text("Authentication failed".into())).await;
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: 1008,
                    reason: "Authentication failed".into(),
                })))
                .await;
            return false;
        }

        let provided = frame.args.first().cloned().unwrap_or_default();
        if provided == state.key {
            let _ = socket
                .send(Message::Text(format!(
                    "{ANSI_GREEN}[hostwing] connected!{ANSI_RESET}"
                )))
                .await;
            return true;
        }

        let _ = socket.send(Message::Text("Authentication failed".into())).await;
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: 1008,
                reason: "Authentication failed".into(),
            })))
            .await;
        return false;
    }
}

/// Pushing a frame is best-effort: a zero-duration timeout around the send
/// stands in for the browser-side "outbound buffer is empty" check this
/// behavior is modeled on. On congestion the line stays in the buffer and
/// is not retried.
async fn try_send_text(socket: &mut WebSocket, text: String) -> bool {
    matches!(
        tokio::time::timeout(Duration::ZERO, socket.send(Message::Text(text))).await,
        Ok(Ok(()))
    )
}

async fn run_exec_session(mut socket: WebSocket, state: Arc<AppState>, container_id: String) {
    {
        let buffer = state
            .sessions
            .log_buffers
            .entry(container_id.clone())
            .or_default();
        let buffer = buffer.lock().unwrap();
        for entry in &buffer.entries {
            if !try_send_text(
                &mut socket,
                format!("{ANSI_CYAN}[docker] {}{ANSI_RESET}", entry.content),
            )
            .await
            {
                break;
            }
        }
    }

    let mut log_stream = state.runtime.logs(&container_id, true, None);

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_authenticated_frame(&mut socket, &state, &container_id, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            chunk = log_stream.next() => {
                match chunk {
                    Some(Ok(output)) => {
                        use hostwing_runtime::bollard::container::LogOutput;
                        let message = match output {
                            LogOutput::StdOut { message }
                            | LogOutput::StdErr { message }
                            | LogOutput::StdIn { message }
                            | LogOutput::Console { message } => message,
                        };
                        append_and_forward(&state, &mut socket, &container_id, &message).await;
                    }
                    Some(Err(e)) => {
                        warn!(%container_id, error = %e, "log stream errored");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
    debug!(%container_id, "exec session closed");
}

async fn append_and_forward(state: &AppState, socket: &mut WebSocket, container_id: &str, chunk: &[u8]) {
    let text = String::from_utf8_lossy(chunk);
    let lines: Vec<&str> = text.lines().filter(|l| !l.is_empty()).collect();
    if lines.is_empty() {
        return;
    }

    {
        let buffer = state.sessions.log_buffers.entry(container_id.to_string()).or_default();
        let mut buffer = buffer.lock().unwrap();
        for line in &lines {
            buffer.push(line.to_string());
        }
    }

    for line in lines {
        if !try_send_text(socket, format!("{ANSI_CYAN}[docker] {line}{ANSI_RESET}")).await {
            break;
        }
    }
}

async fn handle_authenticated_frame(socket: &mut WebSocket, state: &AppState, container_id: &str, text: &str) {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(_) => {
            let _ = socket.send(Message::Text("Invalid JSON".into())).await;
            return;
        }
    };

    match frame.event.as_str() {
        "cmd" => {
            let Some(command) = frame.command else {
                let _ = socket.send(Message::Text("Missing command".into())).await;
                return;
            };
            match state.runtime.exec(container_id, vec!["/bin/sh".into(), "-c".into(), command]).await {
                Ok(handle) => {
                    if let Err(e) = handle.start_and_write("").await {
                        let _ = socket.send(Message::Text(format!("command failed: {e}"))).await;
                    }
                }
                Err(e) => {
                    let _ = socket.send(Message::Text(format!("command failed: {e}"))).await;
                }
            }
        }
        "power:start" => power_action(socket, state, container_id, PowerAction::Start).await,
        "power:stop" => power_action(socket, state, container_id, PowerAction::Stop).await,
        "power:restart" => power_action(socket, state, container_id, PowerAction::Restart).await,
        _ => {
            let _ = socket.send(Message::Text("Unsupported event".into())).await;
        }
    }
}

enum PowerAction {
    Start,
    Stop,
    Restart,
}

async fn power_action(socket: &mut WebSocket, state: &AppState, container_id: &str, action: PowerAction) {
    let result = match action {
        PowerAction::Start => state.runtime.start(container_id).await,
        PowerAction::Stop => state.runtime.stop(container_id).await,
        PowerAction::Restart => state.runtime.restart(container_id).await,
    };
    if let Err(e) = result {
        let _ = socket.send(Message::Text(format!("power action failed: {e}"))).await;
    }
}

#[derive(serde::Serialize)]
struct StatsSample {
    #[serde(flatten)]
    runtime_stats: serde_json::Value,
    volume_size_mib: u64,
    disk_limit_mib: u64,
    storage_exceeded: bool,
}

async fn run_stats_session(
    mut socket: WebSocket,
    state: Arc<AppState>,
    container_id: String,
    volume_id: Option<String>,
) {
    let disk_limit_mib = match &volume_id {
        Some(vid) => state
            .state_store
            .read()
            .await
            .ok()
            .and_then(|doc| doc.get(vid).map(|r| r.disk_limit_mib))
            .unwrap_or(0),
        None => 0,
    };

    let mut auto_stopped = false;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(Message::Text(text))) => {
                        if serde_json::from_str::<InboundFrame>(&text).is_err() {
                            let _ = socket.send(Message::Text("Invalid JSON".into())).await;
                        }
                    }
                    _ => {}
                }
            }
            _ = ticker.tick() => {
                match sample(&state, &container_id, volume_id.as_deref(), disk_limit_mib).await {
                    Ok(sample) => {
                        if sample.storage_exceeded && !auto_stopped && should_auto_stop(&state, &container_id).await {
                            let _ = state.runtime.stop(&container_id).await;
                            auto_stopped = true;
                        }
                        let payload = serde_json::to_string(&sample).unwrap_or_else(|_| "{}".to_string());
                        if !try_send_text(&mut socket, payload).await {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(%container_id, error = %e, "stats sample failed");
                        let _ = socket
                            .send(Message::Text(r#"{"error":"Failed to fetch stats"}"#.to_string()))
                            .await;
                    }
                }
            }
        }
    }
    debug!(%container_id, "stats session closed");
}

async fn should_auto_stop(state: &AppState, container_id: &str) -> bool {
    match state.runtime.inspect(container_id).await {
        Ok(inspect) => inspect.state.and_then(|s| s.running).unwrap_or(false),
        Err(_) => false,
    }
}

async fn sample(
    state: &AppState,
    container_id: &str,
    volume_id: Option<&str>,
    disk_limit_mib: u64,
) -> hostwing_runtime::Result<StatsSample> {
    let stats = state.runtime.stats_once(container_id).await?;
    let volume_size_mib = match volume_id {
        Some(vid) => measure_volume_mib(&state.storage_root.join("volumes").join(vid)),
        None => 0,
    };
    let storage_exceeded = disk_limit_mib > 0 && volume_size_mib >= disk_limit_mib;

    Ok(StatsSample {
        runtime_stats: serde_json::to_value(&stats).unwrap_or(serde_json::Value::Null),
        volume_size_mib,
        disk_limit_mib,
        storage_exceeded,
    })
}

fn measure_volume_mib(dir: &std::path::Path) -> u64 {
    let total_bytes: u64 = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum();
    total_bytes / (1024 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_buffer_drops_oldest_past_capacity() {
        let mut buffer = LogBuffer::default();
        for i in 0..(LOG_BUFFER_CAPACITY + 10) {
            buffer.push(format!("line-{i}"));
        }
        assert_eq!(buffer.entries.len(), LOG_BUFFER_CAPACITY);
        assert_eq!(buffer.entries.front().unwrap().content, "line-10");
    }

    #[test]
    fn inbound_frame_parses_minimal_event() {
        let frame: InboundFrame = serde_json::from_str(r#"{"event":"auth","args":["secret"]}"#).unwrap();
        assert_eq!(frame.event, "auth");
        assert_eq!(frame.args, vec!["secret".to_string()]);
    }

    #[test]
    fn measure_volume_mib_sums_file_sizes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), vec![0u8; 2 * 1024 * 1024]).unwrap();
        assert_eq!(measure_volume_mib(dir.path()), 2);
    }
}
