//! The per-session message loop and callback forwarding.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt as _, StreamExt as _};
use robolink_ipc::CallbackSubscriber;
use robolink_model::{CallbackMessage, Command, ErrorCode, Reply};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use crate::protocol;
use crate::{AdmissionGuard, Session, SharedState};

/// How often the callback forwarder wakes up when no pushes arrive.
const CALLBACK_POLL_WINDOW: Duration = Duration::from_millis(100);

/// Pause before re-subscribing after the worker dropped the callback
/// socket (it is probably restarting).
const RESUBSCRIBE_PAUSE: Duration = Duration::from_millis(250);

/// Bound on the disconnect notification so shutdown can't hang on a dead
/// worker.
const DISCONNECT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(1);

/// A frame from the client: `{id?, event, data?}`. The reply is echoed
/// back as `{id, data}`; pushes arrive as `{event, data}`.
#[derive(Debug, Deserialize)]
struct ClientFrame {
    id: Option<u64>,
    event: String,
    #[serde(default)]
    data: Value,
}

pub async fn run(state: SharedState, session: Session, guard: AdmissionGuard, socket: WebSocket) {
    tracing::info!(session = %session.id, user = session.user_id, "client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // All outbound traffic funnels through one writer half; the forwarder
    // feeds pushes in through this channel.
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
    let forwarder = tokio::spawn(forward_callbacks(state.clone(), out_tx));

    loop {
        tokio::select! {
            outgoing = out_rx.recv() => {
                let Some(message) = outgoing else { break };
                if ws_tx.send(message).await.is_err() {
                    break;
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let response = handle_frame(&state, &text).await;
                        if ws_tx.send(Message::Text(response)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong are answered by the library
                    Some(Err(error)) => {
                        tracing::debug!(%error, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }

    tracing::info!(session = %session.id, "client disconnected");

    // Cancel and await the forwarder before touching the worker.
    forwarder.abort();
    let _ = forwarder.await;

    // Only the admitted session notifies the worker; a raced duplicate
    // (which never held the slot) must not stop user activity.
    if state.release(session.id) {
        notify_worker_disconnected(&state, &session).await;
    }
    drop(guard);
}

async fn handle_frame(state: &SharedState, text: &str) -> String {
    let (id, reply) = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => {
            let reply = process_command(state, &frame.event, frame.data).await;
            (frame.id, reply)
        }
        Err(error) => (
            None,
            Reply::error_with_message(
                ErrorCode::ProtocolInvalidFormat,
                format!("frame is not a valid request: {error}"),
            ),
        ),
    };

    let reply = serde_json::to_value(reply)
        .unwrap_or_else(|_| json!({"status": "error", "error_code": ErrorCode::InternalError}));
    let data = seal_reply(state, reply);

    json!({ "id": id, "data": data }).to_string()
}

async fn process_command(state: &SharedState, event: &str, data: Value) -> Reply {
    let payload = match open_payload(state, data) {
        Ok(payload) => payload,
        Err(reply) => return *reply,
    };

    let command = match protocol::validate_command(event, payload) {
        Ok(command) => command,
        Err(error) => {
            tracing::warn!(event, message = error.message, "protocol violation");
            return Reply::error_with_message(error.code, error.message);
        }
    };

    dispatch(state, &command).await
}

/// Forward a validated command to the worker and hand its reply back
/// verbatim. The lock spans the whole exchange, which is what keeps the
/// command channel at one outstanding request.
async fn dispatch(state: &SharedState, command: &Command) -> Reply {
    let mut client = state.command.lock().await;

    match client.call(command).await {
        Ok(reply) => reply,
        Err(error) => {
            tracing::error!(command = command.name(), %error, "worker dispatch failed");
            Reply::error_with_message(ErrorCode::InternalError, "worker is unavailable")
        }
    }
}

/// Decrypt (if enabled) and shape the inbound payload into a map.
fn open_payload(state: &SharedState, data: Value) -> Result<Map<String, Value>, Box<Reply>> {
    match data {
        Value::String(sealed) => {
            let Some(cipher) = &state.cipher else {
                return Err(Box::new(Reply::error_with_message(
                    ErrorCode::ProtocolInvalidFormat,
                    "received an encrypted payload but encryption is disabled",
                )));
            };
            let opened = cipher.decrypt(&sealed).map_err(|error| {
                tracing::warn!(%error, "payload decryption failed");
                Box::new(Reply::error_with_message(
                    ErrorCode::ProtocolInvalidFormat,
                    "payload could not be decrypted",
                ))
            })?;
            match opened {
                Value::Object(map) => Ok(map),
                _ => Err(Box::new(Reply::error_with_message(
                    ErrorCode::ProtocolInvalidFormat,
                    "decrypted payload is not an object",
                ))),
            }
        }
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err(Box::new(Reply::error_with_message(
            ErrorCode::ProtocolInvalidFormat,
            "payload must be an object or an encrypted string",
        ))),
    }
}

/// Encrypt the outbound reply when encryption is on; plaintext otherwise.
fn seal_reply(state: &SharedState, reply: Value) -> Value {
    let Some(cipher) = &state.cipher else {
        return reply;
    };

    match cipher.encrypt(&reply) {
        Ok(sealed) => Value::String(sealed),
        Err(error) => {
            tracing::error!(%error, "couldn't encrypt reply, sending plaintext");
            reply
        }
    }
}

/// The per-session forwarder: owns its own subscription to the callback
/// channel, polls it, and re-subscribes (lossy) across worker restarts.
async fn forward_callbacks(state: SharedState, out: mpsc::Sender<Message>) {
    loop {
        let mut subscriber =
            match CallbackSubscriber::connect(&state.config.ipc.callback_socket).await {
                Ok(subscriber) => subscriber,
                Err(error) => {
                    tracing::warn!(%error, "callback channel unavailable, retrying");
                    tokio::time::sleep(RESUBSCRIBE_PAUSE).await;
                    continue;
                }
            };

        loop {
            match subscriber.recv_timeout(CALLBACK_POLL_WINDOW).await {
                Ok(None) => {}
                Ok(Some(CallbackMessage::Push(push))) => {
                    let frame = json!({ "event": push.event, "data": push.data });
                    if out.send(Message::Text(frame.to_string())).await.is_err() {
                        return;
                    }
                }
                Ok(Some(CallbackMessage::Other(other))) => {
                    let frame = json!({ "event": "callback", "data": other });
                    if out.send(Message::Text(frame.to_string())).await.is_err() {
                        return;
                    }
                }
                Err(error) => {
                    tracing::debug!(%error, "callback subscription lost (worker restarting?)");
                    tokio::time::sleep(RESUBSCRIBE_PAUSE).await;
                    break;
                }
            }
        }
    }
}

/// Tell the worker to stop user background activity, with a bound so a
/// dead worker can't hang the disconnect path.
async fn notify_worker_disconnected(state: &SharedState, session: &Session) {
    let command = Command::ClientDisconnected {
        session_id: session.id.to_string(),
    };

    let mut client = state.command.lock().await;
    match client.call_timeout(&command, DISCONNECT_NOTIFY_TIMEOUT).await {
        Ok(_) => tracing::debug!("worker notified of the disconnect"),
        Err(error) => {
            tracing::warn!(%error, "couldn't notify the worker about the disconnect");
        }
    }
}
