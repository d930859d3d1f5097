//! WebSocket client sessions
//!
//! One persistent connection per client: a read pump with an idle deadline
//! and a write pump draining the engine's bounded outbox, pinging
//! periodically. The engine never blocks on a socket; everything between it
//! and the peer goes through the outbox.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout;
use tracing::{debug, warn};
use warp::ws::{Message as WsMessage, WebSocket};

use crate::engine::{
    AckPayload, ClientHandle, ErrorPayload, Message, MessageKind, OperationPayload,
    PresencePayload, SyncPayload,
};
use crate::position::AuthorId;

use super::ApiContext;

/// Ping cadence on an otherwise quiet socket.
const PING_INTERVAL: Duration = Duration::from_secs(54);
/// A connection with nothing to say for this long is considered gone.
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Writes that cannot complete within this deadline drop the connection.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// Run one client's session to completion.
pub async fn client_session(socket: WebSocket, ctx: ApiContext, author: AuthorId) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (handle, mut outbox) = ctx.engine.connect_client(author);
    let client_id = handle.id;

    // Write pump: outbox frames plus periodic pings, each under a deadline.
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                frame = outbox.recv() => {
                    let Some(frame) = frame else { break };
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(client = %client_id, "frame serialization failed: {e}");
                            continue;
                        }
                    };
                    match timeout(WRITE_DEADLINE, ws_tx.send(WsMessage::text(text))).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
                _ = ping.tick() => {
                    match timeout(WRITE_DEADLINE, ws_tx.send(WsMessage::ping(Vec::new()))).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
            }
        }
    });

    // Read pump, on this task.
    loop {
        let received = match timeout(READ_IDLE_TIMEOUT, ws_rx.next()).await {
            Err(_) => {
                debug!(client = %client_id, "read idle timeout");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(client = %client_id, "socket error: {e}");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        if received.is_close() {
            break;
        }
        if received.is_ping() || received.is_pong() {
            continue;
        }
        if let Ok(text) = received.to_str() {
            handle_frame(&ctx, &handle, text).await;
        }
    }

    ctx.engine.disconnect_client(client_id);
    writer.abort();
}

async fn handle_frame(ctx: &ApiContext, client: &ClientHandle, text: &str) {
    let frame: Message = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            send_error(client, "bad_frame", &format!("unparseable frame: {e}"));
            return;
        }
    };

    match frame.kind {
        MessageKind::Operation => {
            let payload: OperationPayload = match serde_json::from_value(frame.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    send_error(client, "bad_payload", &format!("bad operation payload: {e}"));
                    return;
                }
            };
            let result = ctx
                .engine
                .process_operation(payload.operation, Some(client.id))
                .await;
            let ack = match result {
                Ok(_) => AckPayload {
                    message_id: frame.message_id,
                    success: true,
                    error: None,
                },
                Err(e) => AckPayload {
                    message_id: frame.message_id,
                    success: false,
                    error: Some(e.to_string()),
                },
            };
            send_frame(client, MessageKind::Ack, &ack);
        }
        MessageKind::Presence => {
            let payload: PresencePayload = match serde_json::from_value(frame.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    send_error(client, "bad_payload", &format!("bad presence payload: {e}"));
                    return;
                }
            };
            if let Err(e) = ctx.engine.update_presence(client.id, payload) {
                send_error(client, "presence_failed", &e.to_string());
            }
        }
        MessageKind::Sync => {
            let payload: SyncPayload = match serde_json::from_value(frame.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    send_error(client, "bad_payload", &format!("bad sync payload: {e}"));
                    return;
                }
            };
            if let Err(e) = ctx
                .engine
                .sync_client(client.id, &payload.document_id, payload.since_version)
                .await
            {
                send_error(client, "sync_failed", &e.to_string());
            }
        }
        MessageKind::Ack | MessageKind::Error => {
            // Client-to-server acks and errors are informational only.
            debug!(client = %client.id, kind = ?frame.kind, "ignoring frame");
        }
    }
}

fn send_frame(client: &ClientHandle, kind: MessageKind, payload: &impl serde::Serialize) {
    match Message::new(kind, payload, client.author.clone()) {
        Ok(message) => {
            client.send(message);
        }
        Err(e) => warn!(client = %client.id, "frame build failed: {e}"),
    }
}

fn send_error(client: &ClientHandle, code: &str, message: &str) {
    send_frame(
        client,
        MessageKind::Error,
        &ErrorPayload {
            code: code.to_string(),
            message: message.to_string(),
        },
    );
}
