use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::dispatcher::{Flow, Gateway};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const MAX_MISSED_PONGS: u8 = 2;
/// How long the writer gets to say goodbye once the reader is done.
const WRITER_GRACE: Duration = Duration::from_secs(2);

/// Drive one WebSocket until either side goes away.
///
/// Frames are read and handled one at a time, each to completion, so a
/// disconnect never interrupts a half-applied command. `token` comes from the
/// upgrade request and pre-authenticates the connection.
pub async fn handle_socket(socket: WebSocket, gateway: Gateway, token: Option<String>) {
    let (mut sender, mut receiver) = socket.split();
    let (mut conn, mut outbound_rx) = gateway.open_connection();
    let conn_id = conn.id();
    let cancel = conn.cancel_token();
    debug!("Connection {} opened", conn_id);

    if let Some(token) = token {
        gateway.resume_or_report(&mut conn, &token).await;
    }

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag = pong_received.clone();
    let writer_cancel = cancel.clone();

    // Outbound queue -> socket, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                payload = outbound_rx.recv() => {
                    let Some(payload) = payload else { break };
                    if sender.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= MAX_MISSED_PONGS {
                            warn!(
                                "Connection {} missed {} pongs, dropping it",
                                conn_id, missed_heartbeats
                            );
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }

        writer_cancel.cancel();
        let _ = sender.send(Message::Close(None)).await;
    });

    // Socket -> dispatcher. Cancellation is only observed between frames.
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = receiver.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => {
                if gateway.handle_text(&mut conn, text.as_str()).await == Flow::Close {
                    break;
                }
            }
            Some(Ok(Message::Binary(_))) => {
                if gateway.handle_malformed(&mut conn) == Flow::Close {
                    break;
                }
            }
            Some(Ok(Message::Pong(_))) => pong_received.store(true, Ordering::Release),
            // axum answers pings on its own
            Some(Ok(Message::Ping(_))) => {}
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                debug!("Connection {} read failed: {}", conn_id, e);
                break;
            }
        }
    }

    let who = conn
        .session()
        .map(|s| format!("{} ({})", s.username, s.user_id));
    gateway.close_connection(&mut conn).await;
    if tokio::time::timeout(WRITER_GRACE, &mut send_task).await.is_err() {
        send_task.abort();
    }

    match who {
        Some(who) => info!("{} disconnected from gateway", who),
        None => debug!("Connection {} closed", conn_id),
    }
}
