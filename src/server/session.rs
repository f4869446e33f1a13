use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use proto::error::close;
use proto::{Envelope, ErrorKind, Principal};
use service::limiter::Admission;
use service::queue::Outbound;
use service::registry::Session;

use crate::{SharedHub, router, unix_now};

use super::MAX_FRAME_BYTES;

/// Adapter parse-error flood: this many inside one minute closes 4400.
const PARSE_ERROR_FLOOD: u32 = 10;

/// Drive one accepted connection until it closes. The send task is the
/// only writer on the socket; this task only reads and routes.
pub async fn run(hub: SharedHub, session: Arc<Session>, socket: WebSocket) {
    let (ws_tx, ws_rx) = socket.split();

    let send_task = tokio::spawn(send_loop(hub.clone(), session.clone(), ws_tx));
    receive_loop(&hub, &session, ws_rx).await;

    // Make sure the send task terminates even when the receive side ended
    // without a queued close frame (peer close, IO error).
    session.close(close::NORMAL, "", false);
    let _ = send_task.await;
}

async fn send_loop(
    hub: SharedHub,
    session: Arc<Session>,
    mut ws_tx: SplitSink<WebSocket, Message>,
) {
    while let Some(item) = session.next_outbound().await {
        match item {
            Outbound::Body(envelope) => {
                let Ok(text) = serde_json::to_string(&envelope) else {
                    continue;
                };
                if ws_tx.send(Message::Text(text)).await.is_err() {
                    break;
                }
                hub.statistics.message_out();
            }
            Outbound::Ping => {
                if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = ws_tx
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

async fn receive_loop(hub: &SharedHub, session: &Arc<Session>, mut ws_rx: SplitStream<WebSocket>) {
    let mut heartbeat =
        tokio::time::interval(Duration::from_secs(hub.config.heartbeat_interval_seconds));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // Parse-error flood window (adapters only).
    let mut parse_errors: u32 = 0;
    let mut parse_window_start: u64 = 0;
    // Inline rate-limited replies go out at most once per second.
    let mut last_limit_reply: u64 = 0;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                // The close flag is the single cancellation signal; this
                // tick is the guaranteed wakeup that observes it.
                if session.is_closing() {
                    break;
                }
                session.send_ping();
            }

            incoming = ws_rx.next() => {
                let now = unix_now();
                match incoming {
                    None => break,
                    Some(Err(e)) => {
                        hub.statistics.connection_error();
                        log::warn!(
                            "socket error: conn_id={}, addr={}, err={}",
                            session.conn_id, session.remote, e
                        );
                        break;
                    }
                    Some(Ok(message)) => {
                        session.touch(now);
                        match message {
                            Message::Pong(_) => session.pong(now),
                            // The websocket layer answers pings itself.
                            Message::Ping(_) => {}
                            Message::Close(_) => break,
                            Message::Binary(_) => {
                                session.close(close::UNSUPPORTED, "binary frames not supported", true);
                            }
                            Message::Text(text) => handle_text(
                                hub,
                                session,
                                &text,
                                now,
                                &mut parse_errors,
                                &mut parse_window_start,
                                &mut last_limit_reply,
                            ),
                        }

                        if session.is_closing() {
                            break;
                        }
                    }
                }
            }
        }
    }
}

fn handle_text(
    hub: &SharedHub,
    session: &Arc<Session>,
    text: &str,
    now: u64,
    parse_errors: &mut u32,
    parse_window_start: &mut u64,
    last_limit_reply: &mut u64,
) {
    if text.len() > MAX_FRAME_BYTES {
        session.close(close::TOO_BIG, ErrorKind::FrameTooLarge.as_str(), true);
        return;
    }

    hub.statistics.message_in();

    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => {
            *parse_errors = 0;
            envelope
        }
        Err(e) => {
            hub.statistics.parse_error();
            log::debug!(
                "malformed envelope: conn_id={}, addr={}, err={}",
                session.conn_id, session.remote, e
            );

            // Adapters are trusted; a stream of garbage means the peer is
            // broken and should reconnect cleanly.
            if session.principal.is_adapter() {
                if now.saturating_sub(*parse_window_start) >= 60 {
                    *parse_window_start = now;
                    *parse_errors = 0;
                }
                *parse_errors += 1;
                if *parse_errors >= PARSE_ERROR_FLOOD {
                    session.close(close::MALFORMED, "malformed_frames", true);
                }
            }
            return;
        }
    };

    let (key, limit) = match &session.principal {
        Principal::Adapter { .. } => (
            session.principal.rate_key(),
            hub.config.rate_limits.system_requests_per_minute,
        ),
        Principal::Client { role, .. } => (
            session.principal.rate_key(),
            hub.config.rate_limits.for_role(*role),
        ),
    };

    if hub.limiter.check(&key, limit, session.remote.ip(), now) == Admission::Deny {
        hub.statistics.rate_limit_deny();

        // Persistent abuse tripped the ban: this session goes down with it.
        if hub.limiter.is_banned(session.remote.ip(), now) {
            session.close(close::RATE_LIMITED, ErrorKind::Banned.as_str(), true);
            return;
        }

        if now > *last_limit_reply {
            *last_limit_reply = now;
            router::reply_error(
                hub,
                session,
                ErrorKind::RateLimited,
                "rate limited",
                envelope.message_id,
            );
        }
        return;
    }

    router::dispatch(hub, session, envelope);
}
