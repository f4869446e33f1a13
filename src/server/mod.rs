pub mod session;

use std::net::SocketAddr;

use axum::{
    Json, Router,
    extract::{
        ConnectInfo, State,
        ws::{CloseFrame, Message, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use proto::error::close;
use proto::{Principal, Role, TokenError};
use serde_json::json;
use service::limiter::Admission;
use service::registry::{ListenerKind, SessionParams};
use tokio::net::TcpListener;

use crate::{SharedHub, router, unix_now};

/// Frames above this close the session with 1009.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Bind both listeners and serve them in the background. Returns once the
/// sockets are bound so a bind failure is a startup error, not a log line.
pub async fn run(hub: SharedHub) -> anyhow::Result<()> {
    let adapter_listener =
        TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], hub.config.adapter_port))).await?;
    let client_listener =
        TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], hub.config.client_port))).await?;

    let adapter_app = Router::new()
        .route("/", any(adapter_ws))
        .with_state(hub.clone());
    let client_app = Router::new()
        .route("/", any(client_ws))
        .route("/health", get(health))
        .with_state(hub.clone());

    log::info!("adapter listener: port={}", hub.config.adapter_port);
    log::info!("client listener: port={}", hub.config.client_port);

    for (listener, app) in [(adapter_listener, adapter_app), (client_listener, client_app)] {
        let mut shutdown = hub.subscribe_shutdown();
        tokio::spawn(async move {
            let serve = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            });

            if let Err(e) = serve.await {
                log::error!("listener failed: err={e}");
            }
        });
    }

    Ok(())
}

async fn health(State(hub): State<SharedHub>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptime_seconds": hub.started_at.elapsed().as_secs(),
        "active_connections": hub.registry.len(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn adapter_ws(
    State(hub): State<SharedHub>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let now = unix_now();

    if let Some(refusal) = accept_gate(&hub, &headers, addr, now) {
        return refusal;
    }

    // Pre-handshake budget: read-only here, spent only on a failed
    // handshake so a healthy adapter can reconnect freely.
    let unauth_key = format!("unauth-adapter:{}", addr.ip());
    let limit = hub.config.rate_limits.unauthenticated_adapter_attempts_per_minute;
    if hub.limiter.peek(&unauth_key, limit, now) == Admission::Deny {
        hub.statistics.rate_limit_deny();
        return close_after_upgrade(ws, close::RATE_LIMITED, "too many attempts");
    }

    let Some(token) = bearer(&headers) else {
        auth_failed(&hub, &unauth_key, limit, addr, now);
        return close_after_upgrade(ws, close::AUTH_FAILED, "missing authorization");
    };

    match hub.adapter_tokens.validate_adapter(token) {
        Ok(principal) => {
            ws.max_message_size(MAX_FRAME_BYTES * 2).on_upgrade(move |socket| {
                accept_session(hub, addr, ListenerKind::Adapter, principal, socket)
            })
        }
        Err(e) => {
            auth_failed(&hub, &unauth_key, limit, addr, now);
            log::warn!("adapter auth failed: addr={addr}, err={e}");
            close_after_upgrade(ws, close::AUTH_FAILED, token_reason(e))
        }
    }
}

async fn client_ws(
    State(hub): State<SharedHub>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let now = unix_now();

    if let Some(refusal) = accept_gate(&hub, &headers, addr, now) {
        return refusal;
    }

    let principal = match bearer(&headers) {
        Some(token) => match hub.client_tokens.validate_client(token) {
            Ok(principal) => principal,
            Err(e) => {
                hub.statistics.authentication_failure();
                log::warn!("client auth failed: addr={addr}, err={e}");
                return close_after_upgrade(ws, close::AUTH_FAILED, token_reason(e));
            }
        },
        // No credentials: an anonymous Guest session.
        None => Principal::Client {
            user_id: uuid::Uuid::new_v4().to_string(),
            display_name: None,
            role: Role::Guest,
        },
    };

    ws.max_message_size(MAX_FRAME_BYTES * 2)
        .on_upgrade(move |socket| accept_session(hub, addr, ListenerKind::Client, principal, socket))
}

/// Origin and ban checks shared by both listeners. Refusals here never run
/// the websocket handshake.
fn accept_gate(
    hub: &SharedHub,
    headers: &HeaderMap,
    addr: SocketAddr,
    now: u64,
) -> Option<Response> {
    if !origin_allowed(&hub.config.allowed_origins, headers) {
        log::warn!("origin denied: addr={addr}");
        return Some((StatusCode::FORBIDDEN, "origin not allowed").into_response());
    }

    if hub.limiter.is_banned(addr.ip(), now) {
        log::warn!("banned address rejected: addr={addr}");
        return Some((StatusCode::FORBIDDEN, "banned").into_response());
    }

    None
}

fn origin_allowed(allowed: &[String], headers: &HeaderMap) -> bool {
    let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        // Non-browser peers send no Origin; the check defends browsers.
        return true;
    };

    allowed.iter().any(|entry| entry == "*" || entry == origin)
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// A failed adapter handshake spends unauth budget and may trip the ban.
fn auth_failed(hub: &SharedHub, unauth_key: &str, limit: u32, addr: SocketAddr, now: u64) {
    hub.statistics.authentication_failure();
    hub.limiter.check(unauth_key, limit, addr.ip(), now);
}

fn token_reason(e: TokenError) -> &'static str {
    match e {
        TokenError::Expired => "expired token",
        TokenError::BadSignature => "bad signature",
        TokenError::Malformed => "malformed token",
        TokenError::MissingClaim(_) => "missing claim",
    }
}

/// Accept the upgrade only to deliver a close code the peer can read.
fn close_after_upgrade(ws: WebSocketUpgrade, code: u16, reason: &'static str) -> Response {
    ws.on_upgrade(move |mut socket| async move {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await;
    })
}

/// Register the session, run it, and clean up afterwards.
async fn accept_session(
    hub: SharedHub,
    addr: SocketAddr,
    origin: ListenerKind,
    principal: Principal,
    socket: axum::extract::ws::WebSocket,
) {
    let session = hub.registry.insert(SessionParams {
        remote: addr,
        origin,
        principal,
        now: unix_now(),
    });
    hub.refresh_gauges();

    match &session.principal {
        Principal::Adapter {
            server_id,
            server_name,
        } => {
            log::info!(
                "adapter connected: conn_id={}, addr={addr}, server_id={server_id}",
                session.conn_id
            );
            router::announce_server(&hub, server_id, server_name.as_deref(), true);
        }
        Principal::Client { user_id, role, .. } => {
            log::info!(
                "client connected: conn_id={}, addr={addr}, user_id={user_id}, role={}",
                session.conn_id,
                role.as_str()
            );
        }
    }

    session::run(hub.clone(), session.clone(), socket).await;

    hub.registry.remove(session.conn_id);
    hub.refresh_gauges();

    if let Principal::Adapter {
        server_id,
        server_name,
    } = &session.principal
    {
        // A displaced adapter was already replaced in the index; only a
        // real departure is announced.
        if hub.registry.adapter_for_server(server_id).is_none() {
            router::announce_server(&hub, server_id, server_name.as_deref(), false);
        }
    }

    log::info!(
        "session closed: conn_id={}, addr={addr}",
        session.conn_id
    );
}
