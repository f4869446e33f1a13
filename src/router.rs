use std::sync::Arc;

use proto::envelope::events;
use proto::{Envelope, ErrorKind, Principal, Role};
use serde_json::{Value, json};
use service::queue::PushOutcome;
use service::registry::Session;
use service::routing::{self, Route};

use crate::{Hub, unix_now};

/// Apply the routing matrix to one admitted envelope.
pub fn dispatch(hub: &Hub, source: &Arc<Session>, envelope: Envelope) {
    match routing::classify(&source.principal, &envelope.event_type) {
        // Liveness was refreshed by the receive loop; nothing to route.
        Route::Heartbeat => {}
        Route::Broadcast { min_role } => broadcast_from_adapter(hub, source, envelope, min_role),
        Route::CommandResult => deliver_command_result(hub, source, envelope),
        Route::ToAdapter => forward_to_adapter(hub, source, envelope),
        Route::ServerInfo => reply_server_info(hub, source, &envelope),
        Route::Deny(kind) => {
            let message = match kind {
                ErrorKind::UnknownEvent => format!("unknown event: {}", envelope.event_type),
                _ => kind.to_string(),
            };
            reply_error(hub, source, kind, &message, envelope.message_id);
        }
    }
}

/// Fan an adapter event out to every client at or above the floor.
/// `data.server_id` always comes from the authenticated principal.
fn broadcast_from_adapter(hub: &Hub, source: &Arc<Session>, mut envelope: Envelope, min_role: Role) {
    let Principal::Adapter { server_id, .. } = &source.principal else {
        return;
    };

    envelope.set_server_id(server_id);

    // server_info events double as the per-server state the registry keeps
    // for get_server_info.
    if envelope.event_type == events::SERVER_INFO {
        if let Ok(state) = serde_json::to_string(&envelope.data) {
            if hub
                .registry
                .kv_set(&format!("server:{server_id}:info"), state)
                .is_err()
            {
                log::debug!("server state too large, not stored: server_id={server_id}");
            }
        }
    }

    for destination in hub.registry.clients_with_role_at_least(min_role) {
        send_to(hub, &destination, envelope.clone());
    }
}

/// Forward a role-cleared client command to the adapter it addresses.
fn forward_to_adapter(hub: &Hub, source: &Arc<Session>, envelope: Envelope) {
    let Some(server_id) = envelope.server_id().map(str::to_string) else {
        reply_error(
            hub,
            source,
            ErrorKind::MalformedEnvelope,
            "data.server_id is required",
            envelope.message_id,
        );
        return;
    };

    let Some(adapter) = hub.registry.adapter_for_server(&server_id) else {
        reply_error(
            hub,
            source,
            ErrorKind::NoSuchServer,
            &format!("no such server: {server_id}"),
            envelope.message_id,
        );
        return;
    };

    if envelope.requires_ack {
        let Some(message_id) = envelope.message_id.clone() else {
            reply_error(
                hub,
                source,
                ErrorKind::MalformedEnvelope,
                "requiresAck needs a messageId",
                None,
            );
            return;
        };

        hub.acks.arm(
            &message_id,
            source.conn_id,
            adapter.conn_id,
            unix_now() + hub.config.ack_timeout_seconds,
        );
    }

    // Forwarded verbatim; the adapter sees exactly what the client sent.
    send_to(hub, &adapter, envelope);
}

/// Match a `command_result` against the pending-ack table and hand it to
/// the waiting client. Unmatched results are dropped.
fn deliver_command_result(hub: &Hub, adapter: &Arc<Session>, envelope: Envelope) {
    let Some(reply_to) = envelope.reply_to.as_deref() else {
        return;
    };
    let Some(source_id) = hub.acks.resolve(reply_to, adapter.conn_id) else {
        return;
    };

    if let Some(source) = hub.registry.get(source_id) {
        send_to(hub, &source, envelope);
    }
}

/// Synthesize the `get_server_info` reply from the registry; nothing is
/// forwarded to any adapter.
fn reply_server_info(hub: &Hub, source: &Arc<Session>, request: &Envelope) {
    let data = match request.server_id() {
        Some(server_id) => {
            let adapter = hub.registry.adapter_for_server(server_id);
            let server_name = adapter.as_ref().and_then(|session| match &session.principal {
                Principal::Adapter { server_name, .. } => server_name.clone(),
                Principal::Client { .. } => None,
            });
            let state = hub
                .registry
                .kv_get(&format!("server:{server_id}:info"))
                .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
                .unwrap_or(Value::Null);

            json!({
                "server_id": server_id,
                "server_name": server_name,
                "online": adapter.is_some(),
                "state": state,
            })
        }
        None => {
            let servers: Vec<Value> = hub
                .registry
                .connected_servers()
                .into_iter()
                .map(|(server_id, server_name)| {
                    json!({ "server_id": server_id, "server_name": server_name })
                })
                .collect();

            json!({ "servers": servers, "info": hub.config.server_info.clone() })
        }
    };

    let mut reply = Envelope::new(events::SERVER_INFO, data);
    reply.message_id = Some(uuid::Uuid::new_v4().to_string());
    reply.reply_to = request.message_id.clone();
    reply.timestamp = Some(unix_now());
    send_to(hub, source, reply);
}

/// Hub-originated presence broadcast when an adapter registers or drops.
pub fn announce_server(hub: &Hub, server_id: &str, server_name: Option<&str>, connected: bool) {
    let event = if connected {
        events::SERVER_CONNECTED
    } else {
        events::SERVER_DISCONNECTED
    };

    let mut envelope = Envelope::new(
        event,
        json!({ "server_id": server_id, "server_name": server_name }),
    );
    envelope.message_id = Some(uuid::Uuid::new_v4().to_string());
    envelope.timestamp = Some(unix_now());

    for destination in hub.registry.clients_with_role_at_least(Role::Guest) {
        send_to(hub, &destination, envelope.clone());
    }
}

pub fn reply_error(
    hub: &Hub,
    source: &Arc<Session>,
    kind: ErrorKind,
    message: &str,
    reply_to: Option<String>,
) {
    let mut envelope = Envelope::error(kind, message, reply_to);
    envelope.timestamp = Some(unix_now());
    send_to(hub, source, envelope);
}

/// Enqueue on a destination. Overflow is the queue's business; the router
/// only logs what happened.
pub fn send_to(hub: &Hub, destination: &Arc<Session>, envelope: Envelope) {
    match destination.send(envelope) {
        PushOutcome::Queued => {}
        PushOutcome::DroppedOldest => {
            log::debug!(
                "slow client, oldest envelope dropped: conn_id={}, addr={}",
                destination.conn_id,
                destination.remote
            );
        }
        PushOutcome::Overflowed => {
            hub.statistics.connection_error();
            log::warn!(
                "adapter cannot keep up, disconnecting: conn_id={}, addr={}",
                destination.conn_id,
                destination.remote
            );
        }
        PushOutcome::Closed => {}
    }
}
