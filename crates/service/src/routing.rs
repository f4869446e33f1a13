use proto::envelope::events;
use proto::{ErrorKind, Principal, Role};

/// Where one inbound envelope goes. Pure function of the source principal
/// and the event name; resolving destinations against live sessions is the
/// server's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Adapter-sourced fan-out to every client at or above the floor.
    Broadcast { min_role: Role },
    /// Client command toward the adapter named by `data.server_id`.
    ToAdapter,
    /// Synthesized from the registry; never forwarded.
    ServerInfo,
    /// Swallowed; refreshes liveness only.
    Heartbeat,
    /// Adapter reply matched against the pending-ack table.
    CommandResult,
    /// Bounced back to the source with an error envelope.
    Deny(ErrorKind),
}

pub fn classify(principal: &Principal, event: &str) -> Route {
    if event == events::HEARTBEAT {
        return Route::Heartbeat;
    }

    match principal {
        Principal::Adapter { .. } => match event {
            events::COMMAND_RESULT => Route::CommandResult,
            _ => Route::Broadcast {
                min_role: visibility_floor(event),
            },
        },
        Principal::Client { role, .. } => {
            if event == events::GET_SERVER_INFO {
                return Route::ServerInfo;
            }

            match command_floor(event) {
                Some(floor) if *role >= floor => Route::ToAdapter,
                Some(_) => Route::Deny(ErrorKind::ForbiddenRole),
                None => Route::Deny(ErrorKind::UnknownEvent),
            }
        }
    }
}

/// Minimum role allowed to send each adapter-bound command.
fn command_floor(event: &str) -> Option<Role> {
    Some(match event {
        events::SEND_CHAT => Role::Player,
        events::EXECUTE_COMMAND | events::BLUEMAP => Role::Admin,
        events::REGISTER_COMMAND
        | events::UNREGISTER_COMMAND
        | events::CLEAR_COMMANDS
        | events::BCON_CONFIG => Role::System,
        _ => return None,
    })
}

/// Lowest client role an adapter event is visible to. Everything not
/// explicitly player-facing stays Admin-and-above.
fn visibility_floor(event: &str) -> Role {
    match event {
        events::CHAT_MESSAGE
        | events::PLAYER_JOINED
        | events::PLAYER_LEFT
        | events::SERVER_CONNECTED
        | events::SERVER_DISCONNECTED => Role::Guest,
        _ => Role::Admin,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> Principal {
        Principal::Adapter {
            server_id: "s1".to_string(),
            server_name: None,
        }
    }

    fn client(role: Role) -> Principal {
        Principal::Client {
            user_id: "u1".to_string(),
            display_name: None,
            role,
        }
    }

    #[test]
    fn adapter_events_broadcast_with_floor() {
        assert_eq!(
            classify(&adapter(), "chat_message"),
            Route::Broadcast { min_role: Role::Guest }
        );
        assert_eq!(
            classify(&adapter(), "custom_command_executed"),
            Route::Broadcast { min_role: Role::Admin }
        );
        // Default-deny: unknown adapter events stay Admin-and-above.
        assert_eq!(
            classify(&adapter(), "tps_report"),
            Route::Broadcast { min_role: Role::Admin }
        );
    }

    #[test]
    fn command_result_is_never_broadcast() {
        assert_eq!(classify(&adapter(), "command_result"), Route::CommandResult);
    }

    #[test]
    fn heartbeat_swallowed_for_everyone() {
        assert_eq!(classify(&adapter(), "heartbeat"), Route::Heartbeat);
        assert_eq!(classify(&client(Role::Guest), "heartbeat"), Route::Heartbeat);
    }

    #[test]
    fn guest_cannot_command() {
        assert_eq!(
            classify(&client(Role::Guest), "execute_command"),
            Route::Deny(ErrorKind::ForbiddenRole)
        );
        assert_eq!(
            classify(&client(Role::Guest), "send_chat"),
            Route::Deny(ErrorKind::ForbiddenRole)
        );
        assert_eq!(classify(&client(Role::Guest), "get_server_info"), Route::ServerInfo);
    }

    #[test]
    fn player_may_only_chat() {
        assert_eq!(classify(&client(Role::Player), "send_chat"), Route::ToAdapter);
        assert_eq!(
            classify(&client(Role::Player), "execute_command"),
            Route::Deny(ErrorKind::ForbiddenRole)
        );
        assert_eq!(
            classify(&client(Role::Player), "bcon_config"),
            Route::Deny(ErrorKind::ForbiddenRole)
        );
    }

    #[test]
    fn admin_commands() {
        for event in ["execute_command", "send_chat", "bluemap"] {
            assert_eq!(classify(&client(Role::Admin), event), Route::ToAdapter);
        }
        assert_eq!(
            classify(&client(Role::Admin), "register_command"),
            Route::Deny(ErrorKind::ForbiddenRole)
        );
    }

    #[test]
    fn system_commands_all() {
        for event in [
            "execute_command",
            "send_chat",
            "bluemap",
            "register_command",
            "unregister_command",
            "clear_commands",
            "bcon_config",
        ] {
            assert_eq!(classify(&client(Role::System), event), Route::ToAdapter);
        }
    }

    #[test]
    fn unrecognized_client_events_bounce() {
        assert_eq!(
            classify(&client(Role::System), "player_joined"),
            Route::Deny(ErrorKind::UnknownEvent)
        );
        assert_eq!(
            classify(&client(Role::Guest), "no_such_thing"),
            Route::Deny(ErrorKind::UnknownEvent)
        );
    }
}
