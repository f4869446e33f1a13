use std::time::Duration;

use proto::error::close;
use proto::{Envelope, ErrorKind};
use tokio::time::{Instant, interval, sleep};

use crate::{SharedHub, router, unix_now};

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// The hub's only long-running background loop: one-second sweeps for
/// heartbeat timeouts, ban expiry and ack deadlines, plus the metrics tick.
/// Returns after the shutdown signal once sessions have drained.
pub async fn run(hub: SharedHub) {
    let mut sweep = interval(Duration::from_secs(1));
    let mut metrics = interval(Duration::from_secs(hub.config.metrics_interval_seconds));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = sweep.tick() => sweep_once(&hub, unix_now()),
            _ = metrics.tick() => {
                hub.statistics.tick_rate(hub.config.metrics_interval_seconds);
                hub.refresh_gauges();
                if log::log_enabled!(log::Level::Debug) {
                    if let Ok(snapshot) = serde_json::to_string(&hub.statistics.snapshot()) {
                        log::debug!("statistics: {snapshot}");
                    }
                }
            }
            _ = &mut ctrl_c => break,
        }
    }

    shutdown(&hub).await;
}

fn sweep_once(hub: &SharedHub, now: u64) {
    let timeout = hub.config.connection_timeout_seconds;

    for session in hub.registry.sessions_snapshot() {
        if !session.is_closing() && now.saturating_sub(session.last_pong()) > timeout {
            log::warn!(
                "heartbeat timeout: conn_id={}, addr={}",
                session.conn_id,
                session.remote
            );
            session.close(close::GOING_AWAY, "heartbeat_timeout", false);
        }

        // Reap entries whose tasks died without cleaning up; a closing
        // session that stopped reading long ago is gone.
        if session.is_closing() && now.saturating_sub(session.last_received()) > timeout {
            hub.registry.remove(session.conn_id);
        }
    }

    for (message_id, source_id) in hub.acks.expired(now) {
        if let Some(source) = hub.registry.get(source_id) {
            let mut envelope = Envelope::error(
                ErrorKind::AckTimeout,
                "no command_result before the deadline",
                Some(message_id),
            );
            envelope.timestamp = Some(now);
            router::send_to(hub, &source, envelope);
        }
    }

    hub.statistics.set_bans_active(hub.limiter.sweep(now));
}

/// Broadcast the close, give the send queues a bounded drain window, then
/// stop the listeners.
async fn shutdown(hub: &SharedHub) {
    log::info!("shutting down: sessions={}", hub.registry.len());
    hub.registry.close_all(close::GOING_AWAY, "shutdown");

    let deadline = Instant::now() + SHUTDOWN_DRAIN;
    while !hub.registry.is_empty() && Instant::now() < deadline {
        sleep(Duration::from_millis(100)).await;
    }

    hub.signal_shutdown();
    log::info!("shutdown complete: remaining_sessions={}", hub.registry.len());
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, SocketAddr};
    use std::sync::Arc;

    use proto::{Principal, Role};
    use service::queue::Outbound;
    use service::registry::{ListenerKind, SessionParams};

    use super::*;
    use crate::{Hub, config::Config};

    fn hub(tweak: impl FnOnce(&mut Config)) -> SharedHub {
        let mut config = Config {
            adapter_secret: "a".repeat(32),
            client_secret: "b".repeat(32),
            ..Config::default()
        };
        tweak(&mut config);
        Hub::new(Arc::new(config))
    }

    fn client_params(now: u64) -> SessionParams {
        SessionParams {
            remote: SocketAddr::from(([127, 0, 0, 1], 40000)),
            origin: ListenerKind::Client,
            principal: Principal::Client {
                user_id: "u1".to_string(),
                display_name: None,
                role: Role::Guest,
            },
            now,
        }
    }

    #[tokio::test]
    async fn silent_session_closed_after_timeout() {
        let hub = hub(|_| {});
        let timeout = hub.config.connection_timeout_seconds;
        let session = hub.registry.insert(client_params(1000));

        sweep_once(&hub, 1000 + timeout);
        assert!(!session.is_closing());

        sweep_once(&hub, 1000 + timeout + 1);
        assert!(session.is_closing());
        match session.next_outbound().await {
            Some(Outbound::Close { code, reason }) => {
                assert_eq!(code, close::GOING_AWAY);
                assert_eq!(reason, "heartbeat_timeout");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn pong_keeps_the_session_alive() {
        let hub = hub(|_| {});
        let timeout = hub.config.connection_timeout_seconds;
        let session = hub.registry.insert(client_params(1000));

        session.pong(1000 + timeout);
        sweep_once(&hub, 1000 + timeout + 1);
        assert!(!session.is_closing());
        assert!(hub.registry.get(session.conn_id).is_some());
    }

    #[test]
    fn closing_session_reaped_once_it_stops_reading() {
        let hub = hub(|_| {});
        let timeout = hub.config.connection_timeout_seconds;
        let session = hub.registry.insert(client_params(1000));
        session.close(close::GOING_AWAY, "shutdown", false);

        sweep_once(&hub, 1000 + timeout);
        assert!(hub.registry.get(session.conn_id).is_some());

        sweep_once(&hub, 1000 + timeout + 1);
        assert!(hub.registry.get(session.conn_id).is_none());
    }

    #[tokio::test]
    async fn expired_ack_synthesizes_timeout_error() {
        let hub = hub(|_| {});
        let session = hub.registry.insert(client_params(1000));
        hub.acks.arm("m-1", session.conn_id, 999, 1015);

        sweep_once(&hub, 1014);
        assert_eq!(session.queue_len(), 0);

        sweep_once(&hub, 1015);
        match session.next_outbound().await {
            Some(Outbound::Body(envelope)) => {
                assert_eq!(envelope.event_type, "error");
                assert_eq!(envelope.data["kind"], serde_json::json!("ack_timeout"));
                assert_eq!(envelope.reply_to.as_deref(), Some("m-1"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(hub.acks.is_empty());
    }

    #[test]
    fn ban_sweep_refreshes_gauge_and_expires() {
        let hub = hub(|config| config.rate_limits.ban_threshold = 1);
        let ip = IpAddr::from([127, 0, 0, 9]);

        // One allow fills the limit, the next deny crosses the threshold.
        hub.limiter.check("client:u1", 1, ip, 1000);
        hub.limiter.check("client:u1", 1, ip, 1000);
        assert!(hub.limiter.is_banned(ip, 1000));

        sweep_once(&hub, 1000);
        assert_eq!(hub.statistics.snapshot().bans_active, 1);

        let ban_secs = hub.config.rate_limits.ban_duration_hours * 3600;
        sweep_once(&hub, 1000 + ban_secs);
        assert_eq!(hub.statistics.snapshot().bans_active, 0);
        assert!(!hub.limiter.is_banned(ip, 1000 + ban_secs));
    }
}
