pub mod config;
pub mod router;
pub mod server;
pub mod statistics;
pub mod supervisor;

use std::{
    sync::Arc,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use proto::TokenValidator;
use service::ack::AckTable;
use service::limiter::{RateLimiter, RateLimiterOptions};
use service::registry::Registry;
use tokio::sync::watch;

use self::{config::Config, statistics::Statistics};

/// Everything the listeners, sessions and supervisor share.
pub struct Hub {
    pub config: Arc<Config>,
    pub registry: Registry,
    pub limiter: RateLimiter,
    pub acks: AckTable,
    pub statistics: Statistics,
    pub adapter_tokens: TokenValidator,
    pub client_tokens: TokenValidator,
    pub started_at: Instant,
    shutdown: watch::Sender<bool>,
}

pub type SharedHub = Arc<Hub>;

impl Hub {
    pub fn new(config: Arc<Config>) -> SharedHub {
        let (shutdown, _) = watch::channel(false);
        let limiter_options = RateLimiterOptions {
            window_secs: config.rate_limits.window_duration_seconds,
            ban_threshold: config.rate_limits.ban_threshold,
            ban_secs: config.rate_limits.ban_duration_hours * 3600,
        };

        Arc::new(Self {
            registry: Registry::new(config.send_queue_size, config.kv_budget_bytes),
            limiter: RateLimiter::new(limiter_options),
            acks: AckTable::new(),
            statistics: Statistics::default(),
            adapter_tokens: TokenValidator::new(
                &config.adapter_secret,
                config.token_issuer.as_deref(),
            ),
            client_tokens: TokenValidator::new(
                &config.client_secret,
                config.token_issuer.as_deref(),
            ),
            started_at: Instant::now(),
            shutdown,
            config,
        })
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn signal_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Refresh the connection gauges from the registry.
    pub fn refresh_gauges(&self) {
        self.statistics.set_active_adapters(self.registry.active_adapters());
        self.statistics.set_active_clients(self.registry.clients_by_role());
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Start the hub and run until shutdown. Opened up as a library entry so
/// the end-to-end tests can boot the real server in-process.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let hub = Hub::new(config);

    server::run(hub.clone()).await?;
    supervisor::run(hub).await;
    Ok(())
}
