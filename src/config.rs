use std::{env, fs, path::Path, path::PathBuf, str::FromStr};

use anyhow::{Context, Result, ensure};
use clap::Parser;
use proto::Role;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Per-key admission limits, all per sliding window.
#[derive(Deserialize, Debug, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimits {
    /// Sliding window length. Limits below are counted over this window.
    pub window_duration_seconds: u64,
    pub guest_requests_per_minute: u32,
    pub player_requests_per_minute: u32,
    pub admin_requests_per_minute: u32,
    /// Also the limit for authenticated adapters; both are trusted tiers.
    pub system_requests_per_minute: u32,
    /// Pre-handshake attempts on the adapter listener, per remote address.
    pub unauthenticated_adapter_attempts_per_minute: u32,
    /// Denies within one window before the remote address is banned.
    pub ban_threshold: u32,
    pub ban_duration_hours: u64,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            window_duration_seconds: 60,
            guest_requests_per_minute: 60,
            player_requests_per_minute: 120,
            admin_requests_per_minute: 300,
            system_requests_per_minute: 1000,
            unauthenticated_adapter_attempts_per_minute: 10,
            ban_threshold: 10,
            ban_duration_hours: 1,
        }
    }
}

impl RateLimits {
    pub fn for_role(&self, role: Role) -> u32 {
        match role {
            Role::Guest => self.guest_requests_per_minute,
            Role::Player => self.player_requests_per_minute,
            Role::Admin => self.admin_requests_per_minute,
            Role::System => self.system_requests_per_minute,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "error" => Self::Error,
            "warn" => Self::Warn,
            "info" => Self::Info,
            "debug" => Self::Debug,
            "trace" => Self::Trace,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    /// Listener for game-server adapters.
    pub adapter_port: u16,
    /// Listener for browsers, apps and privileged services. Also serves
    /// `GET /health`.
    pub client_port: u16,
    /// HS256 signing secret for adapter bearer tokens.
    pub adapter_secret: String,
    /// HS256 signing secret for client bearer tokens.
    pub client_secret: String,
    /// When set, tokens carrying an `iss` claim must match it.
    pub token_issuer: Option<String>,
    pub rate_limits: RateLimits,
    /// `Origin` allow-list; a single `"*"` entry permits all. Requests
    /// without an Origin header are always allowed.
    pub allowed_origins: Vec<String>,
    pub heartbeat_interval_seconds: u64,
    /// A session whose last pong is older than this is closed.
    pub connection_timeout_seconds: u64,
    pub ack_timeout_seconds: u64,
    /// Outbound queue depth per session.
    pub send_queue_size: usize,
    /// Total byte budget of the key/value registry.
    pub kv_budget_bytes: usize,
    pub metrics_interval_seconds: u64,
    pub log_level: LogLevel,
    /// Opaque block surfaced to clients through `get_server_info`.
    pub server_info: Map<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            adapter_port: 8082,
            client_port: 8081,
            adapter_secret: String::new(),
            client_secret: String::new(),
            token_issuer: None,
            rate_limits: RateLimits::default(),
            allowed_origins: vec!["*".to_string()],
            heartbeat_interval_seconds: 30,
            connection_timeout_seconds: 90,
            ack_timeout_seconds: 15,
            send_queue_size: 1024,
            kv_budget_bytes: 16 * 1024 * 1024,
            metrics_interval_seconds: 1,
            log_level: LogLevel::Info,
            server_info: Map::new(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Specify the configuration file path.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Write a commented example configuration to the given path and exit.
    #[arg(long)]
    pub generate_config: Option<PathBuf>,
}

impl Config {
    /// Read the configuration file (defaults when none is given), apply
    /// `BCON_*` environment overrides, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("read config file {}", path.display()))?;
                serde_json5::from_str(&text)
                    .with_context(|| format!("parse config file {}", path.display()))?
            }
            None => Self::default(),
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// `BCON_<UPPER_KEY>` overrides for the top-level keys.
    fn apply_env_overrides(&mut self) -> Result<()> {
        fn parsed<T: FromStr>(key: &str, out: &mut T) -> Result<()>
        where
            T::Err: std::fmt::Display,
        {
            if let Ok(raw) = env::var(key) {
                *out = raw
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid {key}: {e}"))?;
            }
            Ok(())
        }

        parsed("BCON_ADAPTER_PORT", &mut self.adapter_port)?;
        parsed("BCON_CLIENT_PORT", &mut self.client_port)?;
        parsed("BCON_ADAPTER_SECRET", &mut self.adapter_secret)?;
        parsed("BCON_CLIENT_SECRET", &mut self.client_secret)?;
        parsed("BCON_HEARTBEAT_INTERVAL_SECONDS", &mut self.heartbeat_interval_seconds)?;
        parsed("BCON_CONNECTION_TIMEOUT_SECONDS", &mut self.connection_timeout_seconds)?;
        parsed("BCON_ACK_TIMEOUT_SECONDS", &mut self.ack_timeout_seconds)?;
        parsed("BCON_SEND_QUEUE_SIZE", &mut self.send_queue_size)?;
        parsed("BCON_KV_BUDGET_BYTES", &mut self.kv_budget_bytes)?;
        parsed("BCON_METRICS_INTERVAL_SECONDS", &mut self.metrics_interval_seconds)?;
        parsed("BCON_LOG_LEVEL", &mut self.log_level)?;

        if let Ok(raw) = env::var("BCON_TOKEN_ISSUER") {
            self.token_issuer = (!raw.is_empty()).then_some(raw);
        }
        if let Ok(raw) = env::var("BCON_ALLOWED_ORIGINS") {
            self.allowed_origins = raw.split(',').map(|s| s.trim().to_string()).collect();
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.adapter_secret.len() >= 32,
            "adapter_secret must be at least 32 characters"
        );
        ensure!(
            self.client_secret.len() >= 32,
            "client_secret must be at least 32 characters"
        );
        ensure!(self.adapter_port != 0, "adapter_port must be in 1-65535");
        ensure!(self.client_port != 0, "client_port must be in 1-65535");
        ensure!(
            self.adapter_port != self.client_port,
            "adapter_port and client_port must be distinct"
        );

        let limits = &self.rate_limits;
        ensure!(limits.window_duration_seconds > 0, "window_duration_seconds must be > 0");
        for (name, value) in [
            ("guest_requests_per_minute", limits.guest_requests_per_minute),
            ("player_requests_per_minute", limits.player_requests_per_minute),
            ("admin_requests_per_minute", limits.admin_requests_per_minute),
            ("system_requests_per_minute", limits.system_requests_per_minute),
            (
                "unauthenticated_adapter_attempts_per_minute",
                limits.unauthenticated_adapter_attempts_per_minute,
            ),
            ("ban_threshold", limits.ban_threshold),
        ] {
            ensure!(value > 0, "{name} must be > 0");
        }
        ensure!(limits.ban_duration_hours > 0, "ban_duration_hours must be > 0");

        ensure!(
            self.heartbeat_interval_seconds < self.connection_timeout_seconds,
            "heartbeat_interval_seconds must be less than connection_timeout_seconds"
        );
        ensure!(self.ack_timeout_seconds > 0, "ack_timeout_seconds must be > 0");
        ensure!(self.send_queue_size > 0, "send_queue_size must be > 0");
        ensure!(self.metrics_interval_seconds > 0, "metrics_interval_seconds must be > 0");

        Ok(())
    }
}

/// Commented example emitted by `--generate-config`. JSON5, so the comments
/// survive; a plain JSON file is equally accepted.
pub const EXAMPLE_CONFIG: &str = r#"{
    // Listener ports. Adapters are the trusted game-server side,
    // clients are browsers, apps and privileged services.
    adapter_port: 8082,
    client_port: 8081,

    // Independent HS256 signing secrets, one per listener.
    // Both must be at least 32 characters.
    adapter_secret: "change-me-to-a-32+-char-random-string",
    client_secret: "change-me-to-another-32+-char-string",

    // When set, tokens carrying an `iss` claim must match it.
    // token_issuer: "bcon",

    rate_limits: {
        window_duration_seconds: 60,
        guest_requests_per_minute: 60,
        player_requests_per_minute: 120,
        admin_requests_per_minute: 300,
        system_requests_per_minute: 1000,
        unauthenticated_adapter_attempts_per_minute: 10,
        // Denies within one window before the remote address is banned.
        ban_threshold: 10,
        ban_duration_hours: 1,
    },

    // Origin allow-list; "*" permits all.
    allowed_origins: ["*"],

    heartbeat_interval_seconds: 30,
    connection_timeout_seconds: 90,
    ack_timeout_seconds: 15,

    send_queue_size: 1024,
    kv_budget_bytes: 16777216,
    metrics_interval_seconds: 1,

    // error | warn | info | debug | trace
    log_level: "info",

    // Opaque block surfaced to clients through get_server_info.
    server_info: {
        name: "bcon",
        motd: "",
    },
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            adapter_secret: "a".repeat(32),
            client_secret: "b".repeat(32),
            ..Config::default()
        }
    }

    #[test]
    fn defaults_fail_without_secrets() {
        assert!(Config::default().validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn ports_must_be_distinct() {
        let mut config = valid();
        config.client_port = config.adapter_port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn heartbeat_must_be_shorter_than_timeout() {
        let mut config = valid();
        config.heartbeat_interval_seconds = 90;
        config.connection_timeout_seconds = 90;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_rate_limit_rejected() {
        let mut config = valid();
        config.rate_limits.player_requests_per_minute = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn example_config_parses_and_validates() {
        let config: Config = serde_json5::from_str(EXAMPLE_CONFIG).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.adapter_port, 8082);
        assert_eq!(config.rate_limits.player_requests_per_minute, 120);
        assert_eq!(config.server_info.get("name"), Some(&Value::from("bcon")));
    }

    #[test]
    fn strict_json_accepted() {
        let raw = r#"{"adapter_secret":"00000000000000000000000000000000",
                      "client_secret":"11111111111111111111111111111111",
                      "adapter_port":9001,"client_port":9002}"#;
        let config: Config = serde_json5::from_str(raw).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.adapter_port, 9001);
    }

    #[test]
    fn env_override_applied() {
        // SAFETY: test-local variable name, no other test reads it.
        unsafe {
            env::set_var("BCON_ADAPTER_PORT", "9999");
        }
        let mut config = valid();
        config.apply_env_overrides().unwrap();
        unsafe {
            env::remove_var("BCON_ADAPTER_PORT");
        }
        assert_eq!(config.adapter_port, 9999);
    }

    #[test]
    fn role_limits() {
        let limits = RateLimits::default();
        assert_eq!(limits.for_role(Role::Guest), 60);
        assert_eq!(limits.for_role(Role::System), 1000);
    }
}
