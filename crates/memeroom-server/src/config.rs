use std::time::Duration;

use serde::Deserialize;

use memeroom_core::room::{MAX_CAPACITY, MIN_CAPACITY};
use memeroom_core::scoring::VoteShareScoring;

/// Default config file, read from the working directory.
pub const CONFIG_FILE: &str = "memeroom.toml";

/// Top-level server configuration, loaded from `memeroom.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// `"text"` or `"json"`.
    pub log_format: String,
    pub game: GameConfig,
    pub scoring: VoteShareScoring,
    pub limits: LimitsConfig,
    pub keepalive: KeepaliveConfig,
    pub rooms: RoomsConfig,
    pub prompts: PromptsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            log_format: "text".to_string(),
            game: GameConfig::default(),
            scoring: VoteShareScoring::default(),
            limits: LimitsConfig::default(),
            keepalive: KeepaliveConfig::default(),
            rooms: RoomsConfig::default(),
            prompts: PromptsConfig::default(),
        }
    }
}

/// Game pacing and rules.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// Connected participants required to start.
    pub min_players: usize,
    pub max_rounds: u32,
    pub choosing_secs: u64,
    pub voting_secs: u64,
    pub results_secs: u64,
    /// How long before a deadline the `timeout_warning` goes out. 0 disables it.
    pub timeout_warning_secs: u64,
    pub reconnect_grace_secs: u64,
    /// Capacity used by `create_room` and quick match when none is given.
    pub default_capacity: u8,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            min_players: 3,
            max_rounds: 5,
            choosing_secs: 60,
            voting_secs: 30,
            results_secs: 8,
            timeout_warning_secs: 10,
            reconnect_grace_secs: 30,
            default_capacity: 6,
        }
    }
}

impl GameConfig {
    pub fn choosing(&self) -> Duration {
        Duration::from_secs(self.choosing_secs)
    }

    pub fn voting(&self) -> Duration {
        Duration::from_secs(self.voting_secs)
    }

    pub fn results(&self) -> Duration {
        Duration::from_secs(self.results_secs)
    }

    pub fn timeout_warning(&self) -> Duration {
        Duration::from_secs(self.timeout_warning_secs)
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_secs(self.reconnect_grace_secs)
    }
}

/// Infrastructure limits (connection caps, buffer sizes, rate limits).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_ws_connections: usize,
    /// Outbound frames buffered per connection before it is dropped as slow.
    pub player_message_buffer: usize,
    /// Inbound commands buffered per room session.
    pub session_queue: usize,
    pub ws_rate_limit_per_sec: f64,
    pub max_message_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_ws_connections: 200,
            player_message_buffer: 256,
            session_queue: 256,
            ws_rate_limit_per_sec: 20.0,
            max_message_size: memeroom_core::net::protocol::MAX_MESSAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    pub ping_interval_secs: u64,
    pub missed_pings_allowed: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
            missed_pings_allowed: 2,
        }
    }
}

impl KeepaliveConfig {
    /// Silence longer than this counts as a lost transport.
    pub fn idle_limit(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs * u64::from(self.missed_pings_allowed))
    }
}

/// Room lifecycle configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoomsConfig {
    pub reap_interval_secs: u64,
    /// Waiting rooms untouched this long are closed.
    pub idle_timeout_secs: u64,
    /// How long a finished room stays readable before it is dropped.
    pub finished_linger_secs: u64,
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            reap_interval_secs: 60,
            idle_timeout_secs: 3600,
            finished_linger_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PromptsConfig {
    /// Replaces the built-in prompts when non-empty.
    pub pool: Vec<String>,
}

/// Where [`ServerConfig::load`] got its values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(String),
    /// No file; defaults plus env overrides.
    Missing(String),
    /// File present but unparseable; defaults plus env overrides.
    Invalid { path: String, error: String },
}

impl ConfigSource {
    pub fn log(&self) {
        match self {
            Self::File(path) => tracing::info!(path = %path, "Loaded configuration"),
            Self::Missing(path) => {
                tracing::info!(path = %path, "No config file found, using defaults");
            },
            Self::Invalid { path, error } => {
                tracing::warn!(path = %path, "Failed to parse config: {error}, using defaults");
            },
        }
    }
}

impl ServerConfig {
    /// Check the config, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            problems.push(format!(
                "listen_addr {:?} is not a valid socket address",
                self.listen_addr
            ));
        }
        if !matches!(self.log_format.as_str(), "text" | "json") {
            problems.push(format!(
                "log_format must be \"text\" or \"json\", got {:?}",
                self.log_format
            ));
        }

        let game = &self.game;
        if game.min_players < 2 || game.min_players > MAX_CAPACITY as usize {
            problems.push(format!(
                "game.min_players must be in 2..={MAX_CAPACITY}"
            ));
        }
        if game.max_rounds == 0 {
            problems.push("game.max_rounds must be > 0".to_string());
        }
        if game.choosing_secs == 0 {
            problems.push("game.choosing_secs must be > 0".to_string());
        }
        if game.voting_secs == 0 {
            problems.push("game.voting_secs must be > 0".to_string());
        }
        if game.results_secs == 0 {
            problems.push("game.results_secs must be > 0".to_string());
        }
        if game.timeout_warning_secs >= game.choosing_secs.min(game.voting_secs) {
            problems.push(
                "game.timeout_warning_secs must be shorter than both phase durations".to_string(),
            );
        }
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&game.default_capacity) {
            problems.push(format!(
                "game.default_capacity must be in {MIN_CAPACITY}..={MAX_CAPACITY}"
            ));
        }

        let limits = &self.limits;
        if limits.max_ws_connections == 0 {
            problems.push("limits.max_ws_connections must be > 0".to_string());
        }
        if limits.player_message_buffer == 0 {
            problems.push("limits.player_message_buffer must be > 0".to_string());
        }
        if limits.session_queue == 0 {
            problems.push("limits.session_queue must be > 0".to_string());
        }
        if limits.ws_rate_limit_per_sec <= 0.0 {
            problems.push("limits.ws_rate_limit_per_sec must be > 0".to_string());
        }
        if limits.max_message_size == 0
            || limits.max_message_size > memeroom_core::net::protocol::MAX_MESSAGE_SIZE
        {
            problems.push(format!(
                "limits.max_message_size must be in 1..={}",
                memeroom_core::net::protocol::MAX_MESSAGE_SIZE
            ));
        }

        if self.keepalive.ping_interval_secs == 0 || self.keepalive.missed_pings_allowed == 0 {
            problems.push(
                "keepalive.ping_interval_secs and keepalive.missed_pings_allowed must be > 0"
                    .to_string(),
            );
        }

        if self.rooms.reap_interval_secs == 0 {
            problems.push("rooms.reap_interval_secs must be > 0".to_string());
        }
        if self.rooms.idle_timeout_secs == 0 {
            problems.push("rooms.idle_timeout_secs must be > 0".to_string());
        }

        if self.prompts.pool.iter().any(|p| p.trim().is_empty()) {
            problems.push("prompts.pool must not contain blank prompts".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    /// Load config from `memeroom.toml` (or the file named by
    /// `MEMEROOM_CONFIG`) if it exists, then apply env var overrides.
    ///
    /// Runs before logging is set up, so where the config came from is
    /// returned for the caller to log.
    pub fn load() -> (Self, ConfigSource) {
        let path = std::env::var("MEMEROOM_CONFIG")
            .ok()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| CONFIG_FILE.to_string());
        let (mut config, source) = match std::fs::read_to_string(&path) {
            Ok(content) => match toml::from_str::<ServerConfig>(&content) {
                Ok(cfg) => (cfg, ConfigSource::File(path)),
                Err(e) => (
                    ServerConfig::default(),
                    ConfigSource::Invalid {
                        path,
                        error: e.to_string(),
                    },
                ),
            },
            Err(_) => (ServerConfig::default(), ConfigSource::Missing(path)),
        };
        config.apply_env_overrides();
        (config, source)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("MEMEROOM_LISTEN_ADDR")
            && !addr.is_empty()
        {
            self.listen_addr = addr;
        }
        if let Ok(format) = std::env::var("MEMEROOM_LOG_FORMAT")
            && !format.is_empty()
        {
            self.log_format = format;
        }
        if let Ok(val) = std::env::var("MEMEROOM_MAX_ROUNDS")
            && let Ok(n) = val.parse::<u32>()
        {
            self.game.max_rounds = n;
        }
        if let Ok(val) = std::env::var("MEMEROOM_CHOOSING_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            self.game.choosing_secs = n;
        }
        if let Ok(val) = std::env::var("MEMEROOM_VOTING_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            self.game.voting_secs = n;
        }
        if let Ok(val) = std::env::var("MEMEROOM_RECONNECT_GRACE_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            self.game.reconnect_grace_secs = n;
        }
        if let Ok(val) = std::env::var("MEMEROOM_MAX_WS_CONNECTIONS")
            && let Ok(n) = val.parse::<usize>()
        {
            self.limits.max_ws_connections = n;
        }
    }
}
