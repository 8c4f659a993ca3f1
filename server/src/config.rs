use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

/// Top-level server configuration, loaded from parley.toml.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub database: DatabaseSection,
    pub auth: AuthSection,
    pub spam: SpamSection,
    pub history: HistorySection,
    pub rooms: RoomSection,
    pub timers: TimerSection,
    pub profile: ProfileSection,
    pub chat: ChatSection,
    pub localization: LocalizationSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Address the WebSocket chat endpoint listens on.
    pub chat_address: String,
    /// Address the token service listens on. Keep this on a private interface.
    pub auth_address: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            chat_address: "0.0.0.0:45695".into(),
            auth_address: "127.0.0.1:45697".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub url: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: "sqlite:parley.db?mode=rwc".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    pub token_lifetime_secs: u64,
    pub request_timeout_secs: u64,
    pub max_request_bytes: usize,
    pub shutdown_grace_secs: u64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            token_lifetime_secs: 300,
            request_timeout_secs: 5,
            max_request_bytes: 4096,
            shutdown_grace_secs: 5,
        }
    }
}

impl AuthSection {
    pub fn token_lifetime(&self) -> Duration {
        Duration::from_secs(self.token_lifetime_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Anti-spam tuning. The thresholds are compared against the decaying score.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpamSection {
    pub warning_threshold: f64,
    pub block_threshold: f64,
    pub decay_per_second: f64,
    pub block_seconds_per_point: i64,
}

impl Default for SpamSection {
    fn default() -> Self {
        Self {
            warning_threshold: 60.0,
            block_threshold: 100.0,
            decay_per_second: 4.0,
            block_seconds_per_point: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    /// Displayable messages kept per tag.
    pub depth_per_tag: usize,
    pub max_age_hours: i64,
    /// Size of the global message log.
    pub message_log_size: usize,
    /// Size of the recent-message buffer used for spam similarity.
    pub spam_buffer_size: usize,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            depth_per_tag: 50,
            max_age_hours: 24,
            message_log_size: 1000,
            spam_buffer_size: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoomSection {
    pub idle_expiry_hours: i64,
}

impl Default for RoomSection {
    fn default() -> Self {
        Self {
            idle_expiry_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimerSection {
    pub save_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub activity_interval_secs: u64,
    /// Connections without a ping for this long are evicted by cleanup.
    pub ping_timeout_secs: i64,
    /// Bounded wait for the registry and persistence locks in timer paths.
    pub lock_wait_ms: u64,
}

impl Default for TimerSection {
    fn default() -> Self {
        Self {
            save_interval_secs: 60,
            cleanup_interval_secs: 10,
            activity_interval_secs: 15,
            ping_timeout_secs: 90,
            lock_wait_ms: 2000,
        }
    }
}

impl TimerSection {
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProfileSection {
    /// Base URL; the user id is appended as the last path segment.
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for ProfileSection {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api/chat/profile".into(),
            timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatSection {
    /// Tags every bound user can see and post to.
    pub global_tags: Vec<String>,
    /// Subset of global tags only staff can post to.
    pub staff_tags: Vec<String>,
    pub max_message_length: usize,
    /// Pending outbound frames kept per connection before the oldest is dropped.
    pub backlog_size: usize,
    pub module_wait_ms: u64,
}

impl Default for ChatSection {
    fn default() -> Self {
        Self {
            global_tags: vec!["any".into(), "offtopic".into(), "admin".into()],
            staff_tags: vec!["admin".into()],
            max_message_length: 2000,
            backlog_size: 30,
            module_wait_ms: 1000,
        }
    }
}

impl ChatSection {
    pub fn module_wait(&self) -> Duration {
        Duration::from_millis(self.module_wait_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LocalizationSection {
    /// Optional TOML file of per-language system strings.
    pub strings_file: Option<String>,
}

impl ServerConfig {
    /// Load config from a TOML file. Falls back to defaults if the file doesn't exist.
    /// Environment variables override TOML values.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let mut config = if Path::new(path).exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {path}"))?;
            toml::from_str(&contents)
                .with_context(|| format!("failed to parse config file {path}"))?
        } else {
            info!("No config file found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CHAT_ADDRESS") {
            self.server.chat_address = v;
        }
        if let Ok(v) = std::env::var("AUTH_ADDRESS") {
            self.server.auth_address = v;
        }
        if let Ok(v) = std::env::var("DATABASE_URL") {
            self.database.url = v;
        }
        if let Ok(v) = std::env::var("PROFILE_URL") {
            self.profile.base_url = v;
        }
        if let Ok(v) = std::env::var("TOKEN_LIFETIME_SECS")
            && let Ok(secs) = v.parse()
        {
            self.auth.token_lifetime_secs = secs;
        }
        if let Ok(v) = std::env::var("BLOCK_SECONDS_PER_POINT")
            && let Ok(secs) = v.parse()
        {
            self.spam.block_seconds_per_point = secs;
        }
        if let Ok(v) = std::env::var("MAX_MESSAGE_LENGTH")
            && let Ok(len) = v.parse()
        {
            self.chat.max_message_length = len;
        }
        if let Ok(v) = std::env::var("GLOBAL_TAGS") {
            self.chat.global_tags = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }
}
