use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

/// Top-level bot configuration, loaded from tether.toml.
#[derive(Deserialize, Default)]
#[serde(default)]
pub struct BotConfig {
    pub bot: BotSection,
    pub database: DatabaseSection,
    pub control: ControlSection,
    pub scheduler: SchedulerSection,
}

#[derive(Deserialize)]
#[serde(default)]
pub struct BotSection {
    /// Prefix used by guilds that have not configured their own.
    pub command_prefix: String,
}

impl Default for BotSection {
    fn default() -> Self {
        Self {
            command_prefix: "+".into(),
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub url: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: "sqlite:tether.db?mode=rwc".into(),
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
pub struct ControlSection {
    /// Address of the HTTP control plane (health, cache invalidation).
    pub address: String,
}

impl Default for ControlSection {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8090".into(),
        }
    }
}

#[derive(Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerSection {
    /// How many times a failed expiry reversal is attempted before giving up.
    pub retry_attempts: u32,
    /// Delay before the first retry; doubled after each failure.
    pub retry_backoff_ms: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl SchedulerSection {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl BotConfig {
    /// Load config from a TOML file. Falls back to defaults if the file doesn't exist.
    /// Environment variables override TOML values.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let mut config = if Path::new(path).exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {path}"))?;
            Self::parse(&contents).with_context(|| format!("failed to parse config file {path}"))?
        } else {
            info!("No config file found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DATABASE_URL") {
            self.database.url = v;
        }
        if let Ok(v) = std::env::var("CONTROL_ADDRESS") {
            self.control.address = v;
        }
        if let Ok(v) = std::env::var("COMMAND_PREFIX")
            && !v.is_empty()
        {
            self.bot.command_prefix = v;
        }
        if let Ok(v) = std::env::var("EXPIRY_RETRY_ATTEMPTS")
            && let Ok(attempts) = v.parse()
        {
            self.scheduler.retry_attempts = attempts;
        }
    }
}
