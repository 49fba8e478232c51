//! boardkeeper/crates/configs/src/lib.rs
//!
//! Layered process settings. Later sources win:
//!
//! 1. built-in defaults (`DATABASE_URL` included, if set)
//! 2. `config/default.toml`
//! 3. `config/{APP_ENV}.toml`, `APP_ENV` defaulting to `production`
//! 4. `BOARDKEEPER__*` environment variables, e.g.
//!    `BOARDKEEPER__MAINTENANCE__BOARD_EXPIRY=30`
//!
//! A `.env` file is read into the environment first.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use domains::MaintenanceConfig;

const ENV_PREFIX: &str = "BOARDKEEPER";
const DEFAULT_APP_ENV: &str = "production";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not load settings: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    #[serde(default)]
    pub media: MediaSettings,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseSettings {
    pub url: SecretString,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

impl DatabaseSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaSettings {
    /// Directory holding the `src` and `thumb` trees
    pub root: PathBuf,
}

impl Default for MediaSettings {
    fn default() -> Self {
        Self { root: PathBuf::from("images") }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    pub level: String,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self { level: "info".into(), json: false }
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout_secs() -> u64 {
    5
}

impl Settings {
    /// Loads settings for the running process from `./config`.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new("config"))
    }

    /// Like [`Settings::load`] with another config directory. Missing
    /// files are skipped.
    pub fn load_from(dir: &Path) -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!(path = %path.display(), "Loaded .env file"),
            Err(e) if e.not_found() => {}
            Err(e) => tracing::warn!(error = %e, "Ignoring unreadable .env file"),
        }

        let mut builder = config::Config::builder();
        if let Ok(url) = std::env::var("DATABASE_URL") {
            builder = builder.set_default("database.url", url)?;
        }
        let app_env = std::env::var("APP_ENV").unwrap_or_else(|_| DEFAULT_APP_ENV.to_string());
        builder = builder
            .add_source(File::from(dir.join("default.toml")).required(false))
            .add_source(File::from(dir.join(format!("{app_env}.toml"))).required(false));
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );
        Self::build(builder)
    }

    /// Resolves and validates an assembled source stack.
    pub fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.expose_secret().trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "database.url",
                reason: "must not be empty".into(),
            });
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "database.max_connections",
                reason: "must be at least 1".into(),
            });
        }
        let m = &self.maintenance;
        if m.thread_expiry_min > m.thread_expiry_max {
            return Err(ConfigError::Invalid {
                key: "maintenance.thread_expiry_min",
                reason: format!(
                    "{} days exceeds thread_expiry_max of {} days",
                    m.thread_expiry_min, m.thread_expiry_max
                ),
            });
        }
        if m.bump_limit == 0 {
            return Err(ConfigError::Invalid {
                key: "maintenance.bump_limit",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}
