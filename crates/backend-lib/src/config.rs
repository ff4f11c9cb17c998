// ============================
// chathub-backend-lib/src/config.rs
// ============================
//! Configuration management.
use anyhow::{bail, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix, nested keys use `__` (e.g. `CHATHUB_HUB__PING_INTERVAL_MS`)
pub const ENV_PREFIX: &str = "CHATHUB_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Data directory path for the flat-file stores
    pub data_dir: PathBuf,
    /// Log level used when `RUST_LOG` is not set
    pub log_level: String,
    /// Emit JSON formatted logs
    pub json_logs: bool,
    /// Authentication settings
    pub auth: AuthSettings,
    /// Cross-origin access for browser clients
    pub cors: CorsSettings,
    /// Connection hub tuning
    pub hub: HubSettings,
}

/// Authentication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// HMAC secret used to verify bearer tokens
    pub jwt_secret: String,
}

/// CORS settings. Credentials are always allowed, so origins must be listed
/// explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsSettings {
    /// Exact origins, e.g. `http://localhost:5173`
    pub allowed_origins: Vec<String>,
}

/// Connection hub and pump tuning. All durations are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    /// Capacity of each connection's outbound queue; a full queue evicts the connection
    pub outbound_queue_capacity: usize,
    /// Capacity of the registry command queue
    pub command_queue_capacity: usize,
    /// How long an inbound loop waits for the registry to accept a route command
    pub route_submit_timeout_ms: u64,
    /// Interval between liveness pings
    pub ping_interval_ms: u64,
    /// Deadline for writing a message frame
    pub write_timeout_ms: u64,
    /// Deadline for writing a ping frame
    pub ping_write_timeout_ms: u64,
    /// Connection is dropped when nothing is read for this long
    pub read_timeout_ms: u64,
    /// Largest inbound frame accepted, in bytes
    pub max_frame_size: usize,
    /// Deadline for message store calls on the real-time path
    pub store_timeout_ms: u64,
    /// Deadline for presence store updates
    pub presence_timeout_ms: u64,
    /// How long shutdown waits for open connections to finish closing
    pub shutdown_grace_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            data_dir: PathBuf::from("data"),
            log_level: "info".to_string(),
            json_logs: false,
            auth: AuthSettings::default(),
            cors: CorsSettings::default(),
            hub: HubSettings::default(),
        }
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: "change-me".to_string(),
        }
    }
}

impl Default for CorsSettings {
    fn default() -> Self {
        Self {
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:5173".to_string(),
            ],
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 1024,
            command_queue_capacity: 1000,
            route_submit_timeout_ms: 5_000,
            ping_interval_ms: 30_000,
            write_timeout_ms: 15_000,
            ping_write_timeout_ms: 10_000,
            read_timeout_ms: 60_000,
            max_frame_size: 512 * 1024,
            store_timeout_ms: 5_000,
            presence_timeout_ms: 5_000,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl HubSettings {
    pub fn route_submit_timeout(&self) -> Duration {
        Duration::from_millis(self.route_submit_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn ping_write_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_write_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn presence_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.outbound_queue_capacity == 0 {
            bail!("hub.outbound_queue_capacity must be greater than zero");
        }
        if self.command_queue_capacity == 0 {
            bail!("hub.command_queue_capacity must be greater than zero");
        }
        if self.max_frame_size == 0 {
            bail!("hub.max_frame_size must be greater than zero");
        }
        let timeouts = [
            ("route_submit_timeout_ms", self.route_submit_timeout_ms),
            ("ping_interval_ms", self.ping_interval_ms),
            ("write_timeout_ms", self.write_timeout_ms),
            ("ping_write_timeout_ms", self.ping_write_timeout_ms),
            ("read_timeout_ms", self.read_timeout_ms),
            ("store_timeout_ms", self.store_timeout_ms),
            ("presence_timeout_ms", self.presence_timeout_ms),
            ("shutdown_grace_ms", self.shutdown_grace_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                bail!("hub.{name} must be greater than zero");
            }
        }
        if self.read_timeout_ms <= self.ping_interval_ms {
            bail!("hub.read_timeout_ms must be longer than hub.ping_interval_ms");
        }
        Ok(())
    }
}

impl Settings {
    /// Load settings from `config/default.toml` and the environment
    pub fn load() -> Result<Self> {
        Self::load_from("config/default.toml")
    }

    /// Load settings from a specific TOML file, then the environment
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Check the settings for values the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            bail!("invalid log level `{}`", self.log_level);
        }
        if self.auth.jwt_secret.is_empty() {
            bail!("auth.jwt_secret must not be empty");
        }
        for origin in &self.cors.allowed_origins {
            if origin.trim().is_empty() || origin.trim() == "*" {
                bail!("cors.allowed_origins must list exact origins, got `{origin}`");
            }
        }
        self.hub.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.hub.outbound_queue_capacity, 1024);
        assert_eq!(settings.hub.ping_interval(), Duration::from_secs(30));
        assert_eq!(settings.hub.max_frame_size, 512 * 1024);
    }

    #[test]
    fn test_settings_validation() {
        let settings = Settings::default();

        let mut invalid = settings.clone();
        invalid.log_level = "loud".to_string();
        assert!(invalid.validate().is_err());

        let mut invalid = settings.clone();
        invalid.auth.jwt_secret.clear();
        assert!(invalid.validate().is_err());

        let mut invalid = settings.clone();
        invalid.hub.outbound_queue_capacity = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = settings.clone();
        invalid.hub.write_timeout_ms = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = settings.clone();
        invalid.cors.allowed_origins = vec!["*".to_string()];
        assert!(invalid.validate().is_err());

        let mut invalid = settings;
        invalid.hub.read_timeout_ms = invalid.hub.ping_interval_ms;
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_load_settings() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "chathub.toml",
                r#"
                bind_addr = "127.0.0.1:4000"
                data_dir = "test_data"
                log_level = "debug"

                [cors]
                allowed_origins = ["https://chat.example.com"]

                [hub]
                outbound_queue_capacity = 8
                "#,
            )?;
            jail.set_env("CHATHUB_LOG_LEVEL", "warn");
            jail.set_env("CHATHUB_AUTH__JWT_SECRET", "from-env");

            let settings = Settings::load_from("chathub.toml").map_err(|e| e.to_string())?;
            assert_eq!(settings.bind_addr.to_string(), "127.0.0.1:4000");
            assert_eq!(settings.data_dir, PathBuf::from("test_data"));
            // Environment variable takes precedence
            assert_eq!(settings.log_level, "warn");
            assert_eq!(settings.auth.jwt_secret, "from-env");
            assert_eq!(settings.hub.outbound_queue_capacity, 8);
            assert_eq!(settings.cors.allowed_origins, vec!["https://chat.example.com"]);
            // untouched keys keep their defaults
            assert_eq!(settings.hub.command_queue_capacity, 1000);
            Ok(())
        });
    }
}
