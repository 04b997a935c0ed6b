use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: u32,
}

/// Timing knobs for session lifecycles, all in milliseconds.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProxyConfig {
    pub ping_interval_ms: u64,
    pub idle_timeout_ms: u64,
    pub reap_interval_ms: u64,
    pub close_timeout_ms: u64,
    /// Largest accepted send/close body.
    pub max_body_bytes: usize,
}

impl ProxyConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Every interval and timeout must be non-zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let knobs = [
            ("proxy.ping_interval_ms", self.ping_interval_ms),
            ("proxy.idle_timeout_ms", self.idle_timeout_ms),
            ("proxy.reap_interval_ms", self.reap_interval_ms),
            ("proxy.close_timeout_ms", self.close_timeout_ms),
        ];
        match knobs.iter().find(|(_, value)| *value == 0) {
            Some((key, _)) => Err(ConfigError::Message(format!("{} must be greater than zero", key))),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AllowlistMode {
    /// Only the entries in `hosts`.
    List,
    /// Any loopback address on any port.
    Loopback,
    /// Every host. Unsafe; logged on startup and on each use.
    Any,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AllowlistConfig {
    pub mode: AllowlistMode,
    #[serde(default)]
    pub hosts: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct HealthConfig {
    pub secret: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CorsConfig {
    pub enabled: bool,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    pub max_age: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub environment: String,
    pub server: ServerConfig,
    pub proxy: ProxyConfig,
    pub allowlist: AllowlistConfig,
    #[serde(default)]
    pub health: HealthConfig,
    pub cors: CorsConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            environment: "development".into(),
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 8080,
                workers: num_cpus::get() as u32,
            },
            proxy: ProxyConfig {
                ping_interval_ms: 30_000,
                idle_timeout_ms: 300_000,
                reap_interval_ms: 60_000,
                close_timeout_ms: 5_000,
                max_body_bytes: 16 * 1024 * 1024,
            },
            allowlist: AllowlistConfig {
                mode: AllowlistMode::Loopback,
                hosts: Vec::new(),
            },
            health: HealthConfig::default(),
            cors: CorsConfig {
                enabled: false,
                allowed_origins: Vec::new(),
                max_age: 3600,
            },
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        Config::builder()
            // Start with default values
            .add_source(Config::try_from(&Settings::default())?)
            // Add in settings from the config file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // E.g., `APP_PROXY__IDLE_TIMEOUT_MS=60000` would set `Settings.proxy.idle_timeout_ms`
            .add_source(env_source())
            .build()?
            .try_deserialize::<Settings>()
            .and_then(Settings::validated)
    }

    /// Defaults plus environment overrides, without touching config files.
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(env_source())
            .build()?
            .try_deserialize::<Settings>()
            .and_then(Settings::validated)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.proxy.validate()
    }

    fn validated(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix("app")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("allowlist.hosts")
        .with_list_parse_key("cors.allowed_origins")
}
