use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub evolution: EvolutionConfig,
    pub automation: AutomationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token required on `/api/*`. None = local-only, no auth.
    pub api_token: Option<String>,
    /// Shared token the gateway presents on webhook POSTs.
    pub webhook_token: Option<String>,
    /// Token for the `hub.verify_token` GET handshake.
    pub verify_token: Option<String>,
    /// When set, webhook POSTs must carry a valid `x-hub-signature-256`.
    pub app_secret: Option<String>,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            api_token: None,
            webhook_token: None,
            verify_token: None,
            app_secret: None,
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://zaproute.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct EvolutionConfig {
    /// Gateway base URL used when a connection has no URL of its own.
    pub api_url: Option<String>,
    /// Global gateway API key used when a connection has no token of its own.
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_jitter_ms: u64,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_key: None,
            timeout_secs: 20,
            max_retries: 3,
            retry_jitter_ms: 250,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Send replies straight to the WhatsApp gateway.
    #[default]
    Gateway,
    /// Hand replies to the automation engine, which talks to the gateway.
    Automation,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct AutomationConfig {
    pub dispatch_mode: DispatchMode,
    /// Relay target for tenants without their own webhook URL.
    pub global_webhook_url: Option<String>,
    /// Webhook that accepts outbound sends in `automation` dispatch mode.
    pub outbound_webhook_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            dispatch_mode: DispatchMode::Gateway,
            global_webhook_url: None,
            outbound_webhook_url: None,
            timeout_secs: 15,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for the rolling audit log. Defaults to `<config dir>/logs`.
    pub directory: Option<PathBuf>,
}

impl AppConfig {
    /// Load config from an optional file, then overlay `ZAPROUTE__SECTION__KEY`
    /// environment variables.
    pub fn load(custom_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(config_path) = custom_path.or_else(Self::default_path) {
            builder = builder.add_source(File::from(config_path).required(false));
        }

        let s = builder
            .add_source(
                Environment::with_prefix("ZAPROUTE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }

    /// `~/.zaproute`, or None when no home directory can be determined.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".zaproute"))
    }

    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("config.toml"))
    }

    pub fn log_directory(&self) -> Option<PathBuf> {
        self.logging
            .directory
            .clone()
            .or_else(|| Self::config_dir().map(|dir| dir.join("logs")))
    }
}
