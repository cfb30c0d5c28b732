use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub http: HttpConfig,
    pub supervisor: SupervisorConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub url: String,
    pub api_version: u8,
    pub token: String,
    pub intents: u64,
    pub shard_index: u32,
    pub shard_count: u32,
    pub compress: bool,
    pub large_threshold: u32,
    pub handshake_timeout_secs: u64,
    pub max_invalid_session_retries: u32,
    pub send_limit: usize,
    pub send_window_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "wss://gateway.discord.gg".to_string(),
            api_version: 10,
            token: String::new(),
            intents: 0,
            shard_index: 0,
            shard_count: 1,
            compress: true,
            large_threshold: 250,
            handshake_timeout_secs: 30,
            max_invalid_session_retries: 3,
            send_limit: 110,
            send_window_secs: 60,
        }
    }
}

impl GatewayConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Append the protocol query to `base`
    pub fn connect_url(&self, base: &str) -> String {
        let base = base.trim_end_matches('/');
        let separator = if base.contains('?') { '&' } else { '?' };
        let mut url = format!("{base}{separator}v={}&encoding=json", self.api_version);
        if self.compress {
            url.push_str("&compress=zlib-stream");
        }
        url
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub base_url: String,
    pub token: String,
    pub auth_prefix: String,
    pub user_agent: String,
    pub max_attempts: u32,
    pub global_budget: u32,
    pub global_window_ms: u64,
    pub bucket_idle_secs: u64,
    pub timeout_secs: u64,
}

/// `name (repository, version)` when the package declares a repository, `name/version` otherwise
fn default_user_agent() -> String {
    let name = env!("CARGO_PKG_NAME");
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("CARGO_PKG_REPOSITORY").filter(|url| !url.is_empty()) {
        Some(url) => format!("{name} ({url}, {version})"),
        None => format!("{name}/{version}"),
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: "https://discord.com/api/v10".to_string(),
            token: String::new(),
            auth_prefix: "Bot".to_string(),
            user_agent: default_user_agent(),
            max_attempts: 3,
            global_budget: 50,
            global_window_ms: 1000,
            bucket_idle_secs: 300,
            timeout_secs: 30,
        }
    }
}

impl HttpConfig {
    pub fn authorization(&self) -> Option<String> {
        if self.token.is_empty() {
            return None;
        }
        if self.auth_prefix.is_empty() {
            Some(self.token.clone())
        } else {
            Some(format!("{} {}", self.auth_prefix, self.token))
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 10,
            reconnect_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub health_port: u16,
    pub log_level: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            health_port: 3000,
            log_level: "info".to_string(),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let token = env::var("GATEWAY_TOKEN").unwrap_or_default();
        let gateway_defaults = GatewayConfig::default();
        let http_defaults = HttpConfig::default();
        let supervisor_defaults = SupervisorConfig::default();
        let monitoring_defaults = MonitoringConfig::default();

        Ok(Config {
            gateway: GatewayConfig {
                url: env::var("GATEWAY_URL").unwrap_or(gateway_defaults.url),
                token: token.clone(),
                intents: env_or("GATEWAY_INTENTS", gateway_defaults.intents),
                shard_index: env_or("GATEWAY_SHARD_INDEX", gateway_defaults.shard_index),
                shard_count: env_or("GATEWAY_SHARD_COUNT", gateway_defaults.shard_count),
                compress: env_or("GATEWAY_COMPRESS", gateway_defaults.compress),
                ..gateway_defaults
            },
            http: HttpConfig {
                base_url: env::var("HTTP_BASE_URL").unwrap_or(http_defaults.base_url),
                token,
                max_attempts: env_or("HTTP_MAX_ATTEMPTS", http_defaults.max_attempts),
                ..http_defaults
            },
            supervisor: SupervisorConfig {
                max_reconnect_attempts: env_or(
                    "MAX_RECONNECT_ATTEMPTS",
                    supervisor_defaults.max_reconnect_attempts,
                ),
                ..supervisor_defaults
            },
            monitoring: MonitoringConfig {
                health_port: env_or("HEALTH_PORT", monitoring_defaults.health_port),
                log_level: env::var("LOG_LEVEL").unwrap_or(monitoring_defaults.log_level),
            },
        })
    }

    /// Layered load: optional config file, then `GATEWAY__SECTION__KEY` environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        dotenv::dotenv().ok();

        config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("GATEWAY").separator("__"))
            .build()
            .context("failed to assemble configuration")?
            .try_deserialize()
            .context("invalid configuration")
    }
}
