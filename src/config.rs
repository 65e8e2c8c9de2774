use crate::error::{NegotiationError, Result};
use crate::model::{DEFAULT_ASSET, DEFAULT_NETWORK};
use crate::negotiation::NegotiationConfig;
use crate::reputation::ReputationSettings;
use crate::settlement::SettlementOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const ENV_PREFIX: &str = "AGENT_DEAL";

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub negotiation: NegotiationConfig,
    pub settlement: SettlementConfig,
    pub reputation: ReputationSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SigningMode {
    Stub,
    Ed25519,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct SettlementConfig {
    pub challenge_ttl_secs: u64,
    pub amount_tolerance: f64,
    pub default_asset: String,
    pub default_network: String,
    pub settlement_timeout_ms: u64,
    pub simulated_latency_ms: u64,
    pub signing: SigningMode,
}

#[derive(Debug, Deserialize, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Pretty,
    Full,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            challenge_ttl_secs: 300,
            amount_tolerance: 0.01,
            default_asset: DEFAULT_ASSET.to_string(),
            default_network: DEFAULT_NETWORK.to_string(),
            settlement_timeout_ms: 5000,
            simulated_latency_ms: 0,
            signing: SigningMode::Stub,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

impl SettlementConfig {
    pub fn to_options(&self) -> SettlementOptions {
        SettlementOptions {
            challenge_ttl: chrono::Duration::seconds(self.challenge_ttl_secs as i64),
            amount_tolerance: self.amount_tolerance,
            simulated_latency: Duration::from_millis(self.simulated_latency_ms),
            timeout: Duration::from_millis(self.settlement_timeout_ms),
        }
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| NegotiationError::Config(format!("Failed to read config file: {}", e)))?;

        let config: AppConfig = toml::from_str(&config_str)?;
        Ok(config)
    }

    /// File values overlaid with `AGENT_DEAL_<SECTION>__<KEY>` environment
    /// variables, then `RUST_LOG` for the log level.
    pub fn load_with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(
                ::config::File::from(path.as_ref())
                    .format(::config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: AppConfig = settings.try_deserialize()?;

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            config.logging.level = log_level;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(NegotiationError::Config("Server port cannot be 0".to_string()));
        }

        self.negotiation.validate()?;
        self.reputation.validate()?;

        let settlement = &self.settlement;
        if settlement.challenge_ttl_secs == 0 {
            return Err(NegotiationError::Config("Challenge TTL must be greater than 0".to_string()));
        }
        if !settlement.amount_tolerance.is_finite() || settlement.amount_tolerance <= 0.0 {
            return Err(NegotiationError::Config("Amount tolerance must be positive".to_string()));
        }
        if settlement.settlement_timeout_ms == 0 {
            return Err(NegotiationError::Config("Settlement timeout must be greater than 0".to_string()));
        }
        if settlement.default_asset.is_empty() || settlement.default_network.is_empty() {
            return Err(NegotiationError::Config("Default asset and network cannot be empty".to_string()));
        }

        Ok(())
    }

    pub fn get_server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let default_config = AppConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| NegotiationError::Config(format!("Failed to serialize default config: {}", e)))?;

    std::fs::write(path, toml_str)
        .map_err(|e| NegotiationError::Config(format!("Failed to write default config file: {}", e)))?;

    Ok(())
}
