use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone)]
pub struct LedgerConfig {
    /// TOML file for the ledger core; defaults plus FX_* variables otherwise
    pub config_file: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let mut builder = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("server.workers", 4)?;

        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_file).required(false));
        } else {
            builder = builder.add_source(
                File::with_name(&format!("config/{}", environment)).required(false),
            );
        }

        builder = builder.add_source(Environment::with_prefix("FX_GATEWAY").separator("__"));

        if let Ok(port) = env::var("PORT") {
            builder = builder.set_override("server.port", port)?;
        }

        if let Ok(ledger_config) = env::var("FX_LEDGER_CONFIG") {
            builder = builder.set_override("ledger.config_file", ledger_config)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port cannot be 0".to_string());
        }

        if self.server.workers == 0 {
            return Err("At least one HTTP worker is required".to_string());
        }

        Ok(())
    }

    /// Ledger core configuration: the TOML file if set, then FX_* / WORKERS /
    /// STATE_WRITER overrides
    pub fn ledger_config(&self) -> fx_ledger::Result<fx_ledger::Config> {
        let mut config = match &self.ledger.config_file {
            Some(path) => fx_ledger::Config::from_file(path)?,
            None => fx_ledger::Config::default(),
        };
        config.apply_env()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_zero_port() {
        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                workers: 1,
            },
            ledger: LedgerConfig::default(),
        };
        assert!(config.validate().is_err());
    }
}
