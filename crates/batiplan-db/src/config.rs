//! Application configuration.
//!
//! Configuration is loaded from environment variables with fallback to defaults.

use batiplan_core::TaxRate;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

use crate::pool::DbConfig;

const DEFAULT_DATABASE_PATH: &str = "./batiplan.db";
const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_CURRENCY_CODE: &str = "XOF";

/// Batiplan configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// SQLite database file
    pub database_path: PathBuf,

    /// Pool size (default: 5)
    pub max_connections: u32,

    /// VAT applied to new DQEs that don't carry their own rate
    pub default_vat_rate: TaxRate,

    /// ISO 4217 code of the whole-unit currency amounts are kept in
    pub currency_code: String,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_path = lookup("BATIPLAN_DATABASE_PATH")
            .unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_string())
            .into();

        let max_connections = match lookup("BATIPLAN_MAX_CONNECTIONS") {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ConfigError::InvalidValue("BATIPLAN_MAX_CONNECTIONS".to_string()))?,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        let default_vat_rate = match lookup("BATIPLAN_DEFAULT_VAT_RATE") {
            Some(raw) => raw
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|pct| (0.0..=100.0).contains(pct))
                .map(TaxRate::from_percentage)
                .ok_or_else(|| ConfigError::InvalidValue("BATIPLAN_DEFAULT_VAT_RATE".to_string()))?,
            None => TaxRate::default(),
        };

        let currency_code = match lookup("BATIPLAN_CURRENCY_CODE") {
            Some(raw) => {
                let code = raw.trim().to_string();
                if code.len() != 3 || !code.chars().all(|c| c.is_ascii_uppercase()) {
                    return Err(ConfigError::InvalidValue("BATIPLAN_CURRENCY_CODE".to_string()));
                }
                code
            }
            None => DEFAULT_CURRENCY_CODE.to_string(),
        };

        Ok(AppConfig {
            database_path,
            max_connections,
            default_vat_rate,
            currency_code,
        })
    }

    /// Pool configuration for this application.
    pub fn db_config(&self) -> DbConfig {
        DbConfig::new(self.database_path.clone()).max_connections(self.max_connections)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.database_path, PathBuf::from("./batiplan.db"));
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.default_vat_rate.bps(), 1_800);
        assert_eq!(config.currency_code, "XOF");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("BATIPLAN_DATABASE_PATH", "/data/chantiers.db"),
            ("BATIPLAN_MAX_CONNECTIONS", "8"),
            ("BATIPLAN_DEFAULT_VAT_RATE", "19.25"),
            ("BATIPLAN_CURRENCY_CODE", "XAF"),
        ])
        .unwrap();
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.default_vat_rate.bps(), 1_925);
        assert_eq!(config.currency_code, "XAF");
        assert_eq!(config.db_config().max_connections, 8);
    }

    #[test]
    fn test_invalid_values() {
        for (key, value) in [
            ("BATIPLAN_MAX_CONNECTIONS", "zero"),
            ("BATIPLAN_MAX_CONNECTIONS", "0"),
            ("BATIPLAN_DEFAULT_VAT_RATE", "120"),
            ("BATIPLAN_DEFAULT_VAT_RATE", "-1"),
            ("BATIPLAN_CURRENCY_CODE", "xof"),
            ("BATIPLAN_CURRENCY_CODE", "EURO"),
        ] {
            match load(&[(key, value)]) {
                Err(ConfigError::InvalidValue(name)) => assert_eq!(name, key),
                other => panic!("{}={} should fail, got {:?}", key, value, other),
            }
        }
    }
}
