use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::controller::ControllerSettings;
use crate::srs::SrsConfig;

pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    pub max_batch_size: usize,
    pub ai_timeout: Duration,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub srs: SrsConfig,
}

impl Config {
    /// Reads the process environment. Call `dotenvy::dotenv()` first to pick up `.env`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let parsed = |key: &str| -> Result<Option<f64>> { parse_var(key, var(key)) };

        let defaults = SrsConfig::default();
        let srs = SrsConfig {
            ease_floor: parsed("VAULT_EASE_FLOOR")?.unwrap_or(defaults.ease_floor),
            ease_ceiling: parsed("VAULT_EASE_CEILING")?.unwrap_or(defaults.ease_ceiling),
            ease_bonus: parsed("VAULT_EASE_BONUS")?.unwrap_or(defaults.ease_bonus),
            ease_penalty: parsed("VAULT_EASE_PENALTY")?.unwrap_or(defaults.ease_penalty),
            initial_ease: parsed("VAULT_INITIAL_EASE")?.unwrap_or(defaults.initial_ease),
            max_interval_days: parse_var("VAULT_MAX_INTERVAL_DAYS", var("VAULT_MAX_INTERVAL_DAYS"))?
                .unwrap_or(defaults.max_interval_days),
            ..defaults
        };
        srs.validate().context("invalid spaced-repetition settings")?;

        let max_batch_size: usize = parse_var("VAULT_MAX_BATCH_SIZE", var("VAULT_MAX_BATCH_SIZE"))?.unwrap_or(5);
        anyhow::ensure!(max_batch_size >= 1, "VAULT_MAX_BATCH_SIZE must be at least 1");

        let timeout_secs: u64 = parse_var("VAULT_AI_TIMEOUT_SECS", var("VAULT_AI_TIMEOUT_SECS"))?.unwrap_or(8);
        anyhow::ensure!(timeout_secs >= 1, "VAULT_AI_TIMEOUT_SECS must be at least 1");

        Ok(Self {
            bind_addr: var("VAULT_BIND_ADDR").unwrap_or_else(|| "127.0.0.1:3000".to_string()),
            database_url: var("DATABASE_URL").unwrap_or_else(|| "sqlite://vault.db?mode=rwc".to_string()),
            max_batch_size,
            ai_timeout: Duration::from_secs(timeout_secs),
            gemini_api_key: var("GEMINI_API_KEY"),
            gemini_model: var("GEMINI_MODEL").unwrap_or_else(|| "gemini-1.5-flash".to_string()),
            srs,
        })
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            max_batch_size: self.max_batch_size,
            ai_timeout: self.ai_timeout,
            srs: self.srs,
        }
    }
}

fn parse_var<T>(key: &str, value: Option<String>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .map(|v| v.parse::<T>().with_context(|| format!("{} has an invalid value '{}'", key, v)))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:3000");
        assert_eq!(cfg.max_batch_size, 5);
        assert_eq!(cfg.ai_timeout, Duration::from_secs(8));
        assert!(cfg.gemini_api_key.is_none());
        assert_eq!(cfg.srs, SrsConfig::default());
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("VAULT_MAX_BATCH_SIZE", "3"),
            ("VAULT_EASE_CEILING", "3.0"),
            ("VAULT_MAX_INTERVAL_DAYS", "365"),
            ("GEMINI_API_KEY", " secret "),
            ("GEMINI_MODEL", ""),
        ])
        .unwrap();
        assert_eq!(cfg.max_batch_size, 3);
        assert_eq!(cfg.srs.ease_ceiling, 3.0);
        assert_eq!(cfg.srs.max_interval_days, 365);
        assert_eq!(cfg.gemini_api_key.as_deref(), Some("secret"));
        assert_eq!(cfg.gemini_model, "gemini-1.5-flash");
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(config(&[("VAULT_MAX_BATCH_SIZE", "lots")]).is_err());
        assert!(config(&[("VAULT_MAX_BATCH_SIZE", "0")]).is_err());
        assert!(config(&[("VAULT_EASE_FLOOR", "3.0")]).is_err());
        assert!(config(&[("VAULT_MAX_INTERVAL_DAYS", "0")]).is_err());
    }
}
