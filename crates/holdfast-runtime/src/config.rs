//! Environment-driven configuration.

use std::collections::HashMap;
use std::time::Duration;

use holdfast_counters::{CounterAttributes, CounterConfig};
use holdfast_pause_control::DEFAULT_CONTEXT_ALLOW_LIST;

use crate::error::RuntimeError;

const ENV_KEYS: [&str; 9] = [
    "HOLDFAST_STORE_BACKEND",
    "HOLDFAST_SQLITE_DB",
    "HOLDFAST_COUNTERS_DB",
    "HOLDFAST_FLUSH_DELAY_SECS",
    "HOLDFAST_LEASE_TTL_SECS",
    "HOLDFAST_RESUME_ITERATIONS",
    "HOLDFAST_TICK_SECS",
    "HOLDFAST_CONTEXT_ALLOW_LIST",
    "HOLDFAST_BUFFERED_ATTRIBUTES",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Clone, Debug)]
pub struct HoldfastConfig {
    pub backend: StoreBackend,
    pub sqlite_db_path: String,
    pub counters_db_path: String,
    pub counters: CounterConfig,
    pub resume_iterations: usize,
    pub tick_interval: Duration,
    pub context_allow_list: Vec<String>,
    pub buffered_attributes: CounterAttributes,
}

impl HoldfastConfig {
    pub fn from_env() -> Result<Self, RuntimeError> {
        let mut envs = HashMap::new();
        for key in ENV_KEYS {
            if let Ok(value) = std::env::var(key) {
                envs.insert(key.to_string(), value);
            }
        }
        Self::from_env_map(&envs)
    }

    pub fn from_env_map(envs: &HashMap<String, String>) -> Result<Self, RuntimeError> {
        let value = |key: &str| {
            envs.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let backend = match value("HOLDFAST_STORE_BACKEND")
            .map(|v| v.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("sqlite") => StoreBackend::Sqlite,
            Some("memory") => StoreBackend::Memory,
            Some(other) => {
                return Err(RuntimeError::Config(format!(
                    "invalid HOLDFAST_STORE_BACKEND='{other}'. expected one of: memory, sqlite"
                )));
            }
        };

        let context_allow_list = match value("HOLDFAST_CONTEXT_ALLOW_LIST") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(str::to_string)
                .collect(),
            None => DEFAULT_CONTEXT_ALLOW_LIST
                .iter()
                .map(|key| key.to_string())
                .collect(),
        };

        let buffered_attributes = match value("HOLDFAST_BUFFERED_ATTRIBUTES") {
            Some(raw) => raw.parse().map_err(|e| {
                RuntimeError::Config(format!("invalid HOLDFAST_BUFFERED_ATTRIBUTES='{raw}': {e}"))
            })?,
            None => CounterAttributes::new(),
        };

        Ok(Self {
            backend,
            sqlite_db_path: value("HOLDFAST_SQLITE_DB").unwrap_or_else(|| "holdfast.db".to_string()),
            counters_db_path: value("HOLDFAST_COUNTERS_DB")
                .unwrap_or_else(|| "holdfast_counters.db".to_string()),
            counters: CounterConfig {
                flush_delay: secs(envs, "HOLDFAST_FLUSH_DELAY_SECS", 600)?,
                lease_ttl: secs(envs, "HOLDFAST_LEASE_TTL_SECS", 600)?,
                ..CounterConfig::default()
            },
            resume_iterations: positive(envs, "HOLDFAST_RESUME_ITERATIONS", 1)? as usize,
            tick_interval: secs(envs, "HOLDFAST_TICK_SECS", 60)?,
            context_allow_list,
            buffered_attributes,
        })
    }
}

fn positive(envs: &HashMap<String, String>, key: &str, default: u64) -> Result<u64, RuntimeError> {
    let Some(raw) = envs.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) else {
        return Ok(default);
    };
    match raw.parse::<u64>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(RuntimeError::Config(format!(
            "invalid {key}='{raw}'. expected a positive integer"
        ))),
    }
}

fn secs(envs: &HashMap<String, String>, key: &str, default: u64) -> Result<Duration, RuntimeError> {
    positive(envs, key, default).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parse_defaults() {
        let cfg = HoldfastConfig::from_env_map(&HashMap::new()).expect("parse default config");
        assert_eq!(cfg.backend, StoreBackend::Sqlite);
        assert_eq!(cfg.sqlite_db_path, "holdfast.db");
        assert_eq!(cfg.counters_db_path, "holdfast_counters.db");
        assert_eq!(cfg.counters.flush_delay, Duration::from_secs(600));
        assert_eq!(cfg.counters.lease_ttl, Duration::from_secs(600));
        assert_eq!(cfg.resume_iterations, 1);
        assert_eq!(cfg.tick_interval, Duration::from_secs(60));
        assert_eq!(cfg.context_allow_list, vec!["project_id", "meta.project"]);
        assert!(cfg.buffered_attributes.is_empty());
    }

    #[test]
    fn parse_overrides() {
        let cfg = HoldfastConfig::from_env_map(&envs(&[
            ("HOLDFAST_STORE_BACKEND", " Memory "),
            ("HOLDFAST_RESUME_ITERATIONS", "5"),
            ("HOLDFAST_TICK_SECS", "10"),
            ("HOLDFAST_CONTEXT_ALLOW_LIST", "project_id, tenant"),
            ("HOLDFAST_BUFFERED_ATTRIBUTES", "ProjectStatistics.storage_size"),
        ]))
        .expect("parse");
        assert_eq!(cfg.backend, StoreBackend::Memory);
        assert_eq!(cfg.resume_iterations, 5);
        assert_eq!(cfg.tick_interval, Duration::from_secs(10));
        assert_eq!(cfg.context_allow_list, vec!["project_id", "tenant"]);
        assert_eq!(
            cfg.buffered_attributes.buffered_attributes("ProjectStatistics"),
            vec!["storage_size"]
        );
    }

    #[test]
    fn invalid_values_name_the_key() {
        let err = HoldfastConfig::from_env_map(&envs(&[("HOLDFAST_STORE_BACKEND", "redis")]))
            .expect_err("backend");
        assert!(err.to_string().contains("HOLDFAST_STORE_BACKEND"));

        let err = HoldfastConfig::from_env_map(&envs(&[("HOLDFAST_TICK_SECS", "0")]))
            .expect_err("tick");
        assert!(err.to_string().contains("HOLDFAST_TICK_SECS"));

        let err = HoldfastConfig::from_env_map(&envs(&[("HOLDFAST_BUFFERED_ATTRIBUTES", "nodot")]))
            .expect_err("attributes");
        assert!(err.to_string().contains("HOLDFAST_BUFFERED_ATTRIBUTES"));
    }
}
