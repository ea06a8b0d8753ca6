use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::{AdmissionConfig, RetryPolicy};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Daemon settings, read from `RESERVD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    /// Non-negative by type; a negative value fails to parse.
    pub grace_minutes: u32,
    /// Remote registry address; the in-process registry is used when absent.
    pub registry_addr: Option<String>,
    /// JSON catalog loaded into the in-process registry at startup.
    pub registry_seed: Option<PathBuf>,
    /// Serve the in-process registry to other nodes on this address.
    pub registry_listen: Option<String>,
    pub registry_timeout: Duration,
    /// Zero disables the registry cache.
    pub registry_cache_ttl: Duration,
    pub retry_attempts: u32,
    pub retry_base_ms: u64,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 7433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            grace_minutes: 30,
            registry_addr: None,
            registry_seed: None,
            registry_listen: None,
            registry_timeout: Duration::from_millis(5000),
            registry_cache_ttl: Duration::ZERO,
            retry_attempts: 3,
            retry_base_ms: 10,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let text = |var: &str, default: String| lookup(var).unwrap_or(default);
        Ok(Self {
            port: parse(&lookup, "RESERVD_PORT")?.unwrap_or(d.port),
            bind: text("RESERVD_BIND", d.bind),
            data_dir: lookup("RESERVD_DATA_DIR").map_or(d.data_dir, PathBuf::from),
            max_connections: parse(&lookup, "RESERVD_MAX_CONNECTIONS")?
                .unwrap_or(d.max_connections),
            compact_threshold: parse(&lookup, "RESERVD_COMPACT_THRESHOLD")?
                .unwrap_or(d.compact_threshold),
            grace_minutes: parse(&lookup, "RESERVD_GRACE_MINUTES")?.unwrap_or(d.grace_minutes),
            registry_addr: lookup("RESERVD_REGISTRY_ADDR").filter(|s| !s.is_empty()),
            registry_seed: lookup("RESERVD_REGISTRY_SEED")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            registry_listen: lookup("RESERVD_REGISTRY_LISTEN").filter(|s| !s.is_empty()),
            registry_timeout: parse(&lookup, "RESERVD_REGISTRY_TIMEOUT_MS")?
                .map_or(d.registry_timeout, Duration::from_millis),
            registry_cache_ttl: parse(&lookup, "RESERVD_REGISTRY_CACHE_TTL_MS")?
                .map_or(d.registry_cache_ttl, Duration::from_millis),
            retry_attempts: parse(&lookup, "RESERVD_RETRY_ATTEMPTS")?.unwrap_or(d.retry_attempts),
            retry_base_ms: parse(&lookup, "RESERVD_RETRY_BASE_MS")?.unwrap_or(d.retry_base_ms),
            metrics_port: parse(&lookup, "RESERVD_METRICS_PORT")?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reservations.wal")
    }

    pub fn admission(&self) -> AdmissionConfig {
        AdmissionConfig {
            grace_margin_ms: i64::from(self.grace_minutes) * 60_000,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_attempts,
            base_delay_ms: self.retry_base_ms,
            ..Default::default()
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    let parsed = value.trim().parse::<T>();
    match parsed {
        Ok(v) => Ok(Some(v)),
        Err(e) => Err(ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:7433");
        assert_eq!(config.admission().grace_margin_ms, 30 * 60_000);
        assert_eq!(config.wal_path(), PathBuf::from("./data/reservations.wal"));
    }

    #[test]
    fn overrides_apply() {
        let config = Config::from_lookup(lookup(&[
            ("RESERVD_PORT", "9000"),
            ("RESERVD_GRACE_MINUTES", "0"),
            ("RESERVD_REGISTRY_ADDR", "10.0.0.5:7500"),
            ("RESERVD_REGISTRY_CACHE_TTL_MS", "250"),
            ("RESERVD_RETRY_ATTEMPTS", "5"),
            ("RESERVD_METRICS_PORT", "9100"),
        ]))
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.admission().grace_margin_ms, 0);
        assert_eq!(config.registry_addr.as_deref(), Some("10.0.0.5:7500"));
        assert_eq!(config.registry_cache_ttl, Duration::from_millis(250));
        assert_eq!(config.retry_policy().max_retries, 5);
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn malformed_number_is_an_error() {
        let err = Config::from_lookup(lookup(&[("RESERVD_MAX_CONNECTIONS", "lots")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                var: "RESERVD_MAX_CONNECTIONS",
                ..
            }
        ));
    }

    #[test]
    fn negative_grace_is_an_error() {
        let err = Config::from_lookup(lookup(&[("RESERVD_GRACE_MINUTES", "-15")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                var: "RESERVD_GRACE_MINUTES",
                ..
            }
        ));
    }

    #[test]
    fn empty_registry_addr_means_local() {
        let config = Config::from_lookup(lookup(&[("RESERVD_REGISTRY_ADDR", "")])).unwrap();
        assert!(config.registry_addr.is_none());
    }
}
