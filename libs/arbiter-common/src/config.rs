// Service configuration, read from ARBITER_* environment variables

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid value {value:?} for {key}: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: String,
    pub languages_path: PathBuf,
    pub submissions_root: PathBuf,
    /// Where `submissions_root` lives on the Docker host, when the service
    /// itself runs inside a container with the Docker socket mounted.
    pub host_submissions_root: Option<PathBuf>,
    pub max_concurrency: usize,
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    pub sandbox_user: String,
    pub submission_ttl: Duration,
    pub log_json: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            languages_path: PathBuf::from("config/languages.json"),
            submissions_root: PathBuf::from("/tmp/arbiter/submissions"),
            host_submissions_root: None,
            max_concurrency: 4,
            default_timeout: Duration::from_millis(5000),
            max_timeout: Duration::from_millis(30_000),
            sandbox_user: "65534:65534".to_string(),
            submission_ttl: Duration::from_secs(3600),
            log_json: false,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Unset keys keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("ARBITER_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(path) = lookup("ARBITER_LANGUAGES_PATH") {
            config.languages_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("ARBITER_SUBMISSIONS_ROOT") {
            config.submissions_root = PathBuf::from(path);
        }
        config.host_submissions_root = lookup("ARBITER_HOST_SUBMISSIONS_ROOT")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        if let Some(user) = lookup("ARBITER_SANDBOX_USER") {
            config.sandbox_user = user;
        }

        if let Some(n) = parse::<usize>(&lookup, "ARBITER_MAX_CONCURRENCY")? {
            if n == 0 {
                return Err(ConfigError {
                    key: "ARBITER_MAX_CONCURRENCY",
                    value: n.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            config.max_concurrency = n;
        }
        if let Some(ms) = parse::<u64>(&lookup, "ARBITER_DEFAULT_TIMEOUT_MS")? {
            config.default_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "ARBITER_MAX_TIMEOUT_MS")? {
            config.max_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>(&lookup, "ARBITER_SUBMISSION_TTL_SECS")? {
            config.submission_ttl = Duration::from_secs(secs);
        }
        if let Some(json) = parse::<bool>(&lookup, "ARBITER_LOG_JSON")? {
            config.log_json = json;
        }

        if config.default_timeout.is_zero() || config.default_timeout > config.max_timeout {
            return Err(ConfigError {
                key: "ARBITER_DEFAULT_TIMEOUT_MS",
                value: config.default_timeout.as_millis().to_string(),
                reason: format!(
                    "must be between 1 and ARBITER_MAX_TIMEOUT_MS ({})",
                    config.max_timeout.as_millis()
                ),
            });
        }

        Ok(config)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| ConfigError {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = ServiceConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.default_timeout, Duration::from_secs(5));
        assert_eq!(config.sandbox_user, "65534:65534");
        assert!(config.host_submissions_root.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = ServiceConfig::from_lookup(lookup_from(&[
            ("ARBITER_MAX_CONCURRENCY", "16"),
            ("ARBITER_DEFAULT_TIMEOUT_MS", "2000"),
            ("ARBITER_HOST_SUBMISSIONS_ROOT", "/srv/arbiter"),
            ("ARBITER_LOG_JSON", "true"),
        ]))
        .unwrap();
        assert_eq!(config.max_concurrency, 16);
        assert_eq!(config.default_timeout, Duration::from_millis(2000));
        assert_eq!(config.host_submissions_root, Some(PathBuf::from("/srv/arbiter")));
        assert!(config.log_json);
    }

    #[test]
    fn test_rejects_garbage_numbers() {
        let err = ServiceConfig::from_lookup(lookup_from(&[("ARBITER_MAX_CONCURRENCY", "lots")]))
            .unwrap_err();
        assert_eq!(err.key, "ARBITER_MAX_CONCURRENCY");
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        assert!(ServiceConfig::from_lookup(lookup_from(&[("ARBITER_MAX_CONCURRENCY", "0")])).is_err());
    }

    #[test]
    fn test_default_timeout_bounded_by_max() {
        let err = ServiceConfig::from_lookup(lookup_from(&[
            ("ARBITER_DEFAULT_TIMEOUT_MS", "60000"),
            ("ARBITER_MAX_TIMEOUT_MS", "30000"),
        ]))
        .unwrap_err();
        assert_eq!(err.key, "ARBITER_DEFAULT_TIMEOUT_MS");
    }
}
