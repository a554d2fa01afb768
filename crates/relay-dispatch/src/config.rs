//! TOML configuration surface
//!
//! One file configures the whole relay: credential material, pool
//! tunables, and supervision timeouts. Every knob has a default so a
//! minimal file only needs the secrets.

use std::path::{Path, PathBuf};
use std::time::Duration;

use common::{Error, Result, Secret};
use relay_pool::PoolConfig;
use serde::Deserialize;
use tracing::info;

use crate::similarity::DEFAULT_SIMILARITY_THRESHOLD;
use crate::supervisor::SupervisorConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Worker access secrets. At least one is required.
    pub secrets: Vec<String>,

    /// Where credential state is persisted.
    #[serde(default = "default_credential_file")]
    pub credential_file: PathBuf,

    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    #[serde(default = "default_watchdog_timeout_secs")]
    pub watchdog_timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    #[serde(default = "default_persist_debounce_ms")]
    pub persist_debounce_ms: u64,
}

fn default_credential_file() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_pool_size() -> usize {
    2
}

fn default_max_failures() -> u32 {
    10
}

fn default_watchdog_timeout_secs() -> u64 {
    20
}

fn default_max_retries() -> u32 {
    3
}

fn default_similarity_threshold() -> f64 {
    DEFAULT_SIMILARITY_THRESHOLD
}

fn default_persist_debounce_ms() -> u64 {
    500
}

impl RelayConfig {
    /// Load and validate a TOML config file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await?;
        let config: RelayConfig = toml::from_str(&raw)?;
        config.validate()?;
        info!(
            path = %path.display(),
            pool_size = config.pool_size,
            secrets = config.secrets.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.secrets.is_empty() {
            return Err(Error::Config("at least one secret is required".into()));
        }
        if self.secrets.iter().any(|s| s.trim().is_empty()) {
            return Err(Error::Config("secrets must not be empty".into()));
        }
        if self.pool_size == 0 {
            return Err(Error::Config("pool_size must be at least 1".into()));
        }
        if self.watchdog_timeout_secs == 0 {
            return Err(Error::Config("watchdog_timeout_secs must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(Error::Config(
                "similarity_threshold must be between 0 and 1".into(),
            ));
        }
        Ok(())
    }

    /// Configured secrets wrapped for redaction.
    pub fn secrets(&self) -> Vec<Secret<String>> {
        self.secrets.iter().cloned().map(Secret::new).collect()
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            pool_size: self.pool_size,
            max_failures: self.max_failures,
            persist_debounce: Duration::from_millis(self.persist_debounce_ms),
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            watchdog_timeout: Duration::from_secs(self.watchdog_timeout_secs),
            max_retries: self.max_retries,
            similarity_threshold: self.similarity_threshold,
            ..SupervisorConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(raw: &str) -> Result<RelayConfig> {
        let config: RelayConfig = toml::from_str(raw).map_err(Error::from)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse(r#"secrets = ["abc"]"#).unwrap();
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.max_failures, 10);
        assert_eq!(config.watchdog_timeout_secs, 20);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.similarity_threshold, DEFAULT_SIMILARITY_THRESHOLD);
        assert_eq!(config.persist_debounce_ms, 500);
    }

    #[test]
    fn full_config_overrides_defaults() {
        let config = parse(
            r#"
            secrets = ["abc", "def"]
            credential_file = "/var/lib/relay/creds.json"
            pool_size = 4
            max_failures = 5
            watchdog_timeout_secs = 45
            max_retries = 1
            similarity_threshold = 0.9
            persist_debounce_ms = 100
            "#,
        )
        .unwrap();
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.secrets.len(), 2);
        assert_eq!(config.supervisor_config().max_retries, 1);
        assert_eq!(
            config.pool_config().persist_debounce,
            Duration::from_millis(100)
        );
    }

    #[test]
    fn empty_secrets_are_rejected() {
        assert!(parse(r#"secrets = []"#).is_err());
        assert!(parse(r#"secrets = ["  "]"#).is_err());
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        assert!(parse(
            r#"
            secrets = ["abc"]
            pool_size = 0
            "#
        )
        .is_err());
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        assert!(parse(
            r#"
            secrets = ["abc"]
            similarity_threshold = 1.5
            "#
        )
        .is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(parse(
            r#"
            secrets = ["abc"]
            no_such_knob = true
            "#
        )
        .is_err());
    }

    #[tokio::test]
    async fn load_reads_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, r#"secrets = ["from-file"]"#).unwrap();

        let config = RelayConfig::load(&path).await.unwrap();
        assert_eq!(config.secrets, vec!["from-file".to_string()]);
    }
}
