//! Worker configuration.
//!
//! All timeouts and intervals are configurable so deployments can tune
//! for their environment; the defaults suit a single worker against a
//! local control plane.

use std::time::Duration;

use crate::{WorkerError, WorkerErrorKind, WorkerResult};

/// Recognized worker options.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control-plane base URL
    pub server_address: String,
    /// Worker-to-server bearer secret
    pub shared_secret: String,
    /// Hostname reported on build and step records
    pub hostname: String,
    /// Maximum concurrent stage parallelism within a build
    pub executor_threads: usize,
    /// Queue backend selection
    pub queue_driver: String,
    /// Routing labels this worker serves
    pub routes: Vec<String>,
    /// Container backend selection
    pub runtime_driver: String,
    /// External secret store address
    pub secret_store_address: Option<String>,
    /// External secret store token
    pub secret_store_token: Option<String>,
    /// Upper bound per build
    pub build_timeout: Duration,
    /// Queue poll cadence when idle
    pub poll_interval: Duration,
    /// Log filter directive
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_address: String::new(),
            shared_secret: String::new(),
            hostname: default_hostname(),
            executor_threads: 1,
            queue_driver: "memory".to_string(),
            routes: Vec::new(),
            runtime_driver: "docker".to_string(),
            secret_store_address: None,
            secret_store_token: None,
            build_timeout: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_secs(5),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Verifies the configuration is usable before the worker starts.
    pub fn validate(&self) -> WorkerResult<()> {
        if self.server_address.is_empty() {
            return Err(invalid("server address is required"));
        }
        if self.runtime_driver.is_empty() {
            return Err(invalid("runtime driver is required"));
        }
        if self.executor_threads == 0 {
            return Err(invalid("executor threads must be at least 1"));
        }
        if self.build_timeout.is_zero() {
            return Err(invalid("build timeout must be finite and non-zero"));
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> WorkerError {
    WorkerError::from(WorkerErrorKind::InvalidConfiguration {
        reason: reason.to_string(),
    })
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            server_address: "http://localhost:8080".to_string(),
            shared_secret: "s3cr3t".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_missing_server_address_fails() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_threads_fails() {
        let config = Config {
            executor_threads: 0,
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_fails() {
        let config = Config {
            build_timeout: Duration::ZERO,
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.runtime_driver, "docker");
        assert_eq!(config.queue_driver, "memory");
        assert_eq!(config.build_timeout, Duration::from_secs(1800));
    }
}
