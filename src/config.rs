//! Configuration types.
//!
//! Every section has a `Default` and a `from_env()` constructor. Channel
//! and model settings live next to their clients (`EmailConfig`,
//! `TelegramConfig`, `LlmConfig`).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::llm::DEFAULT_LLM_TIMEOUT;
use crate::workflow::command::DEFAULT_HISTORY_CAP;

/// Workflow execution settings.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Upper bound on one model call.
    pub llm_timeout: Duration,
    /// Command history kept for undo.
    pub history_cap: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            llm_timeout: DEFAULT_LLM_TIMEOUT,
            history_cap: DEFAULT_HISTORY_CAP,
        }
    }
}

impl RunnerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            llm_timeout: env_parse("RELAYFLOW_LLM_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.llm_timeout),
            history_cap: env_parse("RELAYFLOW_HISTORY_CAP")?.unwrap_or(defaults.history_cap),
        })
    }
}

/// Background supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Heartbeat tick of the supervisor loop.
    pub heartbeat_interval: Duration,
    /// Re-acquire the wake lock every this many heartbeat ticks.
    pub wake_lock_renew_ticks: u32,
    /// How long one wake lock acquisition lasts.
    pub wake_lock_lease: Duration,
    /// Watchdog liveness check period.
    pub watchdog_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            wake_lock_renew_ticks: 10,
            wake_lock_lease: Duration::from_secs(600), // 10 minutes
            watchdog_interval: Duration::from_secs(60),
        }
    }
}

impl SupervisorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let wake_lock_renew_ticks: u32 =
            env_parse("RELAYFLOW_WAKE_LOCK_RENEW_TICKS")?.unwrap_or(defaults.wake_lock_renew_ticks);
        if wake_lock_renew_ticks == 0 {
            return Err(ConfigError::invalid(
                "RELAYFLOW_WAKE_LOCK_RENEW_TICKS",
                "must be at least 1",
            ));
        }
        let watchdog_secs: Option<u64> = env_parse("RELAYFLOW_WATCHDOG_SECS")?;
        if watchdog_secs == Some(0) {
            return Err(ConfigError::invalid("RELAYFLOW_WATCHDOG_SECS", "must be at least 1"));
        }

        let heartbeat_interval = defaults.heartbeat_interval;
        Ok(Self {
            heartbeat_interval,
            wake_lock_renew_ticks,
            // The lease outlives a full renewal cycle.
            wake_lock_lease: heartbeat_interval * (wake_lock_renew_ticks + 1),
            watchdog_interval: watchdog_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.watchdog_interval),
        })
    }
}

/// HTTP control API settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: IpAddr,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8787,
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            host: env_parse("RELAYFLOW_API_HOST")?.unwrap_or(defaults.host),
            port: env_parse("RELAYFLOW_API_PORT")?.unwrap_or(defaults.port),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Persistence settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("relayflow.db"),
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            db_path: std::env::var("RELAYFLOW_DB_PATH")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| Self::default().db_path),
        })
    }
}

/// Read and parse an optional variable. Unset or blank is `None`.
fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::invalid(key, e.to_string())),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let runner = RunnerConfig::default();
        assert_eq!(runner.llm_timeout, Duration::from_secs(60));
        assert_eq!(runner.history_cap, 100);

        let supervisor = SupervisorConfig::default();
        assert_eq!(supervisor.watchdog_interval, Duration::from_secs(60));
        assert!(
            supervisor.wake_lock_lease
                > supervisor.heartbeat_interval * supervisor.wake_lock_renew_ticks
        );

        assert_eq!(ApiConfig::default().addr().to_string(), "127.0.0.1:8787");
    }

    #[test]
    fn env_parse_reports_the_key() {
        // Unique key so parallel tests never race on it.
        let key = "RELAYFLOW_TEST_ENV_PARSE_BAD";
        unsafe { std::env::set_var(key, "not-a-number") };
        let err = env_parse::<u16>(key).unwrap_err();
        unsafe { std::env::remove_var(key) };
        assert!(err.to_string().contains(key));
    }

    #[test]
    fn env_parse_treats_blank_as_unset() {
        let key = "RELAYFLOW_TEST_ENV_PARSE_BLANK";
        unsafe { std::env::set_var(key, "  ") };
        assert_eq!(env_parse::<u64>(key).unwrap(), None);
        unsafe { std::env::remove_var(key) };
        assert_eq!(env_parse::<u64>(key).unwrap(), None);
    }
}
