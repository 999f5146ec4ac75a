use std::env;
use std::time::Duration;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::kill::Cancellation;

pub const DEFAULT_SOFT_KILL_WAIT: Duration = Duration::from_secs(5);

/// Upper bound on the bytes read from a foreign address space while
/// recovering a single NUL-terminated string.
pub const DEFAULT_READ_LIMIT: usize = 10_000;

/// Settings for capturing and killing process trees.
///
/// The whole subsystem can be switched off with `enabled = false` (or the
/// `TREEKILL_DISABLE` environment variable), in which case captures produce
/// an empty tree backed by the no-op backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub enabled: bool,
    /// How long to wait between the graceful termination request and the
    /// unconditional kill.
    pub soft_kill_wait: Duration,
    /// Maximum bytes read per string when walking another process's address
    /// space (Solaris/AIX argv/envp recovery).
    pub address_space_read_limit: usize,
    /// Cooperative cancellation flag checked by the graceful-wait loop.
    #[serde(skip)]
    pub cancel: Cancellation,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            soft_kill_wait: DEFAULT_SOFT_KILL_WAIT,
            address_space_read_limit: DEFAULT_READ_LIMIT,
            cancel: Cancellation::default(),
        }
    }
}

lazy_static! {
    static ref ENV_CONFIG: Config = Config::from_env();
}

impl Config {
    /// The default configuration with environment-variable overrides applied:
    /// `TREEKILL_DISABLE`, `TREEKILL_SOFT_KILL_WAIT_SECONDS` and
    /// `TREEKILL_READ_LIMIT`.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if env_flag("TREEKILL_DISABLE") {
            config.enabled = false;
        }
        if let Some(seconds) = env_parse::<u64>("TREEKILL_SOFT_KILL_WAIT_SECONDS") {
            config.soft_kill_wait = Duration::from_secs(seconds);
        }
        if let Some(limit) = env_parse::<usize>("TREEKILL_READ_LIMIT") {
            config.address_space_read_limit = limit;
        }
        config
    }

    /// Shared copy of [`Config::from_env`], evaluated once per process.
    pub fn env_default() -> &'static Config {
        &ENV_CONFIG
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|value| {
            let value = value.trim();
            !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false")
        })
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.enabled);
        assert_eq!(config.soft_kill_wait, Duration::from_secs(5));
        assert_eq!(config.address_space_read_limit, 10_000);
        assert!(!config.cancel.is_cancelled());
    }

    #[test]
    fn test_env_flag_values() {
        unsafe { env::set_var("TREEKILL_TEST_FLAG", "1") };
        assert!(env_flag("TREEKILL_TEST_FLAG"));
        unsafe { env::set_var("TREEKILL_TEST_FLAG", "false") };
        assert!(!env_flag("TREEKILL_TEST_FLAG"));
        unsafe { env::set_var("TREEKILL_TEST_FLAG", "0") };
        assert!(!env_flag("TREEKILL_TEST_FLAG"));
        unsafe { env::remove_var("TREEKILL_TEST_FLAG") };
        assert!(!env_flag("TREEKILL_TEST_FLAG"));
    }

    #[test]
    fn test_env_parse() {
        unsafe { env::set_var("TREEKILL_TEST_LIMIT", " 2048 ") };
        assert_eq!(env_parse::<usize>("TREEKILL_TEST_LIMIT"), Some(2048));
        unsafe { env::set_var("TREEKILL_TEST_LIMIT", "not-a-number") };
        assert_eq!(env_parse::<usize>("TREEKILL_TEST_LIMIT"), None);
        unsafe { env::remove_var("TREEKILL_TEST_LIMIT") };
    }
}
