use std::env;
use std::time::Duration;

/// Runtime configuration, read from the environment after `.env` loading.
/// Everything except the token has a default.
#[derive(Clone, Debug)]
pub struct Config {
    pub idle_timeout: Duration,
    pub idle_check_interval: Duration,
    pub queue_preview_len: usize,
    pub default_search: String,
    pub membership_fail_open: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            idle_timeout: Duration::from_secs(env_parse("IDLE_TIMEOUT_SECS", 300)),
            idle_check_interval: Duration::from_secs(env_parse("IDLE_CHECK_SECS", 60)),
            queue_preview_len: env_parse("QUEUE_PREVIEW_LEN", 10),
            default_search: env::var("DEFAULT_SEARCH").unwrap_or_else(|_| "ytsearch".to_string()),
            membership_fail_open: env_parse::<u8>("MEMBERSHIP_FAIL_OPEN", 1) != 0,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
