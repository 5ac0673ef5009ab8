use std::time::Duration;

use crate::tracker::MAX_DNS_RECORDS;

pub const DIAL_TIMEOUT_ENV: &str = "USERNET_FILTER_DIAL_TIMEOUT_MS";
pub const UDP_IDLE_TIMEOUT_ENV: &str = "USERNET_FILTER_UDP_IDLE_TIMEOUT_MS";
pub const CLEANUP_INTERVAL_ENV: &str = "USERNET_FILTER_CLEANUP_INTERVAL_SECS";
pub const MAX_DNS_RECORDS_ENV: &str = "USERNET_FILTER_MAX_DNS_RECORDS";

pub const DEFAULT_UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Runtime knobs of the filter that are not part of the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterConfig {
    /// Upper bound on the outbound TCP dial. `None` leaves it to the OS.
    pub dial_timeout: Option<Duration>,
    /// Forwarded UDP flows are closed after this long without traffic.
    pub udp_idle_timeout: Option<Duration>,
    /// How often expired DNS records are purged.
    pub cleanup_interval: Duration,
    pub max_dns_records: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            dial_timeout: None,
            udp_idle_timeout: Some(DEFAULT_UDP_IDLE_TIMEOUT),
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            max_dns_records: MAX_DNS_RECORDS,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),
}

impl FilterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`FilterConfig::from_env`] but reads variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let dial_timeout = match parse_u64(&lookup, DIAL_TIMEOUT_ENV)? {
            None | Some(0) => defaults.dial_timeout,
            Some(ms) => Some(Duration::from_millis(ms)),
        };
        let udp_idle_timeout = match parse_u64(&lookup, UDP_IDLE_TIMEOUT_ENV)? {
            None => defaults.udp_idle_timeout,
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
        };
        let cleanup_interval = match parse_u64(&lookup, CLEANUP_INTERVAL_ENV)? {
            None => defaults.cleanup_interval,
            Some(0) => return Err(ConfigError::InvalidEnv(CLEANUP_INTERVAL_ENV)),
            Some(secs) => Duration::from_secs(secs),
        };
        let max_dns_records = match parse_u64(&lookup, MAX_DNS_RECORDS_ENV)? {
            None => defaults.max_dns_records,
            Some(n) => usize::try_from(n)
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::InvalidEnv(MAX_DNS_RECORDS_ENV))?,
        };

        Ok(Self {
            dial_timeout,
            udp_idle_timeout,
            cleanup_interval,
            max_dns_records,
        })
    }
}

fn parse_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<u64>()
        .map(Some)
        .map_err(|_| ConfigError::InvalidEnv(name))
}
