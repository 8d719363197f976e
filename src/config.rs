//! Bridge configuration loaded from the environment

use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{BridgeError, Result};

pub const DEFAULT_WS_PORT: u16 = 18799;
pub const DEFAULT_HTTP_PORT: u16 = 18800;
pub const DEFAULT_BRIDGE_URL: &str = "http://127.0.0.1:18800";
/// Largest accepted `POOL_MAX_SIZE`
pub const MAX_POOL_SIZE: usize = 10_000;

/// Runtime settings for the bridge process
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Interface both listeners bind to
    pub host: IpAddr,
    /// Listen port for the extension WebSocket
    pub ws_port: u16,
    /// Listen port for HTTP consumers
    pub http_port: u16,
    /// Low watermark; below it a batch is requested
    pub min_available: usize,
    /// Tokens requested per generation batch
    pub batch_size: usize,
    /// Hard cap on pool size
    pub max_size: usize,
    /// Tokens older than this are never served
    pub max_age: Duration,
    /// How long `/recaptcha/fresh` waits for a push
    pub fresh_timeout: Duration,
    /// Period of the watermark check
    pub check_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ws_port: DEFAULT_WS_PORT,
            http_port: DEFAULT_HTTP_PORT,
            min_available: 3,
            batch_size: 5,
            max_size: 50,
            max_age: Duration::from_secs(110),
            fresh_timeout: Duration::from_secs(16),
            check_interval: Duration::from_secs(10),
        }
    }
}

impl BridgeConfig {
    /// Load from process environment, falling back to defaults for unset keys
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            host: load(&lookup, "WS_HOST", defaults.host)?,
            ws_port: load(&lookup, "WS_PORT", defaults.ws_port)?,
            http_port: load(&lookup, "WS_HTTP_PORT", defaults.http_port)?,
            min_available: load(&lookup, "POOL_MIN_AVAILABLE", defaults.min_available)?,
            batch_size: load(&lookup, "POOL_BATCH_SIZE", defaults.batch_size)?,
            max_size: load(&lookup, "POOL_MAX_SIZE", defaults.max_size)?,
            max_age: load_secs(&lookup, "TOKEN_MAX_AGE_SECS", defaults.max_age)?,
            fresh_timeout: load_secs(&lookup, "FRESH_TIMEOUT_SECS", defaults.fresh_timeout)?,
            check_interval: load_secs(
                &lookup,
                "POOL_CHECK_INTERVAL_SECS",
                defaults.check_interval,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(BridgeError::config("POOL_MAX_SIZE must be at least 1"));
        }
        if self.max_size > MAX_POOL_SIZE {
            return Err(BridgeError::config(format!(
                "POOL_MAX_SIZE ({}) exceeds {}",
                self.max_size, MAX_POOL_SIZE
            )));
        }
        if self.min_available > self.max_size {
            return Err(BridgeError::config(format!(
                "POOL_MIN_AVAILABLE ({}) exceeds POOL_MAX_SIZE ({})",
                self.min_available, self.max_size
            )));
        }
        if self.batch_size == 0 {
            return Err(BridgeError::config("POOL_BATCH_SIZE must be at least 1"));
        }
        if self.max_age.is_zero() || self.fresh_timeout.is_zero() || self.check_interval.is_zero()
        {
            return Err(BridgeError::config("durations must be non-zero"));
        }
        Ok(())
    }

    pub fn ws_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.ws_port)
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.http_port)
    }
}

/// Base URL consumers use to reach the bridge HTTP API
pub fn bridge_url_from_env() -> String {
    std::env::var("RECAPTCHA_BRIDGE_URL").unwrap_or_else(|_| DEFAULT_BRIDGE_URL.to_string())
}

fn load<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Display,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| BridgeError::config(format!("Invalid {} value {:?}: {}", key, raw, e))),
        None => {
            log::debug!("{} not set, using default: {}", key, default);
            Ok(default)
        }
    }
}

fn load_secs<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    load(lookup, key, default.as_secs()).map(Duration::from_secs)
}
