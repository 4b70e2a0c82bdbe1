use crate::error::{CentralError, CentralResult};
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_CHUNK_SIZE: usize = 20;
/// ATT protocol floor
pub const MIN_MTU: u16 = 23;
/// ATT protocol ceiling
pub const MAX_MTU: u16 = 517;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CentralConfig {
    /// Bound on connection establishment when the caller gives none
    pub connect_timeout_ms: u64,
    /// Chunk size used by batched writes given a non-positive size
    pub default_chunk_size: usize,
    pub min_mtu: u16,
    pub max_mtu: u16,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            min_mtu: MIN_MTU,
            max_mtu: MAX_MTU,
        }
    }
}

impl CentralConfig {
    /// Load from the environment, reading `.env` first when present
    pub fn from_env() -> CentralResult<Self> {
        dotenv::dotenv().ok();
        Self::from_source(|key| env::var(key).ok())
    }

    /// Load from an arbitrary key lookup, falling back to defaults for
    /// unset keys
    pub fn from_source<F>(lookup: F) -> CentralResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            connect_timeout_ms: read(
                &lookup,
                "BLE_CENTRAL_CONNECT_TIMEOUT_MS",
                defaults.connect_timeout_ms,
            )?,
            default_chunk_size: read(&lookup, "BLE_CENTRAL_CHUNK_SIZE", defaults.default_chunk_size)?,
            min_mtu: read(&lookup, "BLE_CENTRAL_MIN_MTU", defaults.min_mtu)?,
            max_mtu: read(&lookup, "BLE_CENTRAL_MAX_MTU", defaults.max_mtu)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CentralResult<()> {
        if self.connect_timeout_ms == 0 {
            return Err(CentralError::Config("connect_timeout_ms must be positive".to_string()));
        }
        if self.default_chunk_size == 0 {
            return Err(CentralError::Config("default_chunk_size must be positive".to_string()));
        }
        if self.min_mtu == 0 || self.max_mtu == 0 {
            return Err(CentralError::Config("MTU bounds must be positive".to_string()));
        }
        if self.min_mtu > self.max_mtu {
            return Err(CentralError::Config(format!(
                "min_mtu {} exceeds max_mtu {}",
                self.min_mtu, self.max_mtu
            )));
        }
        Ok(())
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Clamp a requested MTU into the protocol range
    pub fn clamp_mtu(&self, requested: u16) -> u16 {
        requested.clamp(self.min_mtu, self.max_mtu)
    }
}

fn read<T, F>(lookup: &F, key: &str, default: T) -> CentralResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| CentralError::Config(format!("{}={:?}: {}", key, raw, e))),
        None => Ok(default),
    }
}
