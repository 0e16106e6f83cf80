use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::error::{Error, ErrorDetails};
use crate::rate_limit::RateLimitConfig;
use crate::session::{ClientIpSource, SessionsConfig};
use crate::usage_limit::{EntitlementsConfig, UsageConfig};

/// Environment variable holding the Redis URL for the `redis` usage store.
pub const REDIS_URL_ENV: &str = "CHATGATE_REDIS_URL";

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub usage: UsageConfig,
    #[serde(default)]
    pub entitlements: EntitlementsConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub bind_address: Option<SocketAddr>,
    #[serde(default)]
    pub debug: bool,
    /// Take client IPs from `X-Forwarded-For` / `X-Real-IP`. Enable only behind a
    /// proxy that sets these headers itself.
    #[serde(default)]
    pub trust_forwarded_headers: bool,
}

impl GatewayConfig {
    pub fn client_ip_source(&self) -> ClientIpSource {
        ClientIpSource::new(self.trust_forwarded_headers)
    }
}

impl Config {
    /// Load a config file from disk and validate it
    pub async fn load_from_path(path: &Path) -> Result<Self, Error> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::new(ErrorDetails::FileRead {
                message: e.to_string(),
                file_path: path.to_string_lossy().to_string(),
            })
        })?;
        let config = Self::from_toml_str(&contents)?;
        tracing::info!("Loaded config from `{}`", path.to_string_lossy());
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, Error> {
        let config: Config = toml::from_str(contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file as TOML: {e}"),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a component unusable.
    pub fn validate(&self) -> Result<(), Error> {
        if self.cache.max_entries == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`cache.max_entries` must be greater than 0".to_string(),
            }));
        }
        if self.rate_limit.requests_per_window == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`rate_limit.requests_per_window` must be greater than 0".to_string(),
            }));
        }
        if self.rate_limit.window_ms == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`rate_limit.window_ms` must be greater than 0".to_string(),
            }));
        }
        if self.usage.redis_timeout_ms == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`usage.redis_timeout_ms` must be greater than 0".to_string(),
            }));
        }
        if self.usage.redis_retention_days == Some(0) {
            return Err(Error::new(ErrorDetails::Config {
                message: "`usage.redis_retention_days` must be greater than 0 when set".to_string(),
            }));
        }
        self.entitlements.validate()?;
        Ok(())
    }
}
