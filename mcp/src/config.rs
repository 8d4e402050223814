//! Typed orchestrator configuration, built from defaults and `MCP_*`
//! environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::budget::RateLimits;
use crate::executor::ExecutorConfig;
use crate::router::RouterConfig;

pub const ENV_SOCKET_PATH: &str = "MCP_SOCKET_PATH";
pub const ENV_LISTEN_ADDR: &str = "MCP_LISTEN_ADDR";
pub const ENV_MAX_FRAME_BYTES: &str = "MCP_MAX_FRAME_BYTES";
pub const ENV_MAX_DEPTH: &str = "MCP_MAX_DEPTH";
pub const ENV_MAX_CONCURRENT: &str = "MCP_MAX_CONCURRENT";
pub const ENV_AUTH_SECRET: &str = "MCP_AUTH_SECRET";
pub const ENV_HEARTBEAT_INTERVAL_MS: &str = "MCP_HEARTBEAT_INTERVAL_MS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value '{value}' for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything the orchestrator needs to come up.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub socket_path: PathBuf,
    pub listen_addr: SocketAddr,
    pub max_frame_bytes: usize,
    /// Supervisor delegation depth cap.
    pub max_depth: u32,
    /// Parallel requests admitted before BACKPRESSURE.
    pub max_concurrent: usize,
    /// HS256 secret the security gate verifies credentials against.
    pub auth_secret: String,
    pub heartbeat_interval: Duration,
    pub router: RouterConfig,
    pub rate_limits: RateLimits,
    pub executor: ExecutorConfig,
}

impl OrchestratorConfig {
    /// Defaults for everything except the secret.
    pub fn new(auth_secret: impl Into<String>) -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/mcp-orchestrator.sock"),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_frame_bytes: wire::DEFAULT_MAX_FRAME_BYTES,
            max_depth: 8,
            max_concurrent: 1_024,
            auth_secret: auth_secret.into(),
            heartbeat_interval: Duration::from_secs(5),
            router: RouterConfig::default(),
            rate_limits: RateLimits::default(),
            executor: ExecutorConfig::default(),
        }
    }

    /// Reads `MCP_*` variables over the defaults. `MCP_AUTH_SECRET` is
    /// required; everything else falls back.
    pub fn from_env() -> Result<Self, ConfigError> {
        let secret = std::env::var(ENV_AUTH_SECRET).map_err(|_| ConfigError::Missing(ENV_AUTH_SECRET))?;
        let mut cfg = Self::new(secret);

        if let Ok(path) = std::env::var(ENV_SOCKET_PATH) {
            cfg.socket_path = PathBuf::from(path);
        }
        if let Ok(addr) = std::env::var(ENV_LISTEN_ADDR) {
            cfg.listen_addr = addr.parse().map_err(|e| ConfigError::Invalid {
                var: ENV_LISTEN_ADDR,
                value: addr.clone(),
                reason: format!("{e}"),
            })?;
        }
        if let Some(v) = parse_env::<usize>(ENV_MAX_FRAME_BYTES)? {
            cfg.max_frame_bytes = v;
        }
        if let Some(v) = parse_env::<u32>(ENV_MAX_DEPTH)? {
            cfg.max_depth = v;
        }
        if let Some(v) = parse_env::<usize>(ENV_MAX_CONCURRENT)? {
            cfg.max_concurrent = v;
        }
        if let Some(v) = parse_env::<u64>(ENV_HEARTBEAT_INTERVAL_MS)? {
            cfg.heartbeat_interval = Duration::from_millis(v);
        }
        Ok(cfg)
    }
}

fn parse_env<T>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Err(_) => Ok(None),
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: format!("{e}"),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = OrchestratorConfig::new("secret");
        assert_eq!(cfg.max_depth, 8);
        assert_eq!(cfg.max_frame_bytes, 16 * 1024 * 1024);
        assert_eq!(cfg.rate_limits.per_user, 100);
    }

    #[test]
    fn missing_secret_is_a_config_error() {
        // Serialized via a unique var name to avoid cross-test env races.
        std::env::remove_var(ENV_AUTH_SECRET);
        assert!(matches!(
            OrchestratorConfig::from_env(),
            Err(ConfigError::Missing(ENV_AUTH_SECRET))
        ));
    }
}
