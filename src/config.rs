//! Process configuration loaded from the environment.
//!
//! Every variable is optional with a documented default; parse failures
//! fall back to the default and log a warning rather than panicking.

use std::time::Duration;

/// Default chat model name advertised when no tenant- or env-level model
/// override is configured.
pub const DEFAULT_CHAT_MODEL: &str = "claude-sonnet-4-20250514";

/// Sentinel API key used when no default or tenant key is configured.
pub const NO_KEY_SENTINEL: &str = "no-key";

/// Immutable process-wide defaults, materialised once at startup.
///
/// Per-tenant [`crate::config_cache::CacheEntry`] rows shadow these
/// field-by-field.
#[derive(Debug, Clone)]
pub struct DefaultLlmConfig {
    pub api_key: String,
    pub base_url: Option<String>,
    pub model: String,
}

impl DefaultLlmConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("LLM_DEFAULT_API_KEY").unwrap_or_else(|_| NO_KEY_SENTINEL.to_string()),
            base_url: std::env::var("LLM_DEFAULT_BASE_URL").ok(),
            model: std::env::var("LLM_DEFAULT_MODEL").unwrap_or_else(|_| DEFAULT_CHAT_MODEL.to_string()),
        }
    }
}

/// Operational configuration for the server binary and the components it
/// wires together.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub ws_max_frame_bytes: usize,
    pub stream_grace_window: Duration,
    pub stream_max_bytes: usize,
    pub client_config_ttl: Duration,
    pub client_config_idle_horizon: Duration,
    pub tool_call_timeout: Duration,
    pub token_usage_default_ceiling: u64,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            port: env_parsed("PORT", 8080),
            ws_max_frame_bytes: env_parsed("WS_MAX_FRAME_BYTES", 1024 * 1024),
            stream_grace_window: Duration::from_secs(env_parsed("STREAM_GRACE_WINDOW_SECS", 30)),
            stream_max_bytes: env_parsed("STREAM_MAX_BYTES", 2 * 1024 * 1024),
            client_config_ttl: Duration::from_secs(env_parsed("CLIENT_CONFIG_TTL_SECS", 300)),
            client_config_idle_horizon: Duration::from_secs(env_parsed(
                "CLIENT_CONFIG_IDLE_HORIZON_SECS",
                3600,
            )),
            tool_call_timeout: Duration::from_secs(env_parsed("TOOL_CALL_TIMEOUT_SECS", 30)),
            token_usage_default_ceiling: env_parsed("TOKEN_USAGE_DEFAULT_CEILING", 200_000),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Parse an environment variable into `T`, falling back to `default` and
/// logging a warning on a missing or malformed value.
fn env_parsed<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, raw, "failed to parse env var, using default {}", default);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        let cfg = DefaultLlmConfig {
            api_key: NO_KEY_SENTINEL.into(),
            base_url: None,
            model: DEFAULT_CHAT_MODEL.into(),
        };
        assert_eq!(cfg.api_key, "no-key");
        assert_eq!(cfg.model, DEFAULT_CHAT_MODEL);
    }

    #[test]
    fn server_config_has_sane_defaults() {
        let cfg = ServerConfig {
            port: 8080,
            ws_max_frame_bytes: 1024 * 1024,
            stream_grace_window: Duration::from_secs(30),
            stream_max_bytes: 2 * 1024 * 1024,
            client_config_ttl: Duration::from_secs(300),
            client_config_idle_horizon: Duration::from_secs(3600),
            tool_call_timeout: Duration::from_secs(30),
            token_usage_default_ceiling: 200_000,
        };
        assert_eq!(cfg.port, 8080);
        assert!(cfg.stream_max_bytes > 0);
    }
}
