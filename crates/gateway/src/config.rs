//! Gateway configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::breaker::CircuitBreakerConfig;
use crate::ratelimit::RateLimitConfig;

#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    /// Scopes served as `/{scope}/sse` endpoints.
    pub scopes: Vec<String>,

    // Authentication
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub max_token_age_secs: i64,
    /// Shared secret forwarded to backends in `X-Gateway-Auth`.
    pub gateway_secret: String,

    // Tool registry and policy files
    pub registry_path: PathBuf,
    pub policy_path: PathBuf,

    // Admission
    pub user_rate_limit: RateLimitConfig,
    pub tool_rate_limit: RateLimitConfig,
    pub breaker: CircuitBreakerConfig,
    pub max_concurrent_per_tool: u32,

    // Transport
    pub max_frame_bytes: usize,
    /// Cap on serialized `tools/call` arguments, below the frame cap.
    pub max_argument_bytes: usize,
    pub call_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
    #[error("Invalid value: {0}")]
    Invalid(&'static str),
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let scopes: Vec<String> = env::var("GATEWAY_SCOPES")
            .unwrap_or_else(|_| "calculator,git,docs".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if scopes.is_empty() {
            return Err(ConfigError::Invalid("GATEWAY_SCOPES must name at least one scope"));
        }

        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            scopes,

            jwt_secret: {
                let secret =
                    env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "JWT_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },
            jwt_issuer: env::var("JWT_ISSUER").unwrap_or_else(|_| "mcp-gateway".to_string()),
            jwt_audience: env::var("JWT_AUDIENCE").unwrap_or_else(|_| "mcp-gateway".to_string()),
            max_token_age_secs: env_parse("MAX_TOKEN_AGE_SECS", 86_400),
            gateway_secret: {
                let secret = env::var("GATEWAY_SECRET")
                    .map_err(|_| ConfigError::Missing("GATEWAY_SECRET"))?;
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "GATEWAY_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },

            registry_path: env::var("REGISTRY_PATH")
                .unwrap_or_else(|_| "config/tools.json".to_string())
                .into(),
            policy_path: env::var("POLICY_PATH")
                .unwrap_or_else(|_| "config/policy.json".to_string())
                .into(),

            user_rate_limit: RateLimitConfig {
                requests_per_minute: env_parse("USER_REQUESTS_PER_MINUTE", 1_000),
                burst_size: env_parse("USER_BURST_SIZE", 2_000),
            },
            tool_rate_limit: RateLimitConfig {
                requests_per_minute: env_parse("TOOL_REQUESTS_PER_MINUTE", 1_000),
                burst_size: env_parse("TOOL_BURST_SIZE", 2_000),
            },
            breaker: CircuitBreakerConfig {
                failure_threshold: env_parse("BREAKER_FAILURE_THRESHOLD", 5),
                window: Duration::from_secs(env_parse("BREAKER_WINDOW_SECS", 30)),
                cooldown: Duration::from_secs(env_parse("BREAKER_COOLDOWN_SECS", 15)),
            },
            max_concurrent_per_tool: env_parse("MAX_CONCURRENT_PER_TOOL", 10),

            max_frame_bytes: env_parse("MAX_FRAME_BYTES", 1_048_576),
            max_argument_bytes: env_parse("MAX_ARGUMENT_BYTES", 262_144),
            call_timeout: Duration::from_millis(env_parse("CALL_TIMEOUT_MS", 30_000)),
        })
    }
}
