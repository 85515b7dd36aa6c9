use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};

// Upstream timing constants. The chat endpoint streams slowly, so the
// per-request timeout is generous; connect and refresh stay short.
pub const CONNECT_TIMEOUT_SECS: u64 = 10;
pub const REFRESH_TIMEOUT_SECS: u64 = 15;

/// Used when neither `KIRO_REGION` nor the credentials file names a region.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Environment variables the gateway reads. Anything else in the process
/// environment is ignored.
const ENV_KEYS: &[&str] = &[
    "PROXY_API_KEY",
    "REFRESH_TOKEN",
    "PROFILE_ARN",
    "KIRO_REGION",
    "KIRO_CREDS_FILE",
    "TOKEN_REFRESH_THRESHOLD",
    "MAX_RETRIES",
    "BASE_RETRY_DELAY",
    "MODEL_CACHE_TTL",
    "DEFAULT_MAX_INPUT_TOKENS",
    "TOOL_DESCRIPTION_MAX_LENGTH",
    "DEBUG_LAST_REQUEST",
    "DEBUG_DIR",
    "HOST",
    "PORT",
    "REQUEST_TIMEOUT",
];

/// Gateway configuration, loaded from the process environment (after the
/// entry point has applied `.env`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bearer key clients must present on /v1/* routes.
    pub proxy_api_key: Option<String>,
    /// Upstream refresh token; overrides the credentials file when set.
    pub refresh_token: Option<String>,
    /// Upstream profile ARN; overrides the credentials file when set.
    pub profile_arn: Option<String>,
    /// Overrides the credentials file region; `None` falls back to the file,
    /// then to [`DEFAULT_REGION`].
    pub kiro_region: Option<String>,
    /// JSON credentials file written by the Kiro desktop sign-in.
    pub kiro_creds_file: Option<String>,
    /// Refresh proactively when the token expires within this many seconds.
    pub token_refresh_threshold: u64,
    pub max_retries: u32,
    pub base_retry_delay: f64,
    pub model_cache_ttl: u64,
    pub default_max_input_tokens: u32,
    pub tool_description_max_length: usize,
    pub debug_last_request: bool,
    pub debug_dir: String,
    pub host: String,
    pub port: u16,
    /// Per-request upstream timeout in seconds.
    pub request_timeout: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            proxy_api_key: None,
            refresh_token: None,
            profile_arn: None,
            kiro_region: None,
            kiro_creds_file: None,
            token_refresh_threshold: 600,
            max_retries: 3,
            base_retry_delay: 1.0,
            model_cache_ttl: 3600,
            default_max_input_tokens: 200_000,
            tool_description_max_length: 10_000,
            debug_last_request: false,
            debug_dir: "debug".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8000,
            request_timeout: 360,
        }
    }
}

impl GatewayConfig {
    /// Load config from the environment over built-in defaults.
    ///
    /// Variable names match the config fields case-insensitively
    /// (`KIRO_REGION` → `kiro_region`); unrelated environment variables are
    /// filtered out up front.
    pub fn load() -> crate::error::Result<Self> {
        let config: GatewayConfig = Figment::from(Serialized::defaults(GatewayConfig::default()))
            .merge(Env::raw().only(ENV_KEYS))
            .extract()
            .map_err(|e| crate::error::GatewayError::Config(e.to_string()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = GatewayConfig::default();
        assert_eq!(c.kiro_region, None);
        assert_eq!(c.token_refresh_threshold, 600);
        assert_eq!(c.max_retries, 3);
        assert_eq!(c.base_retry_delay, 1.0);
        assert_eq!(c.model_cache_ttl, 3600);
        assert_eq!(c.default_max_input_tokens, 200_000);
        assert_eq!(c.tool_description_max_length, 10_000);
        assert!(!c.debug_last_request);
    }
}
