use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Refresh token rejected: {0}")]
    AuthInvalid(String),

    #[error("Missing or invalid proxy API key")]
    ProxyAuthMissing,

    #[error("Request validation failed: {0}")]
    Validation(String),

    #[error("Upstream transport error: {0}")]
    Network(String),

    #[error("Upstream error ({status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("Upstream unavailable after {attempts} attempts: {last}")]
    UpstreamUnavailable { attempts: u32, last: String },

    #[error("Stream parse error: {0}")]
    StreamParse(String),

    #[error("Request timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// HTTP status surfaced to the client when the error escapes before any
    /// response byte was written.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::AuthInvalid(_) => 401,
            GatewayError::ProxyAuthMissing => 401,
            GatewayError::Validation(_) => 422,
            GatewayError::Upstream { .. } => 502,
            GatewayError::StreamParse(_) => 502,
            GatewayError::UpstreamUnavailable { .. } => 503,
            GatewayError::Network(_) => 503,
            GatewayError::Timeout { .. } => 504,
            GatewayError::Config(_)
            | GatewayError::Serialization(_)
            | GatewayError::Io(_) => 500,
        }
    }

    /// Machine-readable error type for OpenAI-style error bodies.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::AuthInvalid(_) | GatewayError::ProxyAuthMissing => {
                "authentication_error"
            }
            GatewayError::Validation(_) => "invalid_request_error",
            GatewayError::Timeout { .. } => "timeout_error",
            _ => "upstream_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
