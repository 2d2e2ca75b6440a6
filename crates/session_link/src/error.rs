use shared::error::ApiError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("server_url must start with http:// or https://, got '{0}'")]
    InvalidServerUrl(String),
    #[error("no tokio runtime is available to schedule background work")]
    NoRuntime,
    #[error("no open connection")]
    NotConnected,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("request cancelled")]
    Cancelled,
    #[error("HTTP error (status {status}): {body}")]
    Http { status: u16, body: String },
    #[error("API error: {0:?}")]
    Api(ApiError),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("decode failed: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl LinkError {
    /// Whether repeating the same idempotent request could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http { status, .. } => matches!(status, 408 | 429 | 500..=599),
            Self::Api(api) => matches!(
                api.code,
                shared::error::ErrorCode::RateLimited
                    | shared::error::ErrorCode::Unavailable
                    | shared::error::ErrorCode::Internal
            ),
            Self::Request(err) => !err.is_builder() && !err.is_decode(),
            Self::ConnectionClosed | Self::NotConnected => true,
            Self::InvalidServerUrl(_)
            | Self::NoRuntime
            | Self::Cancelled
            | Self::Decode(_)
            | Self::Config(_) => false,
        }
    }
}
