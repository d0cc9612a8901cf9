use thiserror::Error;

/// Errors raised while configuring or running a review session
#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("no review providers are enabled and ready")]
    NoActiveProviders,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("provider '{provider}' failed: {message}")]
    Provider { provider: String, message: String },

    #[error("provider '{provider}' stream aborted: {reason}")]
    Hallucination { provider: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, ReviewError>;
