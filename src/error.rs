//! Error types surfaced by the sink.
//!
//! Only construction is fallible from the caller's point of view. Delivery
//! failures are absorbed into statistics and `tracing` diagnostics.

/// Invalid or incomplete sink configuration.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required configuration key `url`")]
    MissingUrl,

    #[error("invalid url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("invalid HTTP header `{name}`")]
    InvalidHeader { name: String },

    #[error("compression requested but the gzip feature is not enabled")]
    GzipFeatureDisabled,
}

/// Failure turning a batch into a request body.
#[derive(thiserror::Error, Debug)]
pub enum PayloadError {
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("compression error: {0}")]
    Compress(#[from] std::io::Error),
}

/// Error returned when building a sink.
#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("sink must be constructed inside a Tokio runtime")]
    NoRuntime,
}
