//! Environment variable names used by this crate for convenient
//! configuration of the sink from services.
//!
//! These are purely helpers: they produce the same [`ConfigMap`] the host
//! framework would hand over, so the typed parser stays the single source
//! of truth.

use serde_json::Value;

use crate::config::ConfigMap;

/// Collector base URL, e.g. `https://logs.example.com`.
pub const HTTP_LOG_SINK_URL_ENV: &str = "HTTP_LOG_SINK_URL";

/// Optional path appended to the base URL.
pub const HTTP_LOG_SINK_ENDPOINT_PATH_ENV: &str = "HTTP_LOG_SINK_ENDPOINT_PATH";

/// Optional token for bearer (or pre-encoded basic) auth.
pub const HTTP_LOG_SINK_AUTH_TOKEN_ENV: &str = "HTTP_LOG_SINK_AUTH_TOKEN";

/// Optional auth scheme for the token, `Bearer` or `Basic`.
pub const HTTP_LOG_SINK_AUTH_TYPE_ENV: &str = "HTTP_LOG_SINK_AUTH_TYPE";

/// Optional basic-auth user name.
pub const HTTP_LOG_SINK_USERNAME_ENV: &str = "HTTP_LOG_SINK_USERNAME";

/// Optional basic-auth password.
pub const HTTP_LOG_SINK_PASSWORD_ENV: &str = "HTTP_LOG_SINK_PASSWORD";

/// Extra headers as a JSON object, e.g. `{"X-Team":"core"}`.
pub const HTTP_LOG_SINK_HEADERS_ENV: &str = "HTTP_LOG_SINK_HEADERS";

/// Batch-size threshold.
pub const HTTP_LOG_SINK_BATCH_SIZE_ENV: &str = "HTTP_LOG_SINK_BATCH_SIZE";

/// Flush timer period in seconds.
pub const HTTP_LOG_SINK_BATCH_INTERVAL_ENV: &str = "HTTP_LOG_SINK_BATCH_INTERVAL_SECONDS";

/// Maximum retries per batch.
pub const HTTP_LOG_SINK_MAX_RETRIES_ENV: &str = "HTTP_LOG_SINK_MAX_RETRIES";

/// Per-request timeout in seconds.
pub const HTTP_LOG_SINK_TIMEOUT_ENV: &str = "HTTP_LOG_SINK_TIMEOUT_SECONDS";

/// Minimum level shipped by the sink.
pub const HTTP_LOG_SINK_LEVEL_ENV: &str = "HTTP_LOG_SINK_LEVEL";

/// `true` to gzip request bodies.
pub const HTTP_LOG_SINK_COMPRESS_ENV: &str = "HTTP_LOG_SINK_COMPRESS";

/// `false` to turn the sink off.
pub const HTTP_LOG_SINK_ENABLED_ENV: &str = "HTTP_LOG_SINK_ENABLED";

const ENV_KEYS: &[(&str, &str)] = &[
    (HTTP_LOG_SINK_URL_ENV, "url"),
    (HTTP_LOG_SINK_ENDPOINT_PATH_ENV, "endpointPath"),
    (HTTP_LOG_SINK_AUTH_TOKEN_ENV, "authToken"),
    (HTTP_LOG_SINK_AUTH_TYPE_ENV, "authType"),
    (HTTP_LOG_SINK_USERNAME_ENV, "username"),
    (HTTP_LOG_SINK_PASSWORD_ENV, "password"),
    (HTTP_LOG_SINK_HEADERS_ENV, "headers"),
    (HTTP_LOG_SINK_BATCH_SIZE_ENV, "batchSize"),
    (HTTP_LOG_SINK_BATCH_INTERVAL_ENV, "batchIntervalSeconds"),
    (HTTP_LOG_SINK_MAX_RETRIES_ENV, "maxRetries"),
    (HTTP_LOG_SINK_TIMEOUT_ENV, "timeoutSeconds"),
    (HTTP_LOG_SINK_LEVEL_ENV, "level"),
    (HTTP_LOG_SINK_COMPRESS_ENV, "compressBatch"),
    (HTTP_LOG_SINK_ENABLED_ENV, "enabled"),
];

/// Read an environment variable or fall back to a provided default.
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Build a config map from the process environment.
pub fn config_map_from_env() -> ConfigMap {
    config_map_from_vars(|key| std::env::var(key).ok())
}

/// Build a config map from any variable lookup. Unset variables are skipped.
pub fn config_map_from_vars(lookup: impl Fn(&str) -> Option<String>) -> ConfigMap {
    ENV_KEYS
        .iter()
        .filter_map(|&(var, key)| lookup(var).map(|value| (key.to_string(), Value::String(value))))
        .collect()
}
