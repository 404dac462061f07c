//! Typed sink configuration and the parser for the host framework's
//! loosely-typed config map.
//!
//! Nothing past [`SinkConfig::from_map`] sees an untyped value: aliases are
//! resolved first, then every recognised key is read, validated and
//! defaulted.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use reqwest::header::{HeaderName, HeaderValue};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::client::join_url;
use crate::error::ConfigError;
use crate::payload::PayloadFlags;
use crate::record::Level;
use crate::retry::RetryPolicy;

/// Raw configuration handed over by the host framework.
pub type ConfigMap = serde_json::Map<String, Value>;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// `(alias, canonical)` pairs. An alias only fills a canonical key that is absent.
const ALIASES: &[(&str, &str)] = &[
    ("bufferSize", "batchSize"),
    ("flushIntervalSeconds", "batchIntervalSeconds"),
    ("enableCompression", "compressBatch"),
];

/// Authentication scheme turned into an `Authorization` header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Auth {
    #[default]
    None,
    Bearer { token: String },
    Basic { username: String, password: String },
    /// Basic scheme with credentials that are already base64-encoded.
    BasicToken { token: String },
}

impl Auth {
    /// Value of the `Authorization` header, if any.
    pub fn header_value(&self) -> Option<String> {
        match self {
            Auth::None => None,
            Auth::Bearer { token } => Some(format!("Bearer {token}")),
            Auth::Basic { username, password } => {
                let encoded = BASE64_STANDARD.encode(format!("{username}:{password}"));
                Some(format!("Basic {encoded}"))
            }
            Auth::BasicToken { token } => Some(format!("Basic {token}")),
        }
    }
}

/// Immutable configuration of one sink instance.
#[derive(Clone, Debug, PartialEq)]
pub struct SinkConfig {
    /// Base URL of the collector.
    pub url: String,
    /// Optional path appended to `url`.
    pub endpoint_path: Option<String>,
    /// Static headers sent with every request.
    pub headers: BTreeMap<String, String>,
    pub auth: Auth,
    /// Records below this level are ignored by `append`.
    pub min_level: Level,
    /// Buffer length that triggers a cut.
    pub batch_size: usize,
    /// Period of the flush timer.
    pub batch_interval: Duration,
    /// Per-request timeout.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub payload: PayloadFlags,
    /// Gzip request bodies.
    pub compress: bool,
    pub enabled: bool,
    /// Skip the network entirely; cuts count as successful sends.
    pub test_mode: bool,
}

impl SinkConfig {
    /// Configuration for `url` with every other setting at its default.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            endpoint_path: None,
            headers: BTreeMap::new(),
            auth: Auth::None,
            min_level: Level::Trace,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_interval: DEFAULT_BATCH_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
            payload: PayloadFlags::default(),
            compress: false,
            enabled: true,
            test_mode: false,
        }
    }

    /// Parse the host framework's config map.
    pub fn from_map(raw: &ConfigMap) -> Result<Self, ConfigError> {
        let map = resolve_aliases(raw);
        let reader = Reader { map: &map };

        let url = reader
            .string("url")?
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::MissingUrl)?;
        let mut config = SinkConfig::new(url);

        config.endpoint_path = reader.string("endpointPath")?;
        if let Some(level) = reader.string("level")? {
            config.min_level = level
                .parse()
                .map_err(|e: crate::record::ParseLevelError| invalid("level", e.to_string()))?;
        }
        config.auth = read_auth(&reader)?;
        if let Some(headers) = reader.headers("headers")? {
            config.headers = headers;
        }
        if let Some(batch_size) = reader.unsigned("batchSize")? {
            config.batch_size = usize::try_from(batch_size)
                .map_err(|_| invalid("batchSize", "out of range"))?;
        }
        if let Some(interval) = reader.seconds("batchIntervalSeconds")? {
            config.batch_interval = interval;
        }
        if let Some(compress) = reader.boolean("compressBatch")? {
            config.compress = compress;
        }
        if let Some(max_retries) = reader.unsigned("maxRetries")? {
            config.retry.max_retries =
                u32::try_from(max_retries).map_err(|_| invalid("maxRetries", "out of range"))?;
        }
        if let Some(delay) = reader.seconds("retryDelaySeconds")? {
            config.retry.base_delay = delay;
        }
        if let Some(exponential) = reader.boolean("exponentialBackoff")? {
            config.retry.exponential = exponential;
        }
        if let Some(include) = reader.boolean("includeStackTrace")? {
            config.payload.include_stack_trace = include;
        }
        if let Some(include) = reader.boolean("includeMetadata")? {
            config.payload.include_metadata = include;
        }
        if let Some(timeout) = reader.seconds("timeoutSeconds")? {
            config.timeout = timeout;
        }
        if let Some(enabled) = reader.boolean("enabled")? {
            config.enabled = enabled;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check invariants that typed fields alone cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::MissingUrl);
        }
        let target = self.target_url();
        reqwest::Url::parse(&target).map_err(|e| ConfigError::InvalidUrl {
            url: target.clone(),
            reason: e.to_string(),
        })?;
        if self.batch_size == 0 {
            return Err(invalid("batchSize", "must be at least 1"));
        }
        if self.batch_interval.is_zero() {
            return Err(invalid("batchIntervalSeconds", "must be greater than zero"));
        }
        if self.compress && !cfg!(feature = "gzip") {
            return Err(ConfigError::GzipFeatureDisabled);
        }
        self.resolved_headers().map(|_| ())
    }

    /// Full request URL, `url` plus the optional endpoint path.
    pub fn target_url(&self) -> String {
        join_url(&self.url, self.endpoint_path.as_deref())
    }

    /// Static headers merged with the derived auth, content-type and
    /// content-encoding headers.
    pub fn resolved_headers(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        let mut headers = BTreeMap::new();
        for (name, value) in &self.headers {
            set_header(&mut headers, name, value)?;
        }
        if let Some(value) = self.auth.header_value() {
            set_header(&mut headers, "Authorization", &value)?;
        }
        if find_header(&headers, "Content-Type").is_none() {
            headers.insert("Content-Type".to_string(), "application/json".to_string());
        }
        if self.compress && find_header(&headers, "Content-Encoding").is_none() {
            headers.insert("Content-Encoding".to_string(), "gzip".to_string());
        }
        Ok(headers)
    }
}

/// Insert a header, replacing any existing entry that differs only in case.
pub(crate) fn set_header(
    headers: &mut BTreeMap<String, String>,
    name: &str,
    value: &str,
) -> Result<(), ConfigError> {
    let invalid_header = || ConfigError::InvalidHeader {
        name: name.to_string(),
    };
    HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid_header())?;
    HeaderValue::from_str(value).map_err(|_| invalid_header())?;

    if let Some(existing) = find_header(headers, name) {
        headers.remove(&existing);
    }
    headers.insert(name.to_string(), value.to_string());
    Ok(())
}

pub(crate) fn find_header(headers: &BTreeMap<String, String>, name: &str) -> Option<String> {
    headers
        .keys()
        .find(|key| key.eq_ignore_ascii_case(name))
        .cloned()
}

fn resolve_aliases(raw: &ConfigMap) -> ConfigMap {
    let mut resolved = raw.clone();
    for (alias, canonical) in ALIASES {
        if let Some(value) = raw.get(*alias) {
            resolved
                .entry(canonical.to_string())
                .or_insert_with(|| value.clone());
        }
    }
    resolved
}

fn read_auth(reader: &Reader<'_>) -> Result<Auth, ConfigError> {
    let token = reader.string("authToken")?;
    let auth_type = reader.string("authType")?;
    let username = reader.string("username")?;

    match (token, username) {
        (Some(token), _) => match auth_type.as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("bearer") => Ok(Auth::Bearer { token }),
            Some("basic") => Ok(Auth::BasicToken { token }),
            Some(other) => Err(invalid("authType", format!("unsupported scheme `{other}`"))),
        },
        (None, Some(username)) => Ok(Auth::Basic {
            username,
            password: reader.string("password")?.unwrap_or_default(),
        }),
        (None, None) => Ok(Auth::None),
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// Typed accessors over the alias-resolved map. Strings are accepted for
/// numbers and booleans so environment-sourced values parse the same way.
struct Reader<'a> {
    map: &'a ConfigMap,
}

impl Reader<'_> {
    fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key).filter(|value| !value.is_null())
    }

    fn string(&self, key: &str) -> Result<Option<String>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(_) => Err(invalid(key, "expected a string")),
        }
    }

    fn boolean(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Some(true)),
                "false" | "0" | "no" => Ok(Some(false)),
                _ => Err(invalid(key, format!("expected a boolean, got `{s}`"))),
            },
            Some(_) => Err(invalid(key, "expected a boolean")),
        }
    }

    fn unsigned(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        let number = match self.get(key) {
            None => return Ok(None),
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            Some(_) => None,
        };
        match number {
            Some(n) if n < 0.0 => Err(invalid(key, "must not be negative")),
            Some(n) if n.fract() == 0.0 && n <= u64::MAX as f64 => Ok(Some(n as u64)),
            _ => Err(invalid(key, "expected a non-negative integer")),
        }
    }

    fn seconds(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        let seconds = match self.get(key) {
            None => return Ok(None),
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            Some(_) => None,
        };
        match seconds {
            Some(s) if s.is_finite() && s >= 0.0 => Duration::try_from_secs_f64(s)
                .map(Some)
                .map_err(|_| invalid(key, "seconds out of range")),
            _ => Err(invalid(key, "expected a non-negative number of seconds")),
        }
    }

    fn headers(&self, key: &str) -> Result<Option<BTreeMap<String, String>>, ConfigError> {
        let object = match self.get(key) {
            None => return Ok(None),
            Some(Value::Object(object)) => object.clone(),
            Some(Value::String(s)) => serde_json::from_str::<ConfigMap>(s)
                .map_err(|e| invalid(key, format!("expected a JSON object: {e}")))?,
            Some(_) => return Err(invalid(key, "expected an object")),
        };

        let mut headers = BTreeMap::new();
        for (name, value) in object {
            let value = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return Err(invalid(key, format!("header `{name}` must be a string"))),
            };
            headers.insert(name, value);
        }
        Ok(Some(headers))
    }
}
