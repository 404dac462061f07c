use crate::buffer::{BatchScheduler, Statistics};
use crate::client::{HttpTransport, Transport};
use crate::config::{Auth, ConfigMap, SinkConfig};
use crate::error::{ConfigError, SinkError};
use crate::metadata::{MetadataProvider, StaticMetadata};
use crate::record::{Level, LogRecord};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Destination for [`LogRecord`]s, as seen by the host logging framework.
///
/// `append` is fire-and-forget: it never blocks on I/O and never reports
/// delivery errors. Those end up in statistics and `tracing` diagnostics.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Hand a record to the sink.
    fn append(&self, record: LogRecord);

    /// Deliver everything buffered so far and wait for the result.
    async fn flush(&self);

    /// Stop background work, flush, and release network resources.
    async fn dispose(&self);
}

/// Constructor reference a host registry can store under a sink-type name.
pub type SinkConstructor = fn(&ConfigMap) -> Result<Box<dyn LogSink>, SinkError>;

/// Batching HTTP log sink.
///
/// Must be created inside a Tokio runtime: the flush timer and background
/// deliveries are spawned on it.
pub struct HttpLogSink {
    scheduler: BatchScheduler,
    metadata: Arc<dyn MetadataProvider>,
    /// Injected transport, reused by deep copies. `None` means a fresh
    /// [`HttpTransport`] per instance.
    custom_transport: Option<Arc<dyn Transport>>,
}

impl HttpLogSink {
    /// Name under which a host registry should register [`HttpLogSink::construct`].
    pub const SINK_TYPE: &'static str = "http";

    pub fn new(config: SinkConfig) -> Result<Self, SinkError> {
        HttpLogSinkBuilder::from_config(config).build()
    }

    /// Build a sink from the host framework's config map.
    ///
    /// Configuration errors are reported before any timer or client is created.
    pub fn from_map(map: &ConfigMap) -> Result<Self, SinkError> {
        Self::new(SinkConfig::from_map(map)?)
    }

    /// [`SinkConstructor`] for this sink type.
    pub fn construct(map: &ConfigMap) -> Result<Box<dyn LogSink>, SinkError> {
        Ok(Box::new(Self::from_map(map)?))
    }

    pub fn builder(url: impl Into<String>) -> HttpLogSinkBuilder {
        HttpLogSinkBuilder::new(url)
    }

    fn start(
        config: SinkConfig,
        headers: BTreeMap<String, String>,
        custom_transport: Option<Arc<dyn Transport>>,
        metadata: Arc<dyn MetadataProvider>,
    ) -> Result<Self, SinkError> {
        let transport = custom_transport
            .clone()
            .unwrap_or_else(|| Arc::new(HttpTransport::new()) as Arc<dyn Transport>);
        let scheduler = BatchScheduler::new(config, headers, transport, Arc::clone(&metadata))?;
        Ok(Self {
            scheduler,
            metadata,
            custom_transport,
        })
    }

    pub fn append(&self, record: LogRecord) {
        self.scheduler.append(record);
    }

    pub async fn flush(&self) {
        self.scheduler.flush().await;
    }

    pub async fn dispose(&self) {
        self.scheduler.dispose().await;
    }

    pub fn statistics(&self) -> Statistics {
        self.scheduler.statistics()
    }

    pub fn is_enabled(&self) -> bool {
        self.scheduler.is_enabled()
    }

    /// Toggle the `append` gate at runtime.
    pub fn set_enabled(&self, enabled: bool) {
        self.scheduler.set_enabled(enabled);
    }

    pub fn config(&self) -> &SinkConfig {
        self.scheduler.config()
    }

    /// Effective request headers, including derived auth and content-type.
    pub fn headers(&self) -> BTreeMap<String, String> {
        self.scheduler.headers()
    }

    /// Add or replace a request header on this instance only.
    pub fn insert_header(&self, name: &str, value: &str) -> Result<(), ConfigError> {
        self.scheduler.insert_header(name, value)
    }

    /// Independent sink with the same configuration and headers, and its own
    /// buffer, timer and HTTP client.
    pub fn deep_copy(&self) -> Result<Self, SinkError> {
        let copy = Self::start(
            self.config().clone(),
            self.headers(),
            self.custom_transport.clone(),
            Arc::clone(&self.metadata),
        )?;
        copy.set_enabled(self.is_enabled());
        Ok(copy)
    }
}

#[async_trait]
impl LogSink for HttpLogSink {
    fn append(&self, record: LogRecord) {
        HttpLogSink::append(self, record);
    }

    async fn flush(&self) {
        HttpLogSink::flush(self).await;
    }

    async fn dispose(&self) {
        HttpLogSink::dispose(self).await;
    }
}

/// Chained configuration for [`HttpLogSink`]. Later calls overwrite earlier
/// ones for the same setting.
#[derive(Clone)]
pub struct HttpLogSinkBuilder {
    config: SinkConfig,
    transport: Option<Arc<dyn Transport>>,
    metadata: Option<Arc<dyn MetadataProvider>>,
}

impl HttpLogSinkBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self::from_config(SinkConfig::new(url))
    }

    pub fn from_config(config: SinkConfig) -> Self {
        Self {
            config,
            transport: None,
            metadata: None,
        }
    }

    pub fn endpoint_path(mut self, path: impl Into<String>) -> Self {
        self.config.endpoint_path = Some(path.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.headers.insert(name.into(), value.into());
        self
    }

    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.config.auth = Auth::Bearer {
            token: token.into(),
        };
        self
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.auth = Auth::Basic {
            username: username.into(),
            password: password.into(),
        };
        self
    }

    pub fn min_level(mut self, level: Level) -> Self {
        self.config.min_level = level;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    pub fn batch_interval(mut self, interval: Duration) -> Self {
        self.config.batch_interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.retry.max_retries = max_retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry.base_delay = delay;
        self
    }

    pub fn exponential_backoff(mut self, exponential: bool) -> Self {
        self.config.retry.exponential = exponential;
        self
    }

    pub fn include_stack_trace(mut self, include: bool) -> Self {
        self.config.payload.include_stack_trace = include;
        self
    }

    pub fn include_metadata(mut self, include: bool) -> Self {
        self.config.payload.include_metadata = include;
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.config.compress = compress;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    /// Count cuts as successful sends without touching the network.
    pub fn test_mode(mut self, test_mode: bool) -> Self {
        self.config.test_mode = test_mode;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn metadata(mut self, metadata: Arc<dyn MetadataProvider>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Validate and return the accumulated configuration.
    pub fn build_config(&self) -> Result<SinkConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config.clone())
    }

    pub fn build(self) -> Result<HttpLogSink, SinkError> {
        let config = self.build_config()?;
        let headers = config.resolved_headers()?;
        let metadata = self
            .metadata
            .unwrap_or_else(|| Arc::new(StaticMetadata::default()) as Arc<dyn MetadataProvider>);
        HttpLogSink::start(config, headers, self.transport, metadata)
    }
}
