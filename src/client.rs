use async_trait::async_trait;
use reqwest::Client;
use std::collections::BTreeMap;
use std::time::Duration;

/// Result of exactly one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// 2xx response.
    Success,
    /// 4xx response. Repeating the request will not help.
    ClientError(u16),
    /// 5xx or any other non-2xx response.
    ServerError(u16),
    /// The per-request timeout elapsed.
    Timeout,
    /// Connection, DNS or TLS failure.
    TransportError(String),
}

impl Outcome {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Outcome::ServerError(_) | Outcome::Timeout | Outcome::TransportError(_)
        )
    }
}

/// Map an HTTP status code onto an [`Outcome`].
pub fn classify_status(status: u16) -> Outcome {
    match status {
        200..=299 => Outcome::Success,
        400..=499 => Outcome::ClientError(status),
        _ => Outcome::ServerError(status),
    }
}

/// Append `path` to `base` with exactly one separating slash.
pub fn join_url(base: &str, path: Option<&str>) -> String {
    match path.map(str::trim).filter(|p| !p.is_empty()) {
        Some(path) => format!(
            "{}/{}",
            base.trim_end_matches('/'),
            path.trim_start_matches('/')
        ),
        None => base.to_string(),
    }
}

/// One-shot request transport used by the retry controller.
///
/// Implementations never retry on their own; each call reports the result
/// of a single attempt.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Outcome;
}

/// [`Transport`] issuing JSON POSTs with `reqwest`.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        let client = Client::builder()
            .user_agent(concat!("http-log-sink/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Outcome {
        let mut request = self.client.post(url).timeout(timeout).body(body);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        match request.send().await {
            Ok(resp) => classify_status(resp.status().as_u16()),
            Err(e) if e.is_timeout() => Outcome::Timeout,
            Err(e) => Outcome::TransportError(e.to_string()),
        }
    }
}
