use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::client::{Outcome, Transport};

/// Attempt bounds and backoff timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts is `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Double the delay after every retryable failure. The delay is not capped.
    pub exponential: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            exponential: true,
        }
    }
}

/// Final result of delivering one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    Delivered,
    /// The endpoint answered 4xx; the batch must not be retried.
    Rejected(u16),
    /// Every allowed attempt failed with a retryable outcome.
    Exhausted { attempts: u32, last: Outcome },
}

impl DeliveryResult {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryResult::Delivered)
    }
}

/// Drives a [`Transport`] through bounded attempts for a single body.
///
/// Backoff sleeps suspend only the task delivering this batch.
#[derive(Clone)]
pub struct RetryController {
    transport: Arc<dyn Transport>,
    url: String,
    headers: BTreeMap<String, String>,
    timeout: Duration,
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(
        transport: Arc<dyn Transport>,
        url: String,
        headers: BTreeMap<String, String>,
        timeout: Duration,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            url,
            headers,
            timeout,
            policy,
        }
    }

    /// Returns `true` once the body has been accepted by the endpoint.
    pub async fn deliver(&self, body: &[u8]) -> bool {
        self.deliver_classified(body).await.is_delivered()
    }

    /// Like [`deliver`](Self::deliver) but reports why delivery stopped.
    pub async fn deliver_classified(&self, body: &[u8]) -> DeliveryResult {
        let mut attempts: u32 = 0;
        let mut delay = self.policy.base_delay;

        loop {
            let outcome = self
                .transport
                .send(&self.url, &self.headers, body.to_vec(), self.timeout)
                .await;

            match outcome {
                Outcome::Success => {
                    debug!(url = %self.url, attempts = attempts + 1, "log batch delivered");
                    return DeliveryResult::Delivered;
                }
                Outcome::ClientError(status) => {
                    return DeliveryResult::Rejected(status);
                }
                failure => {
                    attempts += 1;
                    if attempts > self.policy.max_retries {
                        return DeliveryResult::Exhausted {
                            attempts,
                            last: failure,
                        };
                    }
                    warn!(
                        url = %self.url,
                        outcome = ?failure,
                        attempt = attempts,
                        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "log batch delivery failed, retrying"
                    );
                    sleep(delay).await;
                    if self.policy.exponential {
                        delay = delay.saturating_mul(2);
                    }
                }
            }
        }
    }
}
