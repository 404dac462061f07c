//! Live record buffer, cut triggers and the flush timer.
//!
//! The buffer, the counters and the per-instance header set live behind one
//! mutex. `append`, the timer task and delivery completion all take that same
//! lock and never hold it across an `.await`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::client::Transport;
use crate::config::{set_header, SinkConfig};
use crate::error::{ConfigError, SinkError};
use crate::metadata::MetadataProvider;
use crate::payload::{build_envelope, encode};
use crate::record::{Level, LogRecord};
use crate::retry::{DeliveryResult, RetryController};

/// Buffered ERROR-or-above records that force a cut regardless of batch size.
pub const URGENT_ERROR_THRESHOLD: usize = 10;

/// Point-in-time copy of the sink counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub successful_sends: u64,
    pub failed_sends: u64,
    pub buffer_size: usize,
    pub last_send_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
enum CutTrigger {
    UrgentError,
    Size,
    Timer,
    Flush,
}

/// Records captured by a cut, with the transport and headers current at
/// that moment.
struct PendingBatch {
    records: Vec<LogRecord>,
    headers: BTreeMap<String, String>,
    transport: Arc<dyn Transport>,
}

struct State {
    buffer: VecDeque<LogRecord>,
    successful_sends: u64,
    failed_sends: u64,
    last_send_time: Option<DateTime<Utc>>,
    headers: BTreeMap<String, String>,
    /// `None` once the sink has been disposed.
    transport: Option<Arc<dyn Transport>>,
    disposed: bool,
}

impl State {
    fn cut(&mut self) -> Option<PendingBatch> {
        if self.buffer.is_empty() {
            return None;
        }
        let transport = self.transport.clone()?;
        Some(PendingBatch {
            records: self.buffer.drain(..).collect(),
            headers: self.headers.clone(),
            transport,
        })
    }
}

struct Inner {
    config: SinkConfig,
    url: String,
    enabled: AtomicBool,
    metadata: Arc<dyn MetadataProvider>,
    runtime: Handle,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand a batch to a background task; test mode completes it inline.
    fn dispatch(self: &Arc<Self>, batch: PendingBatch, trigger: CutTrigger) {
        debug!(records = batch.records.len(), trigger = ?trigger, "log batch cut");
        if self.config.test_mode {
            self.record_success();
            return;
        }
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            inner.deliver(batch).await;
        });
    }

    async fn deliver(&self, batch: PendingBatch) {
        if self.config.test_mode {
            self.record_success();
            return;
        }

        let PendingBatch {
            records,
            headers,
            transport,
        } = batch;

        let body = {
            let envelope = build_envelope(&records, self.config.payload, self.metadata.as_ref());
            encode(&envelope, self.config.compress)
        };
        let body = match body {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, records = records.len(), "failed to encode log batch");
                self.reinsert_or_drop(records);
                return;
            }
        };

        let retry = RetryController::new(
            transport,
            self.url.clone(),
            headers,
            self.config.timeout,
            self.config.retry,
        );
        match retry.deliver_classified(&body).await {
            DeliveryResult::Delivered => self.record_success(),
            DeliveryResult::Rejected(status) => {
                self.lock().failed_sends += 1;
                warn!(
                    url = %self.url,
                    status,
                    records = records.len(),
                    "log batch rejected by endpoint, dropping"
                );
            }
            DeliveryResult::Exhausted { attempts, last } => {
                warn!(
                    url = %self.url,
                    attempts,
                    outcome = ?last,
                    records = records.len(),
                    "log batch delivery failed after retries"
                );
                self.reinsert_or_drop(records);
            }
        }
    }

    fn record_success(&self) {
        let mut state = self.lock();
        state.successful_sends += 1;
        state.last_send_time = Some(Utc::now());
    }

    /// Put a failed batch back in front of newer records, unless the live
    /// buffer already holds twice the batch size.
    fn reinsert_or_drop(&self, records: Vec<LogRecord>) {
        let ceiling = self.config.batch_size.saturating_mul(2);
        let mut state = self.lock();
        state.failed_sends += 1;

        let buffered = state.buffer.len();
        if buffered < ceiling {
            for record in records.into_iter().rev() {
                state.buffer.push_front(record);
            }
            debug!(buffered = state.buffer.len(), "failed log batch requeued");
        } else {
            drop(state);
            warn!(
                dropped = records.len(),
                buffered,
                ceiling,
                "log buffer full, dropping failed batch"
            );
        }
    }
}

/// Owns the live buffer and schedules cuts, by size, by urgency and on a
/// fixed period.
pub struct BatchScheduler {
    inner: Arc<Inner>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl BatchScheduler {
    /// Start a scheduler and its flush timer on the current Tokio runtime.
    pub fn new(
        config: SinkConfig,
        headers: BTreeMap<String, String>,
        transport: Arc<dyn Transport>,
        metadata: Arc<dyn MetadataProvider>,
    ) -> Result<Self, SinkError> {
        let runtime = Handle::try_current().map_err(|_| SinkError::NoRuntime)?;

        let inner = Arc::new(Inner {
            url: config.target_url(),
            enabled: AtomicBool::new(config.enabled),
            metadata,
            runtime,
            state: Mutex::new(State {
                buffer: VecDeque::with_capacity(config.batch_size.min(1024)),
                successful_sends: 0,
                failed_sends: 0,
                last_send_time: None,
                headers,
                transport: Some(transport),
                disposed: false,
            }),
            config,
        });
        let timer = spawn_timer(&inner);

        Ok(Self {
            inner,
            timer: Mutex::new(Some(timer)),
        })
    }

    /// Buffer a record and cut if a trigger fires. Never blocks on delivery.
    pub fn append(&self, record: LogRecord) {
        if !self.is_enabled() || record.level < self.inner.config.min_level {
            return;
        }
        let urgent = record.level >= Level::Error;

        let cut = {
            let mut state = self.inner.lock();
            if state.disposed {
                return;
            }
            state.buffer.push_back(record);

            let len = state.buffer.len();
            let trigger = if urgent && len >= URGENT_ERROR_THRESHOLD {
                Some(CutTrigger::UrgentError)
            } else if len >= self.inner.config.batch_size {
                Some(CutTrigger::Size)
            } else {
                None
            };
            trigger.and_then(|trigger| state.cut().map(|batch| (batch, trigger)))
        };

        if let Some((batch, trigger)) = cut {
            self.inner.dispatch(batch, trigger);
        }
    }

    /// Cut whatever is buffered and wait for its delivery to finish.
    pub async fn flush(&self) {
        let batch = self.inner.lock().cut();
        if let Some(batch) = batch {
            debug!(records = batch.records.len(), trigger = ?CutTrigger::Flush, "log batch cut");
            self.inner.deliver(batch).await;
        }
    }

    /// Stop the timer, drain the buffer and release the transport.
    ///
    /// Later calls return immediately.
    pub async fn dispose(&self) {
        let timer = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(timer) = timer else {
            return;
        };
        timer.abort();

        self.inner.lock().disposed = true;
        self.flush().await;
        self.inner.lock().transport = None;
        debug!(url = %self.inner.url, "log sink disposed");
    }

    pub fn statistics(&self) -> Statistics {
        let state = self.inner.lock();
        Statistics {
            successful_sends: state.successful_sends,
            failed_sends: state.failed_sends,
            buffer_size: state.buffer.len(),
            last_send_time: state.last_send_time,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Headers sent with the next cut batch.
    pub fn headers(&self) -> BTreeMap<String, String> {
        self.inner.lock().headers.clone()
    }

    pub fn insert_header(&self, name: &str, value: &str) -> Result<(), ConfigError> {
        set_header(&mut self.inner.lock().headers, name, value)
    }

    pub fn config(&self) -> &SinkConfig {
        &self.inner.config
    }
}

impl Drop for BatchScheduler {
    fn drop(&mut self) {
        let timer = self
            .timer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = timer {
            timer.abort();
        }
    }
}

/// Deadline used when `now + interval` overflows the clock.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}

/// Periodic cut. Holds only a weak reference so a dropped sink ends the task.
fn spawn_timer(inner: &Arc<Inner>) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    let period = inner.config.batch_interval;

    inner.runtime.spawn(async move {
        let start = Instant::now()
            .checked_add(period)
            .unwrap_or_else(far_future);
        let mut ticker = interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let batch = inner.lock().cut();
            if let Some(batch) = batch {
                inner.dispatch(batch, CutTrigger::Timer);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Outcome;
    use crate::metadata::StaticMetadata;
    use crate::retry::RetryPolicy;
    use crate::testing::ScriptedTransport;
    use serde_json::Value;
    use tokio::sync::Notify;

    fn config(batch_size: usize, test_mode: bool) -> SinkConfig {
        let mut config = SinkConfig::new("http://collector.local");
        config.batch_size = batch_size;
        config.batch_interval = Duration::from_secs(5);
        config.test_mode = test_mode;
        config.retry = RetryPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(10),
            exponential: false,
        };
        config
    }

    fn scheduler(config: SinkConfig, transport: Arc<ScriptedTransport>) -> BatchScheduler {
        let headers = config.resolved_headers().unwrap();
        BatchScheduler::new(config, headers, transport, Arc::new(StaticMetadata::default())).unwrap()
    }

    fn info(message: &str) -> LogRecord {
        LogRecord::new(Level::Info, message)
    }

    fn messages(body: &[u8]) -> Vec<String> {
        let value: Value = serde_json::from_slice(body).unwrap();
        value["logs"]
            .as_array()
            .unwrap()
            .iter()
            .map(|log| log["message"].as_str().unwrap().to_string())
            .collect()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn appends_below_threshold_only_buffer() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let sink = scheduler(config(5, false), transport.clone());

        for i in 0..4 {
            sink.append(info(&format!("m{i}")));
        }
        settle().await;

        let stats = sink.statistics();
        assert_eq!(stats.buffer_size, 4);
        assert_eq!(stats.successful_sends, 0);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reaching_batch_size_cuts_once() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let sink = scheduler(config(3, true), transport.clone());

        for i in 0..3 {
            sink.append(info(&format!("m{i}")));
        }

        let stats = sink.statistics();
        assert_eq!(stats.buffer_size, 0);
        assert_eq!(stats.successful_sends, 1);
        assert!(stats.last_send_time.is_some());
        assert_eq!(transport.calls(), 0, "test mode never touches the transport");
    }

    #[tokio::test(start_paused = true)]
    async fn tenth_error_triggers_urgent_cut() {
        let sink = scheduler(config(50, true), Arc::new(ScriptedTransport::new(vec![])));

        for i in 0..9 {
            sink.append(LogRecord::new(Level::Error, format!("e{i}")));
        }
        assert_eq!(sink.statistics().buffer_size, 9);
        assert_eq!(sink.statistics().successful_sends, 0);

        sink.append(LogRecord::new(Level::Fatal, "e9"));
        let stats = sink.statistics();
        assert_eq!(stats.buffer_size, 0);
        assert_eq!(stats.successful_sends, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn urgent_cut_counts_all_buffered_records() {
        let sink = scheduler(config(50, true), Arc::new(ScriptedTransport::new(vec![])));

        for i in 0..9 {
            sink.append(info(&format!("i{i}")));
        }
        sink.append(LogRecord::new(Level::Error, "boom"));

        assert_eq!(sink.statistics().buffer_size, 0);
        assert_eq!(sink.statistics().successful_sends, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn info_records_do_not_trigger_urgent_cut() {
        let sink = scheduler(config(50, true), Arc::new(ScriptedTransport::new(vec![])));

        for i in 0..12 {
            sink.append(info(&format!("i{i}")));
        }
        assert_eq!(sink.statistics().buffer_size, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_cuts_non_empty_buffer() {
        let sink = scheduler(config(100, true), Arc::new(ScriptedTransport::new(vec![])));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(sink.statistics().successful_sends, 0, "empty buffer is not sent");

        sink.append(info("late"));
        tokio::time::sleep(Duration::from_secs(5)).await;

        let stats = sink.statistics();
        assert_eq!(stats.buffer_size, 0);
        assert_eq!(stats.successful_sends, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_drains_and_counts_one_send() {
        let sink = scheduler(config(100, true), Arc::new(ScriptedTransport::new(vec![])));
        sink.append(info("a"));
        sink.append(info("b"));

        sink.flush().await;
        let stats = sink.statistics();
        assert_eq!(stats.buffer_size, 0);
        assert_eq!(stats.successful_sends, 1);

        sink.flush().await;
        assert_eq!(sink.statistics().successful_sends, 1, "empty flush sends nothing");
    }

    #[tokio::test(start_paused = true)]
    async fn background_delivery_posts_batch_in_order() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let sink = scheduler(config(3, false), transport.clone());

        for name in ["a", "b", "c"] {
            sink.append(info(name));
        }
        settle().await;

        assert_eq!(transport.calls(), 1);
        assert_eq!(messages(&transport.bodies()[0]), ["a", "b", "c"]);
        assert_eq!(sink.statistics().successful_sends, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn records_appended_during_delivery_stay_buffered() {
        let gate = Arc::new(Notify::new());
        let transport = Arc::new(ScriptedTransport::gated(gate.clone()));
        let sink = scheduler(config(3, false), transport.clone());

        for name in ["a", "b", "c"] {
            sink.append(info(name));
        }
        settle().await;
        assert_eq!(transport.calls(), 1);
        assert_eq!(sink.statistics().buffer_size, 0);

        sink.append(info("d"));
        sink.append(info("e"));
        settle().await;

        let in_flight = sink.statistics();
        assert_eq!(in_flight.buffer_size, 2);
        assert_eq!(in_flight.successful_sends, 0);
        assert_eq!(messages(&transport.bodies()[0]), ["a", "b", "c"]);

        gate.notify_one();
        settle().await;

        let done = sink.statistics();
        assert_eq!(done.successful_sends, 1);
        assert_eq!(done.buffer_size, 2);
        assert_eq!(transport.calls(), 1);
        let buffered: Vec<_> = sink
            .inner
            .lock()
            .buffer
            .iter()
            .map(|record| record.message.clone())
            .collect();
        assert_eq!(buffered, ["d", "e"]);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_past_clock_range_keeps_timer_alive() {
        let mut config = config(10, true);
        config.batch_interval = Duration::from_secs(10_000_000_000_000_000_000);
        let sink = scheduler(config, Arc::new(ScriptedTransport::new(vec![])));
        settle().await;

        let timer_alive = sink
            .timer
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|timer| !timer.is_finished());
        assert!(timer_alive);

        sink.append(info("a"));
        sink.flush().await;
        assert_eq!(sink.statistics().successful_sends, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_is_requeued_ahead_of_newer_records() {
        let transport = Arc::new(ScriptedTransport::new(vec![Outcome::ServerError(503)]));
        let sink = scheduler(config(10, false), transport.clone());

        sink.append(info("a"));
        sink.append(info("b"));
        sink.flush().await;

        let stats = sink.statistics();
        assert_eq!(stats.failed_sends, 1);
        assert_eq!(stats.buffer_size, 2);

        sink.append(info("c"));
        sink.flush().await;

        assert_eq!(transport.calls(), 2);
        assert_eq!(messages(&transport.bodies()[1]), ["a", "b", "c"]);
        assert_eq!(sink.statistics().successful_sends, 1);
        assert_eq!(sink.statistics().buffer_size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_batch_is_dropped() {
        let transport = Arc::new(ScriptedTransport::new(vec![Outcome::ClientError(400)]));
        let sink = scheduler(config(10, false), transport.clone());

        sink.append(info("bad"));
        sink.flush().await;

        let stats = sink.statistics();
        assert_eq!(stats.failed_sends, 1);
        assert_eq!(stats.buffer_size, 0);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_is_dropped_when_buffer_at_ceiling() {
        let sink = scheduler(config(2, false), Arc::new(ScriptedTransport::new(vec![])));
        sink.inner
            .lock()
            .buffer
            .extend((0..4).map(|i| info(&format!("live{i}"))));

        sink.inner.reinsert_or_drop(vec![info("failed0"), info("failed1")]);

        let stats = sink.statistics();
        assert_eq!(stats.failed_sends, 1);
        assert_eq!(stats.buffer_size, 4);
        assert_eq!(sink.inner.lock().buffer[0].message, "live0");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_is_requeued_below_ceiling() {
        let sink = scheduler(config(2, false), Arc::new(ScriptedTransport::new(vec![])));
        sink.inner
            .lock()
            .buffer
            .extend((0..3).map(|i| info(&format!("live{i}"))));

        sink.inner.reinsert_or_drop(vec![info("failed0"), info("failed1")]);

        let state = sink.inner.lock();
        let order: Vec<&str> = state.buffer.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(order, ["failed0", "failed1", "live0", "live1", "live2"]);
        assert_eq!(state.failed_sends, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_sink_ignores_appends() {
        let mut config = config(2, true);
        config.enabled = false;
        let sink = scheduler(config, Arc::new(ScriptedTransport::new(vec![])));

        sink.append(info("ignored"));
        assert_eq!(sink.statistics().buffer_size, 0);

        sink.set_enabled(true);
        sink.append(info("kept"));
        assert_eq!(sink.statistics().buffer_size, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn records_below_min_level_are_ignored() {
        let mut config = config(10, true);
        config.min_level = Level::Warning;
        let sink = scheduler(config, Arc::new(ScriptedTransport::new(vec![])));

        sink.append(LogRecord::new(Level::Debug, "noise"));
        sink.append(LogRecord::new(Level::Warning, "signal"));
        assert_eq!(sink.statistics().buffer_size, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_flushes_then_ignores_appends() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let sink = scheduler(config(10, false), transport.clone());
        sink.append(info("last words"));

        sink.dispose().await;
        assert_eq!(transport.calls(), 1);
        assert_eq!(sink.statistics().successful_sends, 1);

        sink.append(info("after dispose"));
        sink.flush().await;
        sink.dispose().await;
        assert_eq!(sink.statistics().buffer_size, 0);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_stops_the_timer() {
        let sink = scheduler(config(10, true), Arc::new(ScriptedTransport::new(vec![])));
        sink.dispose().await;

        sink.inner.lock().buffer.push_back(info("stray"));
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(sink.statistics().buffer_size, 1);
        assert_eq!(sink.statistics().successful_sends, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn header_changes_apply_to_later_batches() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let sink = scheduler(config(10, false), transport.clone());
        sink.insert_header("X-Trace", "abc").unwrap();

        sink.append(info("a"));
        sink.flush().await;

        let headers = transport.last_headers().unwrap();
        assert_eq!(headers.get("X-Trace").map(String::as_str), Some("abc"));
        assert_eq!(headers.get("Content-Type").map(String::as_str), Some("application/json"));
        assert!(sink.insert_header("bad header", "x").is_err());
    }

    #[test]
    fn statistics_serialize_with_wire_keys() {
        let stats = Statistics {
            successful_sends: 2,
            failed_sends: 1,
            buffer_size: 7,
            last_send_time: None,
        };
        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "successfulSends": 2,
                "failedSends": 1,
                "bufferSize": 7,
                "lastSendTime": null
            })
        );
    }

    #[test]
    fn construction_outside_runtime_fails() {
        let config = config(10, true);
        let result = BatchScheduler::new(
            config,
            BTreeMap::new(),
            Arc::new(ScriptedTransport::new(vec![])),
            Arc::new(StaticMetadata::default()),
        );
        assert!(matches!(result, Err(SinkError::NoRuntime)));
    }
}
