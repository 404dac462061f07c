use std::sync::Arc;
use std::time::Instant;
use tokio::time::Duration;

use http_log_sink::env::{config_map_from_env, env_or, HTTP_LOG_SINK_URL_ENV};
use http_log_sink::metadata::StaticMetadata;
use http_log_sink::{HttpLogSinkBuilder, Level, LogRecord, SinkConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    // Everything but the URL comes from HTTP_LOG_SINK_* variables.
    let mut map = config_map_from_env();
    map.insert(
        "url".to_string(),
        env_or(HTTP_LOG_SINK_URL_ENV, "http://127.0.0.1:8080/logs").into(),
    );
    let config = SinkConfig::from_map(&map).expect("valid sink config");

    let metadata = Arc::new(StaticMetadata::new(
        Some(env!("CARGO_PKG_VERSION").to_string()),
        Some("load-generator".to_string()),
        None,
    ));
    metadata.put_context("run", "custom_load");

    let sink = HttpLogSinkBuilder::from_config(config)
        .batch_interval(Duration::from_millis(500))
        .metadata(metadata)
        .build()
        .expect("sink starts");

    let n: u64 = 10_000;
    let start = Instant::now();

    for i in 0..n {
        let level = if i % 100 == 0 { Level::Error } else { Level::Info };
        sink.append(LogRecord::new(level, format!("custom load test {i}")).with_logger("load"));
    }

    sink.dispose().await;
    let elapsed = start.elapsed();
    let stats = sink.statistics();
    println!("custom config: {} records in {:?}, {} batches sent, {} failed, {} left buffered",
        n,
        elapsed,
        stats.successful_sends,
        stats.failed_sends,
        stats.buffer_size
    );
}
