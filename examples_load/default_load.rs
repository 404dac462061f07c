use std::time::Instant;

use http_log_sink::{HttpLogSink, Level, LogRecord};

#[tokio::main]
async fn main() {
    // Test mode: batches are cut and counted but never leave the process.
    let sink = HttpLogSink::builder("http://127.0.0.1:9")
        .batch_size(128)
        .test_mode(true)
        .build()
        .expect("valid sink config");

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        sink.append(LogRecord::new(Level::Info, format!("default load test {i}")));
    }

    let elapsed = start.elapsed();
    sink.dispose().await;

    let stats = sink.statistics();
    println!("default config: appended {} records in {:?} (~{:.0} rec/s), {} batches",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64(),
        stats.successful_sends
    );
}
