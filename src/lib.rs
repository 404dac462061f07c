pub mod record;
pub mod metadata;
pub mod error;
pub mod payload;
pub mod client;
pub mod retry;
pub mod config;
pub mod env;
pub mod buffer;
pub mod sink;

#[cfg(test)]
mod testing;

pub use buffer::Statistics;
pub use config::{Auth, ConfigMap, SinkConfig};
pub use error::{ConfigError, SinkError};
pub use record::{Level, LogRecord};
pub use sink::{HttpLogSink, HttpLogSinkBuilder, LogSink, SinkConstructor};
