use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

/// Source of per-batch metadata and the ambient diagnostic context.
///
/// Implemented by the host application. The sink queries it when a batch is
/// serialized, not when a record is appended, so `context()` reflects the
/// context active at send time.
pub trait MetadataProvider: Send + Sync {
    fn app_version(&self) -> Option<String>;
    fn device_id(&self) -> Option<String>;
    fn session_id(&self) -> Option<String>;

    /// Snapshot of the current mapped diagnostic context.
    fn context(&self) -> BTreeMap<String, String>;

    fn hostname(&self) -> Option<String> {
        local_hostname()
    }
}

/// [`MetadataProvider`] holding fixed identifiers and a mutable context map.
#[derive(Debug, Default)]
pub struct StaticMetadata {
    pub app_version: Option<String>,
    pub device_id: Option<String>,
    pub session_id: Option<String>,
    context: Mutex<BTreeMap<String, String>>,
}

impl StaticMetadata {
    pub fn new(
        app_version: Option<String>,
        device_id: Option<String>,
        session_id: Option<String>,
    ) -> Self {
        Self {
            app_version,
            device_id,
            session_id,
            context: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn put_context(&self, key: impl Into<String>, value: impl Into<String>) {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    pub fn remove_context(&self, key: &str) {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn clear_context(&self) {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl MetadataProvider for StaticMetadata {
    fn app_version(&self) -> Option<String> {
        self.app_version.clone()
    }

    fn device_id(&self) -> Option<String> {
        self.device_id.clone()
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }

    fn context(&self) -> BTreeMap<String, String> {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Hostname of this machine. `HOSTNAME` or `COMPUTERNAME` take precedence
/// when exported, otherwise the operating system is asked.
pub fn local_hostname() -> Option<String> {
    hostname_with(|key| std::env::var(key).ok())
}

fn hostname_with(lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|key| lookup(key))
        .filter(|name| !name.is_empty())
        .or_else(|| hostname::get().ok().and_then(|name| name.into_string().ok()))
        .filter(|name| !name.is_empty())
}
