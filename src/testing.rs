//! In-memory transports for unit tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use crate::client::{Outcome, Transport};

/// Answers with a scripted sequence of outcomes, then repeats the fallback.
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Outcome>>,
    fallback: Outcome,
    calls: AtomicUsize,
    bodies: Mutex<Vec<Vec<u8>>>,
    headers: Mutex<Vec<BTreeMap<String, String>>>,
    /// When set, every send waits for a permit before answering.
    gate: Option<Arc<Notify>>,
}

impl ScriptedTransport {
    pub(crate) fn new(script: Vec<Outcome>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: Outcome::Success,
            calls: AtomicUsize::new(0),
            bodies: Mutex::new(Vec::new()),
            headers: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// Answers `Success` only after `gate` is notified, once per send.
    pub(crate) fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(Vec::new())
        }
    }

    pub(crate) fn repeating(outcome: Outcome) -> Self {
        Self {
            fallback: outcome,
            ..Self::new(Vec::new())
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn bodies(&self) -> Vec<Vec<u8>> {
        self.bodies.lock().unwrap().clone()
    }

    pub(crate) fn last_headers(&self) -> Option<BTreeMap<String, String>> {
        self.headers.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        _url: &str,
        headers: &BTreeMap<String, String>,
        body: Vec<u8>,
        _timeout: Duration,
    ) -> Outcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.bodies.lock().unwrap().push(body);
        self.headers.lock().unwrap().push(headers.clone());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}
