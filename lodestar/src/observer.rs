//! Per-attempt observability
//!
//! The executor emits one [`AttemptEvent`] for every HTTP attempt it makes,
//! successful or not, to each registered [`AttemptListener`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;

/// How an attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    /// Failed in a way that is retried or failed over
    Retryable,
    /// Failed in a way that ends the call
    Fatal,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Retryable => "retryable",
            AttemptOutcome::Fatal => "fatal",
        }
    }
}

/// Record of one HTTP attempt
#[derive(Debug, Clone, Serialize)]
pub struct AttemptEvent {
    pub datacenter_id: String,
    pub node_id: String,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    /// 1-based attempt number on this node
    pub try_count: u32,
    pub http_status: Option<u16>,
    /// Label of the transport error, if the exchange did not complete
    pub error_class: Option<String>,
    pub outcome: AttemptOutcome,
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Receives attempt events. Called inline on the request path; keep it cheap.
pub trait AttemptListener: Send + Sync {
    fn on_attempt(&self, event: &AttemptEvent);
}

/// Logs every attempt through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl AttemptListener for TracingListener {
    fn on_attempt(&self, event: &AttemptEvent) {
        match event.outcome {
            AttemptOutcome::Success => tracing::debug!(
                target: "lodestar::attempt",
                datacenter = %event.datacenter_id,
                node = %event.node_id,
                request_id = %event.request_id,
                try_count = event.try_count,
                status = ?event.http_status,
                elapsed_ms = event.elapsed.as_millis() as u64,
                "attempt succeeded"
            ),
            AttemptOutcome::Retryable | AttemptOutcome::Fatal => tracing::warn!(
                target: "lodestar::attempt",
                datacenter = %event.datacenter_id,
                node = %event.node_id,
                request_id = %event.request_id,
                try_count = event.try_count,
                status = ?event.http_status,
                error = ?event.error_class,
                outcome = event.outcome.as_str(),
                elapsed_ms = event.elapsed.as_millis() as u64,
                "attempt failed"
            ),
        }
    }
}

/// Keeps every attempt event in memory, in emission order
#[derive(Debug, Default)]
pub struct AuditTrail {
    events: Mutex<Vec<AttemptEvent>>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events
    pub fn events(&self) -> Vec<AttemptEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// `(datacenter, node)` of each attempt, in order
    pub fn route(&self) -> Vec<(String, String)> {
        self.events
            .lock()
            .iter()
            .map(|e| (e.datacenter_id.clone(), e.node_id.clone()))
            .collect()
    }
}

impl AttemptListener for AuditTrail {
    fn on_attempt(&self, event: &AttemptEvent) {
        self.events.lock().push(event.clone());
    }
}
