//! Final call record persistence.
//!
//! Persistence is fire-and-forget with at-least-once intent: the live call is
//! never delayed or failed by the sink. Failed writes are retried with
//! exponential backoff plus jitter for a bounded number of attempts, then
//! surrendered with an error log for the operator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::degrade::DegradationEvent;
use crate::ledger::CostBreakdown;
use crate::session::SessionState;

/// Everything persisted about a finished call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: Uuid,
    pub tenant_id: String,
    pub final_state: SessionState,
    pub cost: CostBreakdown,
    pub degradation_events: Vec<DegradationEvent>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("persistence failed: {0}")]
pub struct SinkError(pub String);

/// External log sink for finished calls.
///
/// Implementations must be idempotent keyed by `call_id`: persisting the same
/// record twice yields one logical record, which is what makes the at-least-
/// once retry policy safe.
#[async_trait]
pub trait CallLogSink: Send + Sync {
    async fn persist(&self, record: &CallRecord) -> Result<(), SinkError>;
}

const MAX_ATTEMPTS: u32 = 5;
const BASE_DELAY: Duration = Duration::from_millis(500);

/// Persist a record in the background. Returns immediately.
pub fn spawn_persist(sink: Arc<dyn CallLogSink>, record: CallRecord) {
    tokio::spawn(async move {
        persist_with_retry(sink.as_ref(), &record).await;
    });
}

/// Retry loop behind [`spawn_persist`].
pub async fn persist_with_retry(sink: &dyn CallLogSink, record: &CallRecord) {
    for attempt in 0..MAX_ATTEMPTS {
        match sink.persist(record).await {
            Ok(()) => {
                debug!("persisted call record {}", record.call_id);
                return;
            }
            Err(e) => {
                let delay = backoff_delay(attempt);
                warn!(
                    "persist attempt {} for call {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    record.call_id,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
    error!(
        "giving up on call record {} after {} attempts",
        record.call_id, MAX_ATTEMPTS
    );
}

/// Exponential backoff with up to 20% jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let base = BASE_DELAY.as_millis() as u64 * 2u64.saturating_pow(attempt);
    let jitter = rand::thread_rng().gen_range(0..=base / 5);
    Duration::from_millis(base + jitter)
}

/// In-memory sink keyed by call id. Used in tests and local development;
/// last write wins, so re-persisting a call id stays one logical record.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<HashMap<Uuid, CallRecord>>,
    /// Number of persist calls to reject before accepting, for retry tests.
    failures_remaining: Mutex<u32>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(failures: u32) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            failures_remaining: Mutex::new(failures),
        }
    }

    pub fn records(&self) -> Vec<CallRecord> {
        self.records
            .lock()
            .expect("sink lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn get(&self, call_id: Uuid) -> Option<CallRecord> {
        self.records
            .lock()
            .expect("sink lock poisoned")
            .get(&call_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("sink lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CallLogSink for MemorySink {
    async fn persist(&self, record: &CallRecord) -> Result<(), SinkError> {
        {
            let mut failures = self.failures_remaining.lock().expect("sink lock poisoned");
            if *failures > 0 {
                *failures -= 1;
                return Err(SinkError("injected failure".into()));
            }
        }
        self.records
            .lock()
            .expect("sink lock poisoned")
            .insert(record.call_id, record.clone());
        Ok(())
    }
}
