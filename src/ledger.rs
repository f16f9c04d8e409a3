//! Per-call cost accounting.
//!
//! Each call session owns one ledger, so there is no cross-call contention.
//! Subtotals and the total are stored as integer micro-dollars and updated
//! under one lock, which keeps the invariant `total == Σ subtotals` exact at
//! every observation point, with no float drift between the two.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::provider::Capability;

const MICROS_PER_USD: f64 = 1_000_000.0;

#[derive(Debug, Default)]
struct LedgerInner {
    by_capability: HashMap<Capability, u64>,
    total_micros: u64,
}

/// Thread-safe accumulator of provider costs for one call.
#[derive(Debug, Default)]
pub struct CostLedger {
    inner: Mutex<LedgerInner>,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the cost of one successful invocation to a capability's subtotal
    /// and the call total, atomically with respect to readers.
    pub fn record(&self, capability: Capability, usd: f64) {
        let micros = (usd.max(0.0) * MICROS_PER_USD).round() as u64;
        let mut inner = self.lock_inner();
        *inner.by_capability.entry(capability).or_insert(0) += micros;
        inner.total_micros += micros;
    }

    /// Point-in-time breakdown, used for periodic persistence.
    pub fn snapshot(&self) -> CostBreakdown {
        let inner = self.lock_inner();
        CostBreakdown {
            by_capability: inner
                .by_capability
                .iter()
                .map(|(capability, micros)| (*capability, *micros as f64 / MICROS_PER_USD))
                .collect(),
            total_usd: inner.total_micros as f64 / MICROS_PER_USD,
        }
    }

    /// Final breakdown at call end.
    pub fn finalize(&self) -> CostBreakdown {
        self.snapshot()
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, LedgerInner> {
        self.inner.lock().expect("cost ledger lock poisoned")
    }
}

/// Cost totals for one call, keyed by capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub by_capability: HashMap<Capability, f64>,
    pub total_usd: f64,
}

impl CostBreakdown {
    /// Sum of the capability subtotals. Always equals `total_usd`.
    pub fn subtotal_sum(&self) -> f64 {
        self.by_capability.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_record_updates_subtotal_and_total() {
        let ledger = CostLedger::new();
        ledger.record(Capability::Transcription, 0.012);
        ledger.record(Capability::Generation, 0.030);
        ledger.record(Capability::Transcription, 0.008);

        let breakdown = ledger.snapshot();
        assert!((breakdown.by_capability[&Capability::Transcription] - 0.020).abs() < 1e-9);
        assert!((breakdown.by_capability[&Capability::Generation] - 0.030).abs() < 1e-9);
        assert!((breakdown.total_usd - 0.050).abs() < 1e-9);
    }

    #[test]
    fn test_total_equals_subtotal_sum() {
        let ledger = CostLedger::new();
        for i in 0..100 {
            let capability = Capability::ALL[i % 3];
            ledger.record(capability, 0.001 * (i as f64 + 1.0));
        }
        let breakdown = ledger.snapshot();
        assert!((breakdown.total_usd - breakdown.subtotal_sum()).abs() < 1e-9);
    }

    #[test]
    fn test_negative_costs_are_clamped() {
        let ledger = CostLedger::new();
        ledger.record(Capability::Synthesis, -1.0);
        assert_eq!(ledger.snapshot().total_usd, 0.0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_records_stay_consistent() {
        let ledger = Arc::new(CostLedger::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                for _ in 0..250 {
                    ledger.record(Capability::Generation, 0.001);
                    ledger.record(Capability::Synthesis, 0.002);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let breakdown = ledger.finalize();
        assert!((breakdown.total_usd - 6.0).abs() < 1e-6);
        assert!((breakdown.total_usd - breakdown.subtotal_sum()).abs() < 1e-9);
    }
}
