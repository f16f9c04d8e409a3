//! Per-provider circuit breakers.
//!
//! # States
//! - Closed: requests pass through, consecutive failures are counted
//! - Open: the provider receives no traffic until the reset timeout elapses
//! - HalfOpen: exactly one probe is allowed across all concurrent calls
//!
//! Transitions are evaluated lazily at admission time; there is no background
//! sweeper. Breaker entries are shared by every concurrent call session, so
//! the registry takes a shared read on its map and each entry carries its own
//! lock, so unrelated providers never serialize on each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

/// Breaker state, as exposed on the ops surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Thresholds shared by every breaker entry.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive countable failures that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit waits before permitting a probe.
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Failure-tracking state machine for one provider.
///
/// All concurrent call sessions share one instance per provider id.
#[derive(Debug)]
pub struct ProviderBreaker {
    provider_id: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    probe_in_flight: AtomicBool,
}

/// Outcome of asking the breaker whether a provider may be invoked.
pub enum Admission {
    /// Circuit closed; invoke normally.
    Allowed,
    /// Circuit half-open and this caller won the single probe slot. The
    /// permit must be resolved with [`ProbePermit::succeed`] or
    /// [`ProbePermit::fail`]; dropping it unresolved (cancellation, or an
    /// inconclusive caller-input error) frees the slot without judging the
    /// provider.
    Probe(ProbePermit),
    /// Circuit open, or half-open with the probe slot already held. Skip
    /// this provider for the current attempt.
    Refused,
}

impl ProviderBreaker {
    fn new(provider_id: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            provider_id: provider_id.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            probe_in_flight: AtomicBool::new(false),
        }
    }

    /// Decide whether a caller may invoke this provider right now.
    ///
    /// An open circuit whose reset timeout has elapsed transitions to
    /// half-open here, on access.
    pub fn admit(self: &Arc<Self>) -> Admission {
        {
            let mut inner = self.lock_inner();
            match inner.state {
                CircuitState::Closed => return Admission::Allowed,
                CircuitState::Open => {
                    let elapsed = inner
                        .opened_at
                        .map(|t| t.elapsed() >= self.config.reset_timeout)
                        .unwrap_or(true);
                    if !elapsed {
                        return Admission::Refused;
                    }
                    debug!(
                        "breaker {}: reset timeout elapsed, open -> half_open",
                        self.provider_id
                    );
                    inner.state = CircuitState::HalfOpen;
                }
                CircuitState::HalfOpen => {}
            }
        }

        // Half-open: the probe slot is a strict single-writer resource.
        if self
            .probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Admission::Probe(ProbePermit {
                breaker: Arc::clone(self),
                resolved: false,
            })
        } else {
            Admission::Refused
        }
    }

    /// Record a successful non-probe invocation.
    pub fn record_success(&self) {
        let mut inner = self.lock_inner();
        if inner.state == CircuitState::Closed {
            inner.consecutive_failures = 0;
        }
        // A late success against an open circuit proves nothing about current
        // health; the circuit stays open until a probe passes.
    }

    /// Record a failed non-probe invocation.
    pub fn record_failure(&self) {
        let mut inner = self.lock_inner();
        if inner.state != CircuitState::Closed {
            return;
        }
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.config.failure_threshold {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(
                "breaker {}: {} consecutive failures, closed -> open",
                self.provider_id, inner.consecutive_failures
            );
        }
    }

    fn probe_finished(&self, success: bool) {
        {
            let mut inner = self.lock_inner();
            if success {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                debug!("breaker {}: probe succeeded, half_open -> closed", self.provider_id);
            } else {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                warn!("breaker {}: probe failed, half_open -> open", self.provider_id);
            }
        }
        self.probe_in_flight.store(false, Ordering::Release);
    }

    pub fn state(&self) -> CircuitState {
        self.lock_inner().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock_inner();
        BreakerSnapshot {
            provider_id: self.provider_id.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().expect("breaker state lock poisoned")
    }
}

/// Permission to run the single half-open probe. See [`Admission::Probe`].
pub struct ProbePermit {
    breaker: Arc<ProviderBreaker>,
    resolved: bool,
}

impl ProbePermit {
    /// Probe succeeded: close the circuit.
    pub fn succeed(mut self) {
        self.resolved = true;
        self.breaker.probe_finished(true);
    }

    /// Probe failed: reopen the circuit and restart its reset timer.
    pub fn fail(mut self) {
        self.resolved = true;
        self.breaker.probe_finished(false);
    }
}

impl Drop for ProbePermit {
    fn drop(&mut self) {
        if !self.resolved {
            // Probing future was cancelled mid-flight or the outcome was
            // inconclusive; free the slot without a state transition.
            self.breaker.probe_in_flight.store(false, Ordering::Release);
        }
    }
}

/// Point-in-time view of one breaker, for the ops surface.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub provider_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

/// Shared map of breaker entries, one per provider id.
///
/// Entries are created on demand and live for the process lifetime. Breaker
/// scope is global across tenants: true provider health is global, and a
/// per-tenant split is a deliberate later refinement.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    entries: RwLock<HashMap<String, Arc<ProviderBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the breaker for a provider, creating it on first use.
    pub fn breaker(&self, provider_id: &str) -> Arc<ProviderBreaker> {
        {
            let entries = self.entries.read().expect("breaker registry lock poisoned");
            if let Some(entry) = entries.get(provider_id) {
                return Arc::clone(entry);
            }
        }
        let mut entries = self.entries.write().expect("breaker registry lock poisoned");
        Arc::clone(
            entries
                .entry(provider_id.to_string())
                .or_insert_with(|| Arc::new(ProviderBreaker::new(provider_id, self.config))),
        )
    }

    /// Snapshots of every known breaker, sorted by provider id.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let entries = self.entries.read().expect("breaker registry lock poisoned");
        let mut snapshots: Vec<BreakerSnapshot> =
            entries.values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(20),
        }
    }

    fn breaker(config: BreakerConfig) -> Arc<ProviderBreaker> {
        Arc::new(ProviderBreaker::new("stt-alpha", config))
    }

    #[test]
    fn test_threshold_minus_one_stays_closed() {
        let b = breaker(BreakerConfig::default());
        for _ in 0..4 {
            b.record_failure();
        }
        assert_eq!(b.state(), CircuitState::Closed);
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let b = breaker(BreakerConfig::default());
        for _ in 0..4 {
            b.record_failure();
        }
        b.record_success();
        for _ in 0..4 {
            b.record_failure();
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_refuses_until_reset_timeout() {
        let b = breaker(fast_config());
        for _ in 0..3 {
            b.record_failure();
        }
        assert!(matches!(b.admit(), Admission::Refused));

        std::thread::sleep(Duration::from_millis(25));
        // First caller after the timeout becomes the probe.
        assert!(matches!(b.admit(), Admission::Probe(_)));
    }

    #[test]
    fn test_single_probe_slot() {
        let b = breaker(fast_config());
        for _ in 0..3 {
            b.record_failure();
        }
        std::thread::sleep(Duration::from_millis(25));

        let first = b.admit();
        let Admission::Probe(permit) = first else {
            panic!("expected probe admission");
        };
        // Everyone else is refused while the probe is in flight.
        for _ in 0..9 {
            assert!(matches!(b.admit(), Admission::Refused));
        }
        permit.succeed();
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(matches!(b.admit(), Admission::Allowed));
    }

    #[test]
    fn test_failed_probe_reopens_and_restarts_timer() {
        let b = breaker(fast_config());
        for _ in 0..3 {
            b.record_failure();
        }
        std::thread::sleep(Duration::from_millis(25));

        let Admission::Probe(permit) = b.admit() else {
            panic!("expected probe admission");
        };
        permit.fail();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(matches!(b.admit(), Admission::Refused));

        std::thread::sleep(Duration::from_millis(25));
        assert!(matches!(b.admit(), Admission::Probe(_)));
    }

    #[test]
    fn test_dropped_permit_frees_slot_without_transition() {
        let b = breaker(fast_config());
        for _ in 0..3 {
            b.record_failure();
        }
        std::thread::sleep(Duration::from_millis(25));

        {
            let Admission::Probe(_permit) = b.admit() else {
                panic!("expected probe admission");
            };
            // Cancelled mid-flight: permit drops unresolved.
        }
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(matches!(b.admit(), Admission::Probe(_)));
    }

    #[test]
    fn test_late_results_do_not_move_open_circuit() {
        let b = breaker(fast_config());
        for _ in 0..3 {
            b.record_failure();
        }
        b.record_success();
        assert_eq!(b.state(), CircuitState::Open);
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn test_registry_one_entry_per_provider() {
        let registry = BreakerRegistry::new(BreakerConfig::default());
        let a = registry.breaker("stt-alpha");
        let b = registry.breaker("stt-alpha");
        assert!(Arc::ptr_eq(&a, &b));
        registry.breaker("stt-beta");
        assert_eq!(registry.snapshots().len(), 2);
    }

    #[test]
    fn test_concurrent_admits_yield_one_probe() {
        let b = breaker(fast_config());
        for _ in 0..3 {
            b.record_failure();
        }
        std::thread::sleep(Duration::from_millis(25));

        let probes = std::sync::Mutex::new(Vec::new());
        let refused = std::sync::atomic::AtomicU32::new(0);
        std::thread::scope(|scope| {
            for _ in 0..10 {
                scope.spawn(|| match b.admit() {
                    Admission::Probe(permit) => probes.lock().unwrap().push(permit),
                    Admission::Refused => {
                        refused.fetch_add(1, Ordering::SeqCst);
                    }
                    Admission::Allowed => panic!("half-open breaker admitted without probe"),
                });
            }
        });
        assert_eq!(probes.lock().unwrap().len(), 1);
        assert_eq!(refused.load(Ordering::SeqCst), 9);
    }
}
