//! Failover routing across a capability's providers.
//!
//! The router walks candidates in configured priority order, consulting each
//! provider's breaker, bounding every attempt by both the provider's invoke
//! timeout and the hard turn deadline, and recording cost on success. A
//! caller that fails over is invisible to the person on the phone; only when
//! every candidate is gone does the session degrade.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::breaker::{Admission, BreakerRegistry};
use crate::ledger::CostLedger;
use crate::provider::{
    Capability, ProviderError, ProviderOutput, ProviderPayload, ProviderRegistry,
};

/// Successful routing result: the provider's output and which provider
/// produced it (fed back as the session's sticky hint for the next turn).
#[derive(Debug)]
pub struct RoutedResponse {
    pub output: ProviderOutput,
    pub provider_id: String,
}

/// Terminal routing outcomes. `Exhausted` and `DeadlineExceeded` both hand
/// the call to the degradation controller; `NoCandidates` is a configuration
/// fault, distinct from exhaustion.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("all providers exhausted for {capability}")]
    Exhausted { capability: Capability },

    #[error("turn deadline exceeded while routing {capability}")]
    DeadlineExceeded { capability: Capability },

    #[error("no providers configured for {capability}")]
    NoCandidates { capability: Capability },

    #[error("caller input rejected by {provider_id}: {source}")]
    CallerInput {
        provider_id: String,
        #[source]
        source: ProviderError,
    },
}

/// Routes one capability invocation through the candidate providers.
pub struct FailoverRouter {
    registry: Arc<ProviderRegistry>,
    breakers: Arc<BreakerRegistry>,
}

impl FailoverRouter {
    pub fn new(registry: Arc<ProviderRegistry>, breakers: Arc<BreakerRegistry>) -> Self {
        Self { registry, breakers }
    }

    /// Try candidates in order until one succeeds or all are exhausted.
    ///
    /// `sticky` is the call's last successful provider for this capability;
    /// it is tried first when its breaker still admits it, which bounds
    /// oscillation between providers without any dynamic quality ranking.
    /// `deadline` is the hard bound for the whole failover attempt; crossing
    /// it is handed off exactly like exhaustion, even if a slower candidate
    /// might eventually have succeeded.
    pub async fn invoke(
        &self,
        payload: ProviderPayload,
        sticky: Option<&str>,
        ledger: &CostLedger,
        deadline: Instant,
    ) -> Result<RoutedResponse, RouteError> {
        let capability = payload.capability();
        let candidates = self.registry.candidates(capability);
        if candidates.is_empty() {
            error!("no providers configured for {}", capability);
            return Err(RouteError::NoCandidates { capability });
        }

        let sticky_first = sticky
            .and_then(|id| candidates.iter().find(|p| p.id == id))
            .into_iter();
        let rest = candidates
            .iter()
            .filter(|p| Some(p.id.as_str()) != sticky);

        for provider in sticky_first.chain(rest) {
            let now = Instant::now();
            if now >= deadline {
                warn!("turn deadline crossed while routing {}", capability);
                return Err(RouteError::DeadlineExceeded { capability });
            }

            let breaker = self.breakers.breaker(&provider.id);
            let permit = match breaker.admit() {
                Admission::Allowed => None,
                Admission::Probe(permit) => {
                    debug!("probing half-open provider {}", provider.id);
                    Some(permit)
                }
                Admission::Refused => {
                    debug!("skipping {} (breaker refused)", provider.id);
                    continue;
                }
            };

            // Bound the attempt by whichever cutoff comes first: the
            // provider's own invoke timeout or the turn deadline.
            let provider_cutoff = now + provider.invoke_timeout;
            let deadline_bound = deadline < provider_cutoff;
            let cutoff = if deadline_bound { deadline } else { provider_cutoff };

            let attempt = tokio::time::timeout_at(
                tokio::time::Instant::from_std(cutoff),
                provider.client.invoke(payload.clone()),
            )
            .await;

            match attempt {
                Ok(Ok(response)) => {
                    match permit {
                        Some(permit) => permit.succeed(),
                        None => breaker.record_success(),
                    }
                    let cost = provider.cost.cost(&response.usage);
                    ledger.record(capability, cost);
                    debug!(
                        "{} served {} (cost ${:.6})",
                        provider.id, capability, cost
                    );
                    return Ok(RoutedResponse {
                        output: response.output,
                        provider_id: provider.id.clone(),
                    });
                }
                Ok(Err(err)) if !err.counts_toward_breaker() => {
                    // The caller's own input is at fault; the provider is not
                    // demoted and trying the next candidate would not help.
                    // A held probe permit drops unresolved (inconclusive).
                    warn!("{} rejected caller input: {}", provider.id, err);
                    return Err(RouteError::CallerInput {
                        provider_id: provider.id.clone(),
                        source: err,
                    });
                }
                Ok(Err(err)) => {
                    if err.is_fatal_config() {
                        error!(
                            "{} failed with non-self-healing config error: {}",
                            provider.id, err
                        );
                    } else {
                        warn!("{} failed: {}, failing over", provider.id, err);
                    }
                    match permit {
                        Some(permit) => permit.fail(),
                        None => breaker.record_failure(),
                    }
                }
                Err(_elapsed) if deadline_bound => {
                    // The turn deadline cut this attempt short before the
                    // provider's own timeout; the provider is not charged.
                    warn!(
                        "turn deadline expired mid-attempt on {} for {}",
                        provider.id, capability
                    );
                    return Err(RouteError::DeadlineExceeded { capability });
                }
                Err(_elapsed) => {
                    warn!(
                        "{} timed out after {:?}, failing over",
                        provider.id, provider.invoke_timeout
                    );
                    match permit {
                        Some(permit) => permit.fail(),
                        None => breaker.record_failure(),
                    }
                }
            }
        }

        warn!("all providers exhausted for {}", capability);
        Err(RouteError::Exhausted { capability })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitState};
    use crate::provider::{
        AudioClip, CostModel, Provider, ProviderClient, ProviderResponse, Usage,
    };
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted provider: pops one result per invocation, counts calls.
    struct ScriptedClient {
        script: Mutex<VecDeque<Result<ProviderResponse, ProviderError>>>,
        calls: AtomicU32,
        delay: Duration,
    }

    impl ScriptedClient {
        fn new(script: Vec<Result<ProviderResponse, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
                delay: Duration::ZERO,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                calls: AtomicU32::new(0),
                delay,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn ok_transcript(text: &str) -> Result<ProviderResponse, ProviderError> {
        Ok(ProviderResponse {
            output: ProviderOutput::Transcript {
                text: text.to_string(),
                confidence: 0.9,
            },
            usage: Usage::for_audio(2.0),
        })
    }

    #[async_trait]
    impl ProviderClient for ScriptedClient {
        async fn invoke(
            &self,
            _payload: ProviderPayload,
        ) -> Result<ProviderResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| ok_transcript("fallthrough"))
        }
    }

    fn provider(id: &str, priority: u32, client: Arc<ScriptedClient>) -> Provider {
        Provider {
            id: id.to_string(),
            capability: Capability::Transcription,
            priority,
            invoke_timeout: Duration::from_millis(200),
            cost: CostModel::PerAudioMinute { usd_per_minute: 0.6 },
            client,
        }
    }

    fn router(providers: Vec<Provider>) -> (FailoverRouter, Arc<BreakerRegistry>) {
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        }));
        (
            FailoverRouter::new(
                Arc::new(ProviderRegistry::new(providers)),
                Arc::clone(&breakers),
            ),
            breakers,
        )
    }

    fn payload() -> ProviderPayload {
        ProviderPayload::Transcribe(AudioClip::new(vec![1, 2, 3], Duration::from_secs(2)))
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(12)
    }

    #[tokio::test]
    async fn test_open_provider_is_never_called_and_order_holds() {
        let a = ScriptedClient::new(vec![]);
        let b = ScriptedClient::new(vec![Err(ProviderError::server_error(500, "boom"))]);
        let c = ScriptedClient::new(vec![ok_transcript("hello")]);
        let (router, breakers) = router(vec![
            provider("a", 1, Arc::clone(&a)),
            provider("b", 2, Arc::clone(&b)),
            provider("c", 3, Arc::clone(&c)),
        ]);

        // Force A open.
        let breaker_a = breakers.breaker("a");
        breaker_a.record_failure();
        breaker_a.record_failure();
        assert_eq!(breaker_a.state(), CircuitState::Open);

        let ledger = CostLedger::new();
        let routed = router
            .invoke(payload(), None, &ledger, deadline())
            .await
            .unwrap();

        assert_eq!(routed.provider_id, "c");
        assert_eq!(a.calls(), 0);
        assert_eq!(b.calls(), 1);
        assert_eq!(c.calls(), 1);
        assert!(ledger.snapshot().total_usd > 0.0);
    }

    #[tokio::test]
    async fn test_all_failing_returns_exhausted_never_silent() {
        let a = ScriptedClient::new(vec![Err(ProviderError::timeout("t"))]);
        let b = ScriptedClient::new(vec![Err(ProviderError::rate_limited("r", None))]);
        let (router, _) = router(vec![
            provider("a", 1, Arc::clone(&a)),
            provider("b", 2, Arc::clone(&b)),
        ]);

        let ledger = CostLedger::new();
        let err = router
            .invoke(payload(), None, &ledger, deadline())
            .await
            .unwrap_err();

        assert!(matches!(err, RouteError::Exhausted { .. }));
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
        assert_eq!(ledger.snapshot().total_usd, 0.0);
    }

    #[tokio::test]
    async fn test_empty_candidates_is_distinct_fatal_error() {
        let (router, _) = router(vec![]);
        let ledger = CostLedger::new();
        let err = router
            .invoke(payload(), None, &ledger, deadline())
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::NoCandidates { .. }));
    }

    #[tokio::test]
    async fn test_caller_input_does_not_demote_or_fail_over() {
        let a = ScriptedClient::new(vec![Err(ProviderError::caller_input("empty audio"))]);
        let b = ScriptedClient::new(vec![]);
        let (router, breakers) = router(vec![
            provider("a", 1, Arc::clone(&a)),
            provider("b", 2, Arc::clone(&b)),
        ]);

        let ledger = CostLedger::new();
        let err = router
            .invoke(payload(), None, &ledger, deadline())
            .await
            .unwrap_err();

        assert!(matches!(err, RouteError::CallerInput { .. }));
        assert_eq!(b.calls(), 0);
        assert_eq!(breakers.breaker("a").state(), CircuitState::Closed);
        assert_eq!(breakers.breaker("a").snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_sticky_provider_tried_first() {
        let a = ScriptedClient::new(vec![]);
        let b = ScriptedClient::new(vec![ok_transcript("again")]);
        let (router, _) = router(vec![
            provider("a", 1, Arc::clone(&a)),
            provider("b", 2, Arc::clone(&b)),
        ]);

        let ledger = CostLedger::new();
        let routed = router
            .invoke(payload(), Some("b"), &ledger, deadline())
            .await
            .unwrap();

        assert_eq!(routed.provider_id, "b");
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test]
    async fn test_sticky_with_open_breaker_falls_back_to_priority_order() {
        let a = ScriptedClient::new(vec![ok_transcript("primary")]);
        let b = ScriptedClient::new(vec![]);
        let (router, breakers) = router(vec![
            provider("a", 1, Arc::clone(&a)),
            provider("b", 2, Arc::clone(&b)),
        ]);

        let breaker_b = breakers.breaker("b");
        breaker_b.record_failure();
        breaker_b.record_failure();

        let ledger = CostLedger::new();
        let routed = router
            .invoke(payload(), Some("b"), &ledger, deadline())
            .await
            .unwrap();

        assert_eq!(routed.provider_id, "a");
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn test_provider_timeout_counts_and_fails_over() {
        let a = ScriptedClient::slow(Duration::from_secs(5));
        let b = ScriptedClient::new(vec![ok_transcript("backup")]);
        let (router, breakers) = router(vec![
            provider("a", 1, Arc::clone(&a)),
            provider("b", 2, Arc::clone(&b)),
        ]);

        let ledger = CostLedger::new();
        let routed = router
            .invoke(payload(), None, &ledger, deadline())
            .await
            .unwrap();

        assert_eq!(routed.provider_id, "b");
        assert_eq!(breakers.breaker("a").snapshot().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_turn_deadline_beats_slow_candidates() {
        let a = ScriptedClient::slow(Duration::from_secs(5));
        let b = ScriptedClient::new(vec![ok_transcript("never reached")]);
        let (router, breakers) = router(vec![
            provider("a", 1, Arc::clone(&a)),
            provider("b", 2, Arc::clone(&b)),
        ]);

        let ledger = CostLedger::new();
        let tight = Instant::now() + Duration::from_millis(50);
        let err = router
            .invoke(payload(), None, &ledger, tight)
            .await
            .unwrap_err();

        assert!(matches!(err, RouteError::DeadlineExceeded { .. }));
        assert_eq!(b.calls(), 0);
        // The deadline cut the attempt short, so A is not charged a failure.
        assert_eq!(breakers.breaker("a").snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_breaker_opens_after_threshold_through_router() {
        let a = ScriptedClient::new(vec![
            Err(ProviderError::server_error(500, "x")),
            Err(ProviderError::server_error(500, "x")),
        ]);
        let b = ScriptedClient::new(vec![ok_transcript("b1"), ok_transcript("b2")]);
        let (router, breakers) = router(vec![
            provider("a", 1, Arc::clone(&a)),
            provider("b", 2, Arc::clone(&b)),
        ]);

        let ledger = CostLedger::new();
        router.invoke(payload(), None, &ledger, deadline()).await.unwrap();
        router.invoke(payload(), None, &ledger, deadline()).await.unwrap();
        assert_eq!(breakers.breaker("a").state(), CircuitState::Open);

        // Third turn: A is open and skipped without an invocation.
        router.invoke(payload(), None, &ledger, deadline()).await.unwrap();
        assert_eq!(a.calls(), 2);
    }
}
