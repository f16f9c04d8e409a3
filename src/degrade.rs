//! Caller-facing fallback when a capability runs out of providers.
//!
//! Whatever goes wrong upstream, the person on the phone only ever gets one
//! of two experiences: an invisible failover, or a spoken apology followed by
//! a transfer to a human (or a courtesy hangup). Raw errors never reach them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use crate::ledger::CostLedger;
use crate::provider::{Capability, ProviderOutput, ProviderPayload};
use crate::router::FailoverRouter;
use crate::telephony::{TelephonyControl, Utterance};

/// Why a degradation was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationReason {
    /// Every provider for the capability failed or was circuit-broken.
    Exhausted,
    /// The hard turn deadline expired before any candidate answered.
    DeadlineExceeded,
    /// The capability has no providers configured at all.
    Misconfigured,
}

/// The caller-facing action a degradation resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackAction {
    /// Spoke this turn through the telephony platform's native voice and
    /// kept the call going.
    Message,
    /// Handed the caller to the tenant's configured human destination.
    Transfer,
    /// No transfer destination (or the transfer itself failed); ended the
    /// call politely.
    Hangup,
}

/// One record per capability exhaustion, persisted with the call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradationEvent {
    pub call_id: Uuid,
    pub capability: Capability,
    pub reason: DegradationReason,
    pub fallback_action: FallbackAction,
    pub timestamp: DateTime<Utc>,
}

/// Executes the fallback decision policy against the telephony boundary.
pub struct DegradationController {
    router: Arc<FailoverRouter>,
    apology: String,
    apology_deadline: Duration,
}

impl DegradationController {
    pub fn new(router: Arc<FailoverRouter>, apology: String, apology_deadline: Duration) -> Self {
        Self {
            router,
            apology,
            apology_deadline,
        }
    }

    /// Full termination flow: apology, then transfer if the tenant has a
    /// destination, else hangup. Every telephony command here is best-effort;
    /// a failed transfer falls through to hangup and nothing escapes the
    /// session as an unhandled fault.
    pub async fn terminate_call(
        &self,
        call_id: Uuid,
        capability: Capability,
        reason: DegradationReason,
        telephony: &dyn TelephonyControl,
        transfer_number: Option<&str>,
        ledger: &CostLedger,
    ) -> DegradationEvent {
        error!(
            "call {}: degrading, {} {:?}",
            call_id, capability, reason
        );

        self.speak_apology(capability, telephony, ledger).await;

        let fallback_action = match transfer_number {
            Some(number) => match telephony.transfer(number).await {
                Ok(()) => FallbackAction::Transfer,
                Err(e) => {
                    warn!(
                        "call {}: transfer to {} failed ({}), hanging up",
                        call_id, number, e
                    );
                    self.hangup(call_id, telephony).await;
                    FallbackAction::Hangup
                }
            },
            None => {
                self.hangup(call_id, telephony).await;
                FallbackAction::Hangup
            }
        };

        DegradationEvent {
            call_id,
            capability,
            reason,
            fallback_action,
            timestamp: Utc::now(),
        }
    }

    /// Single-turn degradation: synthesis is down but the rest of the call is
    /// healthy, so this one utterance goes out through the platform's native
    /// announcement voice and the session stays active.
    pub async fn degrade_turn(
        &self,
        call_id: Uuid,
        reply_text: &str,
        reason: DegradationReason,
        telephony: &dyn TelephonyControl,
    ) -> DegradationEvent {
        warn!(
            "call {}: synthesis unavailable for this turn, using native announcement",
            call_id
        );
        if let Err(e) = telephony
            .speak(Utterance::Text(reply_text.to_string()))
            .await
        {
            warn!("call {}: native announcement failed: {}", call_id, e);
        }
        DegradationEvent {
            call_id,
            capability: Capability::Synthesis,
            reason,
            fallback_action: FallbackAction::Message,
            timestamp: Utc::now(),
        }
    }

    /// Try a healthy synthesis provider for the apology; fall back to the
    /// telephony platform's native announcement when synthesis is gone too.
    async fn speak_apology(
        &self,
        capability: Capability,
        telephony: &dyn TelephonyControl,
        ledger: &CostLedger,
    ) {
        if capability != Capability::Synthesis {
            let deadline = Instant::now() + self.apology_deadline;
            let routed = self
                .router
                .invoke(
                    ProviderPayload::Synthesize(self.apology.clone()),
                    None,
                    ledger,
                    deadline,
                )
                .await;
            if let Ok(routed) = routed {
                if let ProviderOutput::Audio(clip) = routed.output {
                    if let Err(e) = telephony.speak(Utterance::Audio(clip)).await {
                        warn!("apology playback failed: {}", e);
                    }
                    return;
                }
            }
        }
        if let Err(e) = telephony
            .speak(Utterance::Text(self.apology.clone()))
            .await
        {
            warn!("native apology announcement failed: {}", e);
        }
    }

    async fn hangup(&self, call_id: Uuid, telephony: &dyn TelephonyControl) {
        if let Err(e) = telephony.hangup().await {
            warn!("call {}: hangup command failed: {}", call_id, e);
        }
    }
}
