//! Call sessions and the engine that hosts them.
//!
//! A [`CallSession`] is the live execution context for one phone call, from
//! answer to termination. Each conversational turn runs the pipeline
//! transcribe → generate → synthesize → speak through the failover router.
//! The [`CallEngine`] owns the shared pieces (registry, breakers, router,
//! sink) and tracks live sessions so the external admission gate can read
//! the current load.
//!
//! ## Session states
//!
//! ```text
//! initializing ──► active ──► completed        (hangup / objective reached)
//!                    │
//!                    ▼
//!                degrading ──► failed          (capability exhausted)
//! ```
//!
//! `failed` and `completed` are terminal; operations against a terminal
//! session are no-ops, which is what makes late provider responses after a
//! hangup harmless.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::breaker::{BreakerRegistry, BreakerSnapshot};
use crate::config::EngineConfig;
use crate::degrade::{DegradationController, DegradationEvent, DegradationReason};
use crate::ledger::CostLedger;
use crate::provider::{
    AudioClip, Capability, Exchange, GenerationContext, ProviderOutput, ProviderPayload,
    ProviderRegistry, Role,
};
use crate::router::{FailoverRouter, RouteError};
use crate::sink::{spawn_persist, CallLogSink, CallRecord};
use crate::telephony::{TelephonyControl, Utterance};

/// Lifecycle state of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    Active,
    Degrading,
    Failed,
    Completed,
}

impl SessionState {
    /// Terminal states cannot be left.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Completed)
    }
}

/// What one conversational turn resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// A reply was spoken to the caller (possibly via the native
    /// announcement fallback for this one turn).
    Completed,
    /// The caller's input was unusable for this turn; nothing was spoken
    /// and no provider was demoted.
    Skipped,
    /// The session ended during the turn, in the given terminal state.
    Ended(SessionState),
}

/// Decision produced inside the cancellable part of the turn pipeline.
/// Degradation actions run outside the hangup race so they cannot be
/// abandoned halfway.
enum PipelineStep {
    Spoke,
    Skip,
    TurnFallback {
        reply: String,
        reason: DegradationReason,
    },
    Terminate {
        capability: Capability,
        reason: DegradationReason,
    },
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    /// Last successful provider per capability, tried first on the next turn.
    sticky: HashMap<Capability, String>,
    /// Conversation so far, handed verbatim to generation providers.
    history: Vec<Exchange>,
    /// Consecutive synthesis exhaustions; two in a row escalate to full
    /// termination instead of limping along silently broken.
    synthesis_strikes: u32,
    events: Vec<DegradationEvent>,
}

/// The live execution context for one phone call.
pub struct CallSession {
    call_id: Uuid,
    tenant_id: String,
    transfer_number: Option<String>,
    turn_deadline: Duration,
    router: Arc<FailoverRouter>,
    degrade: Arc<DegradationController>,
    telephony: Arc<dyn TelephonyControl>,
    sink: Arc<dyn CallLogSink>,
    ledger: CostLedger,
    hangup: Notify,
    inner: Mutex<SessionInner>,
    engine: Weak<CallEngine>,
}

impl CallSession {
    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn state(&self) -> SessionState {
        self.lock_inner().state
    }

    /// Point-in-time cost breakdown for this call.
    pub fn cost(&self) -> crate::ledger::CostBreakdown {
        self.ledger.snapshot()
    }

    pub fn degradation_events(&self) -> Vec<DegradationEvent> {
        self.lock_inner().events.clone()
    }

    /// Telephony boundary signals that call media is established.
    pub fn media_established(&self) {
        let mut inner = self.lock_inner();
        if inner.state == SessionState::Initializing {
            inner.state = SessionState::Active;
            debug!("call {}: media established", self.call_id);
        }
    }

    /// Run one conversational turn: transcribe the caller's audio, generate
    /// a reply, synthesize it, and speak it.
    ///
    /// The provider pipeline races against caller hangup; if the caller
    /// hangs up mid-flight the in-flight provider future is dropped and its
    /// late result touches neither the ledger nor any breaker.
    pub async fn process_turn(&self, audio: AudioClip) -> TurnOutcome {
        {
            let inner = self.lock_inner();
            match inner.state {
                SessionState::Active => {}
                SessionState::Initializing => {
                    warn!("call {}: turn before media established, ignoring", self.call_id);
                    return TurnOutcome::Skipped;
                }
                state => return TurnOutcome::Ended(state),
            }
        }

        let step = tokio::select! {
            _ = self.hangup.notified() => {
                debug!("call {}: hangup interrupted in-flight turn", self.call_id);
                return TurnOutcome::Ended(SessionState::Completed);
            }
            step = self.run_pipeline(audio) => step,
        };

        match step {
            PipelineStep::Spoke => TurnOutcome::Completed,
            PipelineStep::Skip => TurnOutcome::Skipped,
            PipelineStep::TurnFallback { reply, reason } => {
                if self.state().is_terminal() {
                    return TurnOutcome::Ended(self.state());
                }
                let event = self
                    .degrade
                    .degrade_turn(self.call_id, &reply, reason, self.telephony.as_ref())
                    .await;
                self.lock_inner().events.push(event);
                TurnOutcome::Completed
            }
            PipelineStep::Terminate { capability, reason } => {
                self.terminate_degraded(capability, reason).await
            }
        }
    }

    /// Caller-side hangup. Applies immediately: the session becomes
    /// `completed`, any in-flight turn is cancelled, and the final ledger is
    /// persisted. A no-op if the session is already degrading or terminal.
    pub fn caller_hangup(&self) {
        let record = {
            let mut inner = self.lock_inner();
            match inner.state {
                SessionState::Initializing | SessionState::Active => {
                    inner.state = SessionState::Completed;
                    inner.ended_at = Some(Utc::now());
                    self.record_locked(&inner)
                }
                _ => return,
            }
        };
        info!("call {}: caller hung up", self.call_id);
        self.hangup.notify_one();
        self.finish(record);
    }

    /// Conversation objective reached: end the call politely.
    pub async fn complete(&self) {
        let record = {
            let mut inner = self.lock_inner();
            match inner.state {
                SessionState::Initializing | SessionState::Active => {
                    inner.state = SessionState::Completed;
                    inner.ended_at = Some(Utc::now());
                    self.record_locked(&inner)
                }
                _ => return,
            }
        };
        info!("call {}: completed", self.call_id);
        if let Err(e) = self.telephony.hangup().await {
            warn!("call {}: courtesy hangup failed: {}", self.call_id, e);
        }
        self.finish(record);
    }

    async fn run_pipeline(&self, audio: AudioClip) -> PipelineStep {
        let deadline = Instant::now() + self.turn_deadline;

        // Transcription
        let transcript = match self
            .route(Capability::Transcription, ProviderPayload::Transcribe(audio), deadline)
            .await
        {
            Ok(ProviderOutput::Transcript { text, .. }) => text,
            Ok(_) => {
                warn!("call {}: transcription returned unexpected output", self.call_id);
                return PipelineStep::Skip;
            }
            Err(RouteError::CallerInput { .. }) => {
                debug!("call {}: unusable caller audio, skipping turn", self.call_id);
                return PipelineStep::Skip;
            }
            Err(err) => {
                return PipelineStep::Terminate {
                    capability: Capability::Transcription,
                    reason: degradation_reason(&err),
                }
            }
        };

        // Generation, over the conversation so far
        let context = {
            let mut inner = self.lock_inner();
            inner.history.push(Exchange::new(Role::Caller, transcript));
            GenerationContext {
                exchanges: inner.history.clone(),
            }
        };
        let reply = match self
            .route(Capability::Generation, ProviderPayload::Generate(context), deadline)
            .await
        {
            Ok(ProviderOutput::Reply { text }) => text,
            Ok(_) => {
                warn!("call {}: generation returned unexpected output", self.call_id);
                return PipelineStep::Skip;
            }
            Err(RouteError::CallerInput { .. }) => return PipelineStep::Skip,
            Err(err) => {
                return PipelineStep::Terminate {
                    capability: Capability::Generation,
                    reason: degradation_reason(&err),
                }
            }
        };
        self.lock_inner()
            .history
            .push(Exchange::new(Role::Agent, reply.clone()));

        // Synthesis
        match self
            .route(
                Capability::Synthesis,
                ProviderPayload::Synthesize(reply.clone()),
                deadline,
            )
            .await
        {
            Ok(ProviderOutput::Audio(clip)) => {
                self.lock_inner().synthesis_strikes = 0;
                if let Err(e) = self.telephony.speak(Utterance::Audio(clip)).await {
                    warn!("call {}: playback failed: {}", self.call_id, e);
                }
                PipelineStep::Spoke
            }
            Ok(_) => {
                warn!("call {}: synthesis returned unexpected output", self.call_id);
                PipelineStep::Skip
            }
            Err(RouteError::CallerInput { .. }) => PipelineStep::Skip,
            Err(err) => {
                let reason = degradation_reason(&err);
                let strikes = {
                    let mut inner = self.lock_inner();
                    inner.synthesis_strikes += 1;
                    inner.synthesis_strikes
                };
                if strikes >= 2 || matches!(err, RouteError::NoCandidates { .. }) {
                    PipelineStep::Terminate {
                        capability: Capability::Synthesis,
                        reason,
                    }
                } else {
                    PipelineStep::TurnFallback { reply, reason }
                }
            }
        }
    }

    /// Route one capability invocation, feeding the call's sticky provider
    /// hint in and the winner back out.
    async fn route(
        &self,
        capability: Capability,
        payload: ProviderPayload,
        deadline: Instant,
    ) -> Result<ProviderOutput, RouteError> {
        let sticky = self.lock_inner().sticky.get(&capability).cloned();
        let routed = self
            .router
            .invoke(payload, sticky.as_deref(), &self.ledger, deadline)
            .await?;
        self.lock_inner()
            .sticky
            .insert(capability, routed.provider_id);
        Ok(routed.output)
    }

    async fn terminate_degraded(
        &self,
        capability: Capability,
        reason: DegradationReason,
    ) -> TurnOutcome {
        {
            let mut inner = self.lock_inner();
            if inner.state != SessionState::Active {
                return TurnOutcome::Ended(inner.state);
            }
            inner.state = SessionState::Degrading;
        }

        let event = self
            .degrade
            .terminate_call(
                self.call_id,
                capability,
                reason,
                self.telephony.as_ref(),
                self.transfer_number.as_deref(),
                &self.ledger,
            )
            .await;

        let record = {
            let mut inner = self.lock_inner();
            inner.events.push(event);
            inner.state = SessionState::Failed;
            inner.ended_at = Some(Utc::now());
            self.record_locked(&inner)
        };
        self.finish(record);
        TurnOutcome::Ended(SessionState::Failed)
    }

    fn record_locked(&self, inner: &SessionInner) -> CallRecord {
        CallRecord {
            call_id: self.call_id,
            tenant_id: self.tenant_id.clone(),
            final_state: inner.state,
            cost: self.ledger.finalize(),
            degradation_events: inner.events.clone(),
            started_at: inner.started_at,
            ended_at: inner.ended_at.unwrap_or_else(Utc::now),
        }
    }

    /// Fire-and-forget persistence and engine deregistration. Never blocks
    /// or fails the live call path.
    fn finish(&self, record: CallRecord) {
        spawn_persist(Arc::clone(&self.sink), record);
        if let Some(engine) = self.engine.upgrade() {
            let call_id = self.call_id;
            tokio::spawn(async move {
                engine.remove_session(call_id).await;
            });
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().expect("session state lock poisoned")
    }
}

fn degradation_reason(err: &RouteError) -> DegradationReason {
    match err {
        RouteError::DeadlineExceeded { .. } => DegradationReason::DeadlineExceeded,
        RouteError::NoCandidates { .. } => DegradationReason::Misconfigured,
        _ => DegradationReason::Exhausted,
    }
}

/// Shared engine hosting every live call session.
pub struct CallEngine {
    router: Arc<FailoverRouter>,
    breakers: Arc<BreakerRegistry>,
    degrade: Arc<DegradationController>,
    sink: Arc<dyn CallLogSink>,
    turn_deadline: Duration,
    transfer_numbers: HashMap<String, String>,
    sessions: RwLock<HashMap<Uuid, Arc<CallSession>>>,
}

impl CallEngine {
    /// Assemble the engine from configuration, a built provider registry,
    /// and the deployment's log sink.
    pub fn new(
        config: &EngineConfig,
        registry: ProviderRegistry,
        sink: Arc<dyn CallLogSink>,
    ) -> Arc<Self> {
        let registry = Arc::new(registry);
        let breakers = Arc::new(BreakerRegistry::new(config.breaker_config()));
        let router = Arc::new(FailoverRouter::new(
            Arc::clone(&registry),
            Arc::clone(&breakers),
        ));
        let degrade = Arc::new(DegradationController::new(
            Arc::clone(&router),
            config.apology_message.clone(),
            config.turn_deadline(),
        ));
        Arc::new(Self {
            router,
            breakers,
            degrade,
            sink,
            turn_deadline: config.turn_deadline(),
            transfer_numbers: config
                .tenants
                .iter()
                .filter_map(|t| {
                    t.transfer_number
                        .clone()
                        .map(|n| (t.tenant_id.clone(), n))
                })
                .collect(),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Inbound-call notification from the telephony boundary: create and
    /// register a session and answer the call.
    pub async fn begin_call(
        self: &Arc<Self>,
        tenant_id: &str,
        telephony: Arc<dyn TelephonyControl>,
    ) -> Arc<CallSession> {
        let call_id = Uuid::new_v4();
        let session = Arc::new(CallSession {
            call_id,
            tenant_id: tenant_id.to_string(),
            transfer_number: self.transfer_numbers.get(tenant_id).cloned(),
            turn_deadline: self.turn_deadline,
            router: Arc::clone(&self.router),
            degrade: Arc::clone(&self.degrade),
            telephony: Arc::clone(&telephony),
            sink: Arc::clone(&self.sink),
            ledger: CostLedger::new(),
            hangup: Notify::new(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Initializing,
                started_at: Utc::now(),
                ended_at: None,
                sticky: HashMap::new(),
                history: Vec::new(),
                synthesis_strikes: 0,
                events: Vec::new(),
            }),
            engine: Arc::downgrade(self),
        });

        self.sessions
            .write()
            .await
            .insert(call_id, Arc::clone(&session));
        info!("call {}: session created for tenant {}", call_id, tenant_id);

        if let Err(e) = telephony.answer().await {
            warn!("call {}: answer command failed: {}", call_id, e);
        }
        session
    }

    /// Number of live sessions. The external admission gate reads this to
    /// reject new calls beyond the configured ceiling.
    pub async fn active_calls(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn session(&self, call_id: Uuid) -> Option<Arc<CallSession>> {
        self.sessions.read().await.get(&call_id).cloned()
    }

    pub(crate) async fn remove_session(&self, call_id: Uuid) {
        self.sessions.write().await.remove(&call_id);
        debug!("call {}: session removed", call_id);
    }

    /// Current breaker states, for the ops surface.
    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshots()
    }

    /// End every live call politely. Used on graceful shutdown.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<CallSession>> =
            self.sessions.read().await.values().cloned().collect();
        futures::future::join_all(sessions.iter().map(|s| s.complete())).await;
    }
}
