//! # voxgate
//!
//! Multi-provider resilience engine for live AI voice calls.
//!
//! Every phone conversation is routed through interchangeable capability
//! providers (speech transcription, response generation, speech synthesis),
//! failing over between them automatically, isolating unhealthy ones behind
//! circuit breakers, tracking spend per call, and degrading a call gracefully
//! (spoken apology + human transfer or hangup) when every provider for a
//! capability is exhausted.
//!
//! ## Architecture
//!
//! ```text
//!  telephony boundary ──► CallSession ──► FailoverRouter ──► ProviderClient
//!                            │                 │                (per vendor)
//!                            │                 ├── BreakerRegistry
//!                            │                 └── CostLedger
//!                            └── DegradationController ──► TelephonyControl
//! ```
//!
//! ## Turn flow
//! 1. Telephony boundary hands a committed caller utterance to the session
//! 2. The router transcribes, generates, and synthesizes it, consulting each
//!    provider's breaker and failing over invisibly on error
//! 3. The synthesized reply is spoken back through the telephony boundary
//! 4. If any capability runs out of providers, the degradation controller
//!    takes over: apology, transfer to a human, or courtesy hangup
//!
//! ## Modules
//! - `provider`: capability contract, registry, vendor HTTP adapters
//! - `breaker`: per-provider circuit breakers with single-probe half-open
//! - `router`: priority-ordered failover with stickiness and turn deadlines
//! - `ledger`: per-call cost accrual by capability
//! - `degrade`: caller-facing fallback policy
//! - `session`: call state machine and the engine hosting live calls

pub mod api;
pub mod breaker;
pub mod config;
pub mod degrade;
pub mod ledger;
pub mod provider;
pub mod router;
pub mod session;
pub mod sink;
pub mod telephony;

pub use config::EngineConfig;
pub use session::{CallEngine, CallSession, SessionState, TurnOutcome};
