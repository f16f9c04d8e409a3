//! Capability provider abstraction.
//!
//! This module provides a trait-based abstraction over AI capability vendors
//! (speech transcription, response generation, speech synthesis). Core
//! failover and breaker logic depends only on the [`ProviderClient`] contract,
//! never on a specific vendor, which also makes test doubles trivial.

mod error;
pub mod http;
mod registry;

pub use error::{classify_http_status, from_http_response, ProviderError, ProviderErrorKind};
pub use registry::ProviderRegistry;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One of the three AI capabilities a conversational turn consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Transcription,
    Generation,
    Synthesis,
}

impl Capability {
    /// Every capability, in turn-pipeline order.
    pub const ALL: [Capability; 3] = [
        Capability::Transcription,
        Capability::Generation,
        Capability::Synthesis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transcription => "transcription",
            Self::Generation => "generation",
            Self::Synthesis => "synthesis",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audio handed across the provider boundary.
///
/// Transport and codec framing are the telephony layer's concern; by the time
/// audio reaches this crate it is opaque encoded bytes plus a duration used
/// for cost accounting.
#[derive(Debug, Clone, Default)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
    pub duration: Duration,
}

impl AudioClip {
    pub fn new(bytes: Vec<u8>, duration: Duration) -> Self {
        Self { bytes, duration }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Role of one exchange in the conversation so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    Caller,
    Agent,
}

/// One prior exchange handed to a generation provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    pub role: Role,
    pub text: String,
}

impl Exchange {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }
}

/// Conversation context for a generation call. Prompt construction happens
/// upstream; this carries the turns verbatim.
#[derive(Debug, Clone, Default)]
pub struct GenerationContext {
    pub exchanges: Vec<Exchange>,
}

impl GenerationContext {
    pub fn push(&mut self, role: Role, text: impl Into<String>) {
        self.exchanges.push(Exchange::new(role, text));
    }
}

/// Input to a provider invocation, one variant per capability.
#[derive(Debug, Clone)]
pub enum ProviderPayload {
    Transcribe(AudioClip),
    Generate(GenerationContext),
    Synthesize(String),
}

impl ProviderPayload {
    /// The capability this payload is routed to.
    pub fn capability(&self) -> Capability {
        match self {
            Self::Transcribe(_) => Capability::Transcription,
            Self::Generate(_) => Capability::Generation,
            Self::Synthesize(_) => Capability::Synthesis,
        }
    }
}

/// Output of a successful provider invocation.
#[derive(Debug, Clone)]
pub enum ProviderOutput {
    Transcript { text: String, confidence: f32 },
    Reply { text: String },
    Audio(AudioClip),
}

/// Usage a provider reports for one invocation. The cost model maps this
/// to USD; fields irrelevant to a capability stay zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub audio_seconds: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub characters: u64,
}

impl Usage {
    pub fn for_audio(seconds: f64) -> Self {
        Self {
            audio_seconds: seconds,
            ..Self::default()
        }
    }

    pub fn for_tokens(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ..Self::default()
        }
    }

    pub fn for_characters(characters: u64) -> Self {
        Self {
            characters,
            ..Self::default()
        }
    }
}

/// Successful invocation result: the output plus reported usage.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub output: ProviderOutput,
    pub usage: Usage,
}

/// Maps reported usage to USD. Rates come from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum CostModel {
    /// Billed per minute of audio processed (typical for transcription).
    PerAudioMinute { usd_per_minute: f64 },
    /// Billed per million input/output tokens (typical for generation).
    PerMillionTokens { input_usd: f64, output_usd: f64 },
    /// Billed per thousand characters synthesized (typical for synthesis).
    PerThousandCharacters { usd: f64 },
    /// Flat rate per invocation.
    Flat { usd_per_call: f64 },
}

impl CostModel {
    /// Compute the USD cost of one invocation from its reported usage.
    pub fn cost(&self, usage: &Usage) -> f64 {
        match self {
            Self::PerAudioMinute { usd_per_minute } => usage.audio_seconds / 60.0 * usd_per_minute,
            Self::PerMillionTokens {
                input_usd,
                output_usd,
            } => {
                (usage.input_tokens as f64 / 1_000_000.0) * input_usd
                    + (usage.output_tokens as f64 / 1_000_000.0) * output_usd
            }
            Self::PerThousandCharacters { usd } => usage.characters as f64 / 1_000.0 * usd,
            Self::Flat { usd_per_call } => *usd_per_call,
        }
    }
}

/// Contract every vendor adapter implements, one instance per vendor per
/// capability. Each call is stateless, cancellable by dropping the future,
/// and bounded by the router's invoke timeout.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn invoke(&self, payload: ProviderPayload) -> Result<ProviderResponse, ProviderError>;
}

/// One configured provider. Immutable at runtime; health lives in the
/// breaker registry, keyed by `id`.
#[derive(Clone)]
pub struct Provider {
    pub id: String,
    pub capability: Capability,
    /// Lower rank is tried first.
    pub priority: u32,
    pub invoke_timeout: Duration,
    pub cost: CostModel,
    pub client: Arc<dyn ProviderClient>,
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("id", &self.id)
            .field("capability", &self.capability)
            .field("priority", &self.priority)
            .field("invoke_timeout", &self.invoke_timeout)
            .field("cost", &self.cost)
            .finish_non_exhaustive()
    }
}
