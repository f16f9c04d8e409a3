//! OpenAI-compatible HTTP adapters, one per capability.
//!
//! These are the production implementations of [`ProviderClient`]. They do no
//! retrying of their own: failover, breaker accounting, and timeouts are the
//! router's job, so each adapter performs exactly one HTTP exchange and
//! classifies the outcome.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{
    from_http_response, AudioClip, Exchange, ProviderClient, ProviderError, ProviderPayload,
    ProviderResponse, Role, ProviderOutput, Usage,
};

/// Parse a Retry-After header if present (seconds form only).
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok().map(Duration::from_secs))
}

/// Map a reqwest transport error to the provider taxonomy.
fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::timeout(format!("request timeout: {}", err))
    } else if err.is_connect() {
        ProviderError::network(format!("connection failed: {}", err))
    } else {
        ProviderError::network(format!("request failed: {}", err))
    }
}

/// Read a non-success response into a classified error.
async fn response_error(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    from_http_response(status, &body, retry_after)
}

// ─────────────────────────────────────────────────────────────────────────────
// Transcription
// ─────────────────────────────────────────────────────────────────────────────

/// Speech-to-text over an OpenAI-compatible `/audio/transcriptions` endpoint.
pub struct HttpTranscriber {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpTranscriber {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
    #[serde(default)]
    confidence: Option<f32>,
}

#[async_trait]
impl ProviderClient for HttpTranscriber {
    async fn invoke(&self, payload: ProviderPayload) -> Result<ProviderResponse, ProviderError> {
        let clip = match payload {
            ProviderPayload::Transcribe(clip) => clip,
            other => {
                return Err(ProviderError::protocol(format!(
                    "transcriber received {} payload",
                    other.capability()
                )))
            }
        };
        if clip.is_empty() {
            return Err(ProviderError::caller_input("empty audio clip"));
        }

        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .part(
                "file",
                reqwest::multipart::Part::bytes(clip.bytes.clone())
                    .file_name("turn.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| ProviderError::protocol(e.to_string()))?,
            );

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(response_error(response).await);
        }

        let body = response.text().await.map_err(transport_error)?;
        let parsed: TranscriptionResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::protocol(format!("bad transcription response: {}", e)))?;

        Ok(ProviderResponse {
            output: ProviderOutput::Transcript {
                text: parsed.text,
                confidence: parsed.confidence.unwrap_or(1.0),
            },
            usage: Usage::for_audio(clip.duration.as_secs_f64()),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Generation
// ─────────────────────────────────────────────────────────────────────────────

/// Response generation over an OpenAI-compatible `/chat/completions` endpoint.
pub struct HttpGenerator {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpGenerator {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn wire_role(role: Role) -> &'static str {
        match role {
            Role::System => "system",
            Role::Caller => "user",
            Role::Agent => "assistant",
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: WireReply,
}

#[derive(Debug, Deserialize)]
struct WireReply {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[async_trait]
impl ProviderClient for HttpGenerator {
    async fn invoke(&self, payload: ProviderPayload) -> Result<ProviderResponse, ProviderError> {
        let context = match payload {
            ProviderPayload::Generate(context) => context,
            other => {
                return Err(ProviderError::protocol(format!(
                    "generator received {} payload",
                    other.capability()
                )))
            }
        };
        if context.exchanges.is_empty() {
            return Err(ProviderError::caller_input("empty conversation context"));
        }

        let request = ChatRequest {
            model: &self.model,
            messages: context
                .exchanges
                .iter()
                .map(|Exchange { role, text }| WireMessage {
                    role: Self::wire_role(*role),
                    content: text,
                })
                .collect(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(response_error(response).await);
        }

        let body = response.text().await.map_err(transport_error)?;
        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::protocol(format!("bad chat response: {}", e)))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::protocol("no choices in response"))?;

        let usage = parsed
            .usage
            .map(|u| Usage::for_tokens(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        Ok(ProviderResponse {
            output: ProviderOutput::Reply { text },
            usage,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Synthesis
// ─────────────────────────────────────────────────────────────────────────────

/// Text-to-speech over an OpenAI-compatible `/audio/speech` endpoint.
pub struct HttpSynthesizer {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    voice: String,
}

impl HttpSynthesizer {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        voice: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
            voice: voice.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
}

#[async_trait]
impl ProviderClient for HttpSynthesizer {
    async fn invoke(&self, payload: ProviderPayload) -> Result<ProviderResponse, ProviderError> {
        let text = match payload {
            ProviderPayload::Synthesize(text) => text,
            other => {
                return Err(ProviderError::protocol(format!(
                    "synthesizer received {} payload",
                    other.capability()
                )))
            }
        };
        if text.trim().is_empty() {
            return Err(ProviderError::caller_input("empty synthesis text"));
        }

        let request = SpeechRequest {
            model: &self.model,
            input: &text,
            voice: &self.voice,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(response_error(response).await);
        }

        let bytes = response.bytes().await.map_err(transport_error)?;
        let characters = text.chars().count() as u64;

        Ok(ProviderResponse {
            output: ProviderOutput::Audio(AudioClip::new(bytes.to_vec(), Duration::ZERO)),
            usage: Usage::for_characters(characters),
        })
    }
}
