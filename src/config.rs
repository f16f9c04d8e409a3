//! Engine configuration.
//!
//! Loaded once at process start from a JSON file; the provider roster and
//! thresholds never change at runtime. Secrets stay out of the file: each
//! provider names the environment variable holding its API key.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::breaker::BreakerConfig;
use crate::provider::http::{HttpGenerator, HttpSynthesizer, HttpTranscriber};
use crate::provider::{Capability, CostModel, Provider, ProviderClient, ProviderRegistry};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Configured providers across all capabilities.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    /// Tenants and their human transfer destinations.
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
    /// Fixed apology spoken before transfer/hangup when a call degrades.
    #[serde(default = "default_apology")]
    pub apology_message: String,
    /// Bind address for the read-only ops surface.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            breaker: BreakerSettings::default(),
            timeouts: TimeoutSettings::default(),
            tenants: Vec::new(),
            apology_message: default_apology(),
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_apology() -> String {
    "I'm sorry, we're having technical difficulties. Let me connect you with someone who can help."
        .to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_secs: default_reset_timeout_secs(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_secs() -> u64 {
    30
}

/// Per-capability invoke timeouts and the hard per-turn deadline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_transcription_secs")]
    pub transcription_secs: u64,
    #[serde(default = "default_generation_secs")]
    pub generation_secs: u64,
    #[serde(default = "default_synthesis_secs")]
    pub synthesis_secs: u64,
    /// The full failover attempt across all candidates must finish within
    /// this bound; crossing it degrades the call like exhaustion.
    #[serde(default = "default_turn_deadline_secs")]
    pub turn_deadline_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            transcription_secs: default_transcription_secs(),
            generation_secs: default_generation_secs(),
            synthesis_secs: default_synthesis_secs(),
            turn_deadline_secs: default_turn_deadline_secs(),
        }
    }
}

fn default_transcription_secs() -> u64 {
    5
}

fn default_generation_secs() -> u64 {
    10
}

fn default_synthesis_secs() -> u64 {
    5
}

fn default_turn_deadline_secs() -> u64 {
    12
}

/// One tenant's call-handling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    pub tenant_id: String,
    /// Human destination for degraded calls. Without one, degraded calls
    /// end in a courtesy hangup.
    #[serde(default)]
    pub transfer_number: Option<String>,
}

/// One provider entry: a vendor endpoint serving one capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub capability: Capability,
    /// Lower rank is tried first.
    pub priority: u32,
    pub endpoint: String,
    pub model: String,
    /// Synthesis voice; ignored for other capabilities.
    #[serde(default)]
    pub voice: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub cost: CostModel,
    /// Override of the capability's default invoke timeout.
    #[serde(default)]
    pub invoke_timeout_secs: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl EngineConfig {
    /// Load and validate configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        tracing::info!(
            "loaded config from {} ({} providers, {} tenants)",
            path.display(),
            config.providers.len(),
            config.tenants.len()
        );
        Ok(config)
    }

    /// Reject configurations the engine cannot run with. An empty candidate
    /// list for any capability is a fatal misconfiguration, caught here
    /// rather than discovered mid-call.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate provider id {}",
                    provider.id
                )));
            }
            Url::parse(&provider.endpoint).map_err(|e| {
                ConfigError::Invalid(format!(
                    "provider {}: bad endpoint {}: {}",
                    provider.id, provider.endpoint, e
                ))
            })?;
        }
        for capability in Capability::ALL {
            if !self.providers.iter().any(|p| p.capability == capability) {
                return Err(ConfigError::Invalid(format!(
                    "no providers configured for {}",
                    capability
                )));
            }
        }
        Ok(())
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            reset_timeout: Duration::from_secs(self.breaker.reset_timeout_secs),
        }
    }

    pub fn turn_deadline(&self) -> Duration {
        Duration::from_secs(self.timeouts.turn_deadline_secs)
    }

    pub fn invoke_timeout(&self, capability: Capability) -> Duration {
        let secs = match capability {
            Capability::Transcription => self.timeouts.transcription_secs,
            Capability::Generation => self.timeouts.generation_secs,
            Capability::Synthesis => self.timeouts.synthesis_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn transfer_number(&self, tenant_id: &str) -> Option<&str> {
        self.tenants
            .iter()
            .find(|t| t.tenant_id == tenant_id)
            .and_then(|t| t.transfer_number.as_deref())
    }

    /// Instantiate the HTTP adapter for every configured provider.
    pub fn build_registry(&self) -> Result<ProviderRegistry, ConfigError> {
        let mut providers = Vec::with_capacity(self.providers.len());
        for entry in &self.providers {
            let api_key = match &entry.api_key_env {
                Some(var) => std::env::var(var).map_err(|_| {
                    ConfigError::Invalid(format!(
                        "provider {}: api key env {} not set",
                        entry.id, var
                    ))
                })?,
                None => String::new(),
            };
            let client: Arc<dyn ProviderClient> = match entry.capability {
                Capability::Transcription => Arc::new(HttpTranscriber::new(
                    &entry.endpoint,
                    &api_key,
                    &entry.model,
                )),
                Capability::Generation => {
                    Arc::new(HttpGenerator::new(&entry.endpoint, &api_key, &entry.model))
                }
                Capability::Synthesis => Arc::new(HttpSynthesizer::new(
                    &entry.endpoint,
                    &api_key,
                    &entry.model,
                    entry.voice.as_deref().unwrap_or("alloy"),
                )),
            };
            providers.push(Provider {
                id: entry.id.clone(),
                capability: entry.capability,
                priority: entry.priority,
                invoke_timeout: entry
                    .invoke_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| self.invoke_timeout(entry.capability)),
                cost: entry.cost,
                client,
            });
        }
        Ok(ProviderRegistry::new(providers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn provider_entry(id: &str, capability: Capability) -> ProviderConfig {
        ProviderConfig {
            id: id.into(),
            capability,
            priority: 1,
            endpoint: "https://api.example.com/v1".into(),
            model: "test-model".into(),
            voice: None,
            api_key_env: None,
            cost: CostModel::Flat { usd_per_call: 0.01 },
            invoke_timeout_secs: None,
        }
    }

    fn full_roster() -> Vec<ProviderConfig> {
        vec![
            provider_entry("stt", Capability::Transcription),
            provider_entry("llm", Capability::Generation),
            provider_entry("tts", Capability::Synthesis),
        ]
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.reset_timeout_secs, 30);
        assert_eq!(config.timeouts.turn_deadline_secs, 12);
        assert!(!config.apology_message.is_empty());
    }

    #[test]
    fn test_load_round_trip() {
        let config = EngineConfig {
            providers: full_roster(),
            ..EngineConfig::default()
        };
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string_pretty(&config).unwrap().as_bytes())
            .unwrap();

        let loaded = EngineConfig::load(file.path()).unwrap();
        assert_eq!(loaded.providers.len(), 3);
        assert_eq!(loaded.providers[0].id, "stt");
    }

    #[test]
    fn test_missing_capability_rejected() {
        let config = EngineConfig {
            providers: vec![
                provider_entry("stt", Capability::Transcription),
                provider_entry("llm", Capability::Generation),
            ],
            ..EngineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("synthesis"));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut providers = full_roster();
        providers.push(provider_entry("stt", Capability::Transcription));
        let config = EngineConfig {
            providers,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_endpoint_rejected() {
        let mut providers = full_roster();
        providers[0].endpoint = "not a url".into();
        let config = EngineConfig {
            providers,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transfer_number_lookup() {
        let config = EngineConfig {
            tenants: vec![
                TenantConfig {
                    tenant_id: "acme".into(),
                    transfer_number: Some("+15550100".into()),
                },
                TenantConfig {
                    tenant_id: "globex".into(),
                    transfer_number: None,
                },
            ],
            ..EngineConfig::default()
        };
        assert_eq!(config.transfer_number("acme"), Some("+15550100"));
        assert_eq!(config.transfer_number("globex"), None);
        assert_eq!(config.transfer_number("unknown"), None);
    }

    #[test]
    fn test_build_registry_orders_candidates() {
        let mut providers = full_roster();
        providers.push(ProviderConfig {
            priority: 0,
            ..provider_entry("stt-primary", Capability::Transcription)
        });
        let config = EngineConfig {
            providers,
            ..EngineConfig::default()
        };
        let registry = config.build_registry().unwrap();
        let ids: Vec<&str> = registry
            .candidates(Capability::Transcription)
            .iter()
            .map(|p| p.id.as_str())
            .collect();
        assert_eq!(ids, vec!["stt-primary", "stt"]);
    }

    #[test]
    fn test_missing_api_key_env_rejected() {
        let mut providers = full_roster();
        providers[0].api_key_env = Some("VOXGATE_TEST_KEY_THAT_DOES_NOT_EXIST".into());
        let config = EngineConfig {
            providers,
            ..EngineConfig::default()
        };
        assert!(config.build_registry().is_err());
    }
}
