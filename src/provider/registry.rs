//! Static priority-ordered provider lookup.
//!
//! The registry is loaded once at process start from configuration and never
//! changes at runtime. There is deliberately no reordering by observed
//! latency or quality; the configured priority is the routing order.

use std::collections::HashMap;

use super::{Capability, Provider};

/// Read-only lookup of configured providers per capability.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    by_capability: HashMap<Capability, Vec<Provider>>,
}

impl ProviderRegistry {
    /// Build a registry from configured providers, sorting each capability's
    /// candidates by priority rank (ties broken by id for determinism).
    pub fn new(providers: Vec<Provider>) -> Self {
        let mut by_capability: HashMap<Capability, Vec<Provider>> = HashMap::new();
        for provider in providers {
            by_capability
                .entry(provider.capability)
                .or_default()
                .push(provider);
        }
        for candidates in by_capability.values_mut() {
            candidates.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));
        }
        Self { by_capability }
    }

    /// Candidates for a capability in priority order. Empty means the
    /// capability is not configured, which the router reports as a fatal
    /// misconfiguration rather than exhaustion.
    pub fn candidates(&self, capability: Capability) -> &[Provider] {
        self.by_capability
            .get(&capability)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Ids of every configured provider, across all capabilities.
    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .by_capability
            .values()
            .flatten()
            .map(|p| p.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.by_capability.values().all(Vec::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{
        AudioClip, CostModel, ProviderClient, ProviderError, ProviderPayload, ProviderResponse,
    };
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    struct NullClient;

    #[async_trait]
    impl ProviderClient for NullClient {
        async fn invoke(
            &self,
            _payload: ProviderPayload,
        ) -> Result<ProviderResponse, ProviderError> {
            Err(ProviderError::network("null client"))
        }
    }

    fn provider(id: &str, capability: Capability, priority: u32) -> Provider {
        Provider {
            id: id.to_string(),
            capability,
            priority,
            invoke_timeout: Duration::from_secs(5),
            cost: CostModel::Flat { usd_per_call: 0.0 },
            client: Arc::new(NullClient),
        }
    }

    #[test]
    fn test_candidates_sorted_by_priority() {
        let registry = ProviderRegistry::new(vec![
            provider("b", Capability::Transcription, 2),
            provider("a", Capability::Transcription, 1),
            provider("c", Capability::Transcription, 3),
        ]);
        let ids: Vec<&str> = registry
            .candidates(Capability::Transcription)
            .iter()
            .map(|p| p.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_priority_ties_break_on_id() {
        let registry = ProviderRegistry::new(vec![
            provider("zeta", Capability::Generation, 1),
            provider("alpha", Capability::Generation, 1),
        ]);
        let ids: Vec<&str> = registry
            .candidates(Capability::Generation)
            .iter()
            .map(|p| p.id.as_str())
            .collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_unconfigured_capability_is_empty() {
        let registry = ProviderRegistry::new(vec![provider("a", Capability::Synthesis, 1)]);
        assert!(registry.candidates(Capability::Transcription).is_empty());
        assert_eq!(registry.candidates(Capability::Synthesis).len(), 1);
    }

    #[test]
    fn test_audio_clip_empty() {
        assert!(AudioClip::default().is_empty());
    }
}
