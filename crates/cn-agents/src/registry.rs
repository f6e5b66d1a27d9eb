use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use cn_core::config::{AgentsConfig, DispatchConfig};
use cn_core::types::AgentDomain;

use crate::client::AgentClient;
use crate::http_client::HttpAgentClient;
use crate::simulated::SimulatedAgentClient;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate agent client for domain `{0}`")]
    DuplicateAgent(AgentDomain),
}

// ---------------------------------------------------------------------------
// AgentClientRegistry
// ---------------------------------------------------------------------------

/// Maps agent domains to their clients. Built once at startup and shared
/// read-only (`Arc<AgentClientRegistry>`) by every plan in flight.
#[derive(Default)]
pub struct AgentClientRegistry {
    clients: HashMap<AgentDomain, Arc<dyn AgentClient>>,
}

impl AgentClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, client: Arc<dyn AgentClient>) -> Result<(), RegistryError> {
        let domain = client.domain().clone();
        if self.clients.contains_key(&domain) {
            return Err(RegistryError::DuplicateAgent(domain));
        }
        self.clients.insert(domain, client);
        Ok(())
    }

    /// Builder form of [`register`](Self::register); a later client for the
    /// same domain replaces the earlier one.
    pub fn with_client(mut self, client: Arc<dyn AgentClient>) -> Self {
        self.clients.insert(client.domain().clone(), client);
        self
    }

    pub fn get(&self, domain: &AgentDomain) -> Option<Arc<dyn AgentClient>> {
        self.clients.get(domain).cloned()
    }

    pub fn contains(&self, domain: &AgentDomain) -> bool {
        self.clients.contains_key(domain)
    }

    /// Registered domains, sorted.
    pub fn domains(&self) -> Vec<AgentDomain> {
        let mut domains: Vec<_> = self.clients.keys().cloned().collect();
        domains.sort();
        domains
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Simulated clients for frontend, backend and devops.
    pub fn simulated_defaults() -> Self {
        [
            AgentDomain::frontend(),
            AgentDomain::backend(),
            AgentDomain::devops(),
        ]
        .into_iter()
        .fold(Self::new(), |registry, domain| {
            registry.with_client(Arc::new(SimulatedAgentClient::new(domain)))
        })
    }

    /// HTTP clients for every configured endpoint, or the simulated defaults
    /// when no endpoint is configured.
    pub fn from_config(agents: &AgentsConfig, dispatch: &DispatchConfig) -> Self {
        if agents.endpoints.is_empty() {
            info!("no agent endpoints configured, using simulated agents");
            return Self::simulated_defaults();
        }

        let api_key = agents.api_key_env.as_deref().and_then(|var| {
            let key = std::env::var(var).ok();
            if key.is_none() {
                warn!(env = var, "agent api key variable not set, sending requests unauthenticated");
            }
            key
        });

        let mut registry = Self::new();
        for (domain, url) in &agents.endpoints {
            let mut client =
                HttpAgentClient::new(AgentDomain::new(domain.as_str()), url.as_str())
                    .with_timeout(dispatch.timeout());
            if let Some(key) = &api_key {
                client = client.with_api_key(key.as_str());
            }
            info!(agent = %domain, url = %url, "registered http agent");
            registry = registry.with_client(Arc::new(client));
        }
        registry
    }
}

impl std::fmt::Debug for AgentClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClientRegistry")
            .field("domains", &self.domains())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
