//! Knowledge store that registers unknown modules via the npm registry

use std::time::Duration;

use anyhow::{Context, Result};
use malgraph_core::ServiceError;
use malgraph_core::category::Category;
use malgraph_core::knowledge::{KnowledgeStore, ModuleClass, StaticKnowledgeStore, download_name};
use malgraph_core::oracle::{RetryPolicy, with_retry};
use malgraph_core::pdg::Derivation;
use tracing::debug;

const SERVICE: &str = "npm registry";
const API_TIMEOUT_SECS: u64 = 10;

/// Wraps the table store; a module becomes third-party once the registry
/// knows a package of that name.
pub struct RegistryKnowledgeStore {
    inner: StaticKnowledgeStore,
    client: reqwest::blocking::Client,
    registry: String,
    policy: RetryPolicy,
}

impl RegistryKnowledgeStore {
    pub fn new(inner: StaticKnowledgeStore, registry: &str, policy: RetryPolicy) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(API_TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            inner,
            client,
            registry: registry.trim_end_matches('/').to_string(),
            policy,
        })
    }

    fn metadata_url(&self, name: &str) -> String {
        format!("{}/{}", self.registry, name.replace('/', "%2F"))
    }

    fn exists(&self, name: &str) -> Result<bool, ServiceError> {
        let url = self.metadata_url(name);
        let response = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.npm.install-v1+json")
            .send()
            .map_err(|e| ServiceError::transport(SERVICE, e.to_string()))?;
        match response.status().as_u16() {
            200..=299 => Ok(true),
            404 => Ok(false),
            code => Err(ServiceError::transport(SERVICE, format!("HTTP {code} for {url}"))),
        }
    }
}

impl KnowledgeStore for RegistryKnowledgeStore {
    fn classify(&self, module: &str) -> Result<ModuleClass, ServiceError> {
        self.inner.classify(module)
    }

    fn sensitive_call(
        &self,
        qualifier: &str,
        call: &str,
        derivation: Derivation,
        hint: Option<Category>,
    ) -> Result<Vec<Category>, ServiceError> {
        self.inner.sensitive_call(qualifier, call, derivation, hint)
    }

    fn register_module(&self, module: &str, dependencies: &[String]) -> Result<bool, ServiceError> {
        let name = download_name(module, dependencies);
        let found = with_retry(SERVICE, self.policy, || self.exists(&name))?;
        debug!(module, name = %name, found, "registry lookup");
        if found {
            self.inner.add_third_party(module);
        }
        Ok(found)
    }
}
