// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Resource discovery for Kubernetes clusters.
//!
//! Discovers all available resources (including CRDs) at runtime using the
//! Kubernetes discovery API. The result is cached per client bundle and
//! filtered through the policy set before anyone sees it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use kube::Client;
use kube::core::{ApiResource, GroupVersionKind};
use kube::discovery::{Discovery, Scope};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::policy::PolicySet;
use crate::error::Result;
use crate::events::{EventBus, GatewayEvent};

/// Information about a discovered Kubernetes resource
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredType {
    /// The API resource definition
    pub api_resource: ApiResource,
    pub namespaced: bool,
    /// Verbs the server supports for this resource
    pub verbs: Vec<String>,
}

impl DiscoveredType {
    pub fn new(group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> Self {
        let gvk = GroupVersionKind::gvk(group, version, kind);
        Self {
            api_resource: ApiResource::from_gvk_with_plural(&gvk, plural),
            namespaced,
            verbs: vec![],
        }
    }

    pub fn group(&self) -> &str {
        &self.api_resource.group
    }

    pub fn version(&self) -> &str {
        &self.api_resource.version
    }

    pub fn kind(&self) -> &str {
        &self.api_resource.kind
    }

    pub fn plural(&self) -> &str {
        &self.api_resource.plural
    }

    /// Get the full API group/version string
    pub fn api_version(&self) -> &str {
        &self.api_resource.api_version
    }
}

type GvkKey = (String, String, String);

fn key(group: &str, version: &str, name: &str) -> GvkKey {
    (group.to_string(), version.to_string(), name.to_lowercase())
}

/// All types served by one cluster, indexed by kind and by plural
#[derive(Debug, Clone, Default)]
pub struct TypeCatalog {
    by_kind: HashMap<GvkKey, DiscoveredType>,
    /// (group, version, plural) -> (group, version, kind) mapping
    by_resource: HashMap<GvkKey, GvkKey>,
}

impl TypeCatalog {
    pub fn new(types: Vec<DiscoveredType>) -> Self {
        let mut catalog = Self::default();
        for t in types {
            let kind_key = key(t.group(), t.version(), t.kind());
            catalog
                .by_resource
                .insert(key(t.group(), t.version(), t.plural()), kind_key.clone());
            catalog.by_kind.insert(kind_key, t);
        }
        catalog
    }

    /// Kind lookup is case-insensitive like kubectl's
    pub fn find_kind(&self, group: &str, version: &str, kind: &str) -> Option<&DiscoveredType> {
        self.by_kind.get(&key(group, version, kind))
    }

    pub fn find_resource(&self, group: &str, version: &str, resource: &str) -> Option<&DiscoveredType> {
        let kind_key = self.by_resource.get(&key(group, version, resource))?;
        self.by_kind.get(kind_key)
    }

    pub fn len(&self) -> usize {
        self.by_kind.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_kind.is_empty()
    }

    /// All types sorted by api version and kind
    pub fn types(&self) -> Vec<&DiscoveredType> {
        let mut types: Vec<_> = self.by_kind.values().collect();
        types.sort_by(|a, b| (a.api_version(), a.kind()).cmp(&(b.api_version(), b.kind())));
        types
    }
}

/// Source of the raw, unfiltered server type list
#[async_trait]
pub trait DiscoveryTransport: Send + Sync {
    async fn server_resources(&self) -> Result<Vec<DiscoveredType>>;
}

/// Discovery against a live API server
pub struct ApiDiscovery {
    client: Client,
}

impl ApiDiscovery {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DiscoveryTransport for ApiDiscovery {
    async fn server_resources(&self) -> Result<Vec<DiscoveredType>> {
        let discovery = Discovery::new(self.client.clone()).run().await?;

        let mut types = Vec::new();
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    // Skip subresources (e.g., pods/log, pods/exec)
                    if ar.plural.contains('/') {
                        continue;
                    }
                    types.push(DiscoveredType {
                        namespaced: caps.scope == Scope::Namespaced,
                        verbs: caps.operations.clone(),
                        api_resource: ar,
                    });
                }
            }
        }
        Ok(types)
    }
}

/// Policy-aware discovery with an in-memory catalog cache
pub struct FilteredDiscovery {
    context: String,
    transport: Arc<dyn DiscoveryTransport>,
    policy: Arc<PolicySet>,
    cache: RwLock<Option<Arc<TypeCatalog>>>,
    events: Arc<EventBus>,
}

impl FilteredDiscovery {
    pub fn new(
        context: &str,
        transport: Arc<dyn DiscoveryTransport>,
        policy: Arc<PolicySet>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            context: context.to_string(),
            transport,
            policy,
            cache: RwLock::new(None),
            events,
        }
    }

    pub fn policy(&self) -> &PolicySet {
        &self.policy
    }

    /// The server catalog and whether it came from cache
    pub async fn catalog(&self) -> Result<(Arc<TypeCatalog>, bool)> {
        // Fast path: check with read lock
        {
            let cache = self.cache.read().await;
            if let Some(catalog) = cache.as_ref() {
                return Ok((catalog.clone(), true));
            }
        }

        let mut cache = self.cache.write().await;
        // Double-check after acquiring write lock
        if let Some(catalog) = cache.as_ref() {
            return Ok((catalog.clone(), true));
        }

        self.events.emit(GatewayEvent::Discovering {
            context: self.context.clone(),
        });
        let start = Instant::now();
        let catalog = Arc::new(TypeCatalog::new(self.transport.server_resources().await?));
        let elapsed_ms = start.elapsed().as_millis() as u64;

        info!(
            context = %self.context,
            types = catalog.len(),
            elapsed_ms,
            "Discovered server resources"
        );
        self.events.emit(GatewayEvent::DiscoveryComplete {
            context: self.context.clone(),
            type_count: catalog.len(),
            elapsed_ms,
        });

        *cache = Some(catalog.clone());
        Ok((catalog, false))
    }

    /// Every server type the policy permits
    pub async fn server_resources(&self) -> Result<Vec<DiscoveredType>> {
        let (catalog, _) = self.catalog().await?;
        Ok(catalog
            .types()
            .into_iter()
            .filter(|t| self.policy.is_allowed(t.group(), t.version(), t.kind()))
            .cloned()
            .collect())
    }

    /// Permitted types of one group/version
    pub async fn server_resources_for(&self, group: &str, version: &str) -> Result<Vec<DiscoveredType>> {
        Ok(self
            .server_resources()
            .await?
            .into_iter()
            .filter(|t| t.group() == group && t.version() == version)
            .collect())
    }

    /// Drop the cached catalog; the next lookup hits the server
    pub async fn reset(&self) {
        debug!(context = %self.context, "Resetting discovery cache");
        *self.cache.write().await = None;
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::config::ResourceRule;

    fn filtered(policy: PolicySet) -> (Arc<StaticTransport>, FilteredDiscovery) {
        let transport = StaticTransport::new(sample_types());
        let discovery = FilteredDiscovery::new(
            "test",
            transport.clone(),
            Arc::new(policy),
            Arc::new(EventBus::new()),
        );
        (transport, discovery)
    }

    #[test]
    fn test_discovered_type_api_version() {
        let core = DiscoveredType::new("", "v1", "Pod", "pods", true);
        assert_eq!(core.api_version(), "v1");
        let apps = DiscoveredType::new("apps", "v1", "Deployment", "deployments", true);
        assert_eq!(apps.api_version(), "apps/v1");
    }

    #[test]
    fn test_catalog_lookup() {
        let catalog = TypeCatalog::new(sample_types());
        assert_eq!(catalog.len(), 8);
        assert_eq!(catalog.find_kind("", "v1", "pod").unwrap().plural(), "pods");
        assert_eq!(
            catalog.find_resource("apps", "v1", "deployments").unwrap().kind(),
            "Deployment"
        );
        assert!(catalog.find_kind("apps", "v1", "Pod").is_none());
        assert!(catalog.find_resource("", "v1", "widgets").is_none());
    }

    #[tokio::test]
    async fn test_denied_types_are_not_listed() {
        let policy = PolicySet::new(
            vec![
                ResourceRule::new("", "v1", "Secret"),
                ResourceRule::new("rbac.authorization.k8s.io", "v1", ""),
            ],
            vec![],
        );
        let (_, discovery) = filtered(policy);

        let kinds: Vec<String> = discovery
            .server_resources()
            .await
            .unwrap()
            .iter()
            .map(|t| t.kind().to_string())
            .collect();
        assert!(kinds.contains(&"Namespace".to_string()));
        assert!(kinds.contains(&"Deployment".to_string()));
        assert!(!kinds.contains(&"Secret".to_string()));
        assert!(!kinds.contains(&"Role".to_string()));
        assert!(!kinds.contains(&"ClusterRole".to_string()));

        let rbac = discovery
            .server_resources_for("rbac.authorization.k8s.io", "v1")
            .await
            .unwrap();
        assert!(rbac.is_empty());
    }

    #[tokio::test]
    async fn test_catalog_is_cached_until_reset() {
        let (transport, discovery) = filtered(PolicySet::permissive());

        let (_, cached) = discovery.catalog().await.unwrap();
        assert!(!cached);
        let (_, cached) = discovery.catalog().await.unwrap();
        assert!(cached);
        discovery.server_resources().await.unwrap();
        assert_eq!(transport.calls(), 1);

        discovery.reset().await;
        discovery.server_resources().await.unwrap();
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_discovery_emits_events() {
        let transport = StaticTransport::new(sample_types());
        let events = Arc::new(EventBus::new());
        let mut rx = events.subscribe();
        let discovery = FilteredDiscovery::new("prod", transport, Arc::new(PolicySet::permissive()), events);

        discovery.catalog().await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            GatewayEvent::Discovering {
                context: "prod".to_string()
            }
        );
        match rx.recv().await.unwrap() {
            GatewayEvent::DiscoveryComplete { context, type_count, .. } => {
                assert_eq!(context, "prod");
                assert_eq!(type_count, 8);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
