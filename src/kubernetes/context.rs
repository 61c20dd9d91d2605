// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Cluster-context manager.
//!
//! Resolves a context name to a cached `ClientBundle`. Each context gets
//! exactly one bundle, built on first use; concurrent first requests for the
//! same context wait on the same construction. Per-request bundles (OAuth
//! passthrough, header overrides) are built fresh and never cached.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use kube::Config;
use kube::config::{AuthInfo, KubeConfigOptions, Kubeconfig};
use serde_json::json;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};

use super::client::{ClientBundle, ClientFactory, apply_timeouts};
use super::policy::PolicySet;
use crate::config::{ProviderStrategy, StaticConfig};
use crate::error::{GateError, Result};
use crate::events::{EventBus, GatewayEvent};
use crate::identity::{ClusterOverride, OverrideAuth, Secret};

/// The single implicit context when running inside a cluster
pub const IN_CLUSTER_CONTEXT: &str = "in-cluster";

/// Name given to bundles built from request override headers
pub const OVERRIDE_CONTEXT: &str = "header-override";

const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// True when a service account is mounted and the API server is advertised
pub fn running_in_cluster() -> bool {
    std::env::var_os("KUBERNETES_SERVICE_HOST").is_some() && Path::new(SERVICE_ACCOUNT_TOKEN).exists()
}

/// Read the given kubeconfig, or the default one ($KUBECONFIG, ~/.kube/config)
pub fn read_kubeconfig(path: Option<&Path>) -> Result<Kubeconfig> {
    Ok(match path {
        Some(path) => Kubeconfig::read_from(path)?,
        None => Kubeconfig::read()?,
    })
}

enum Source {
    InCluster { config: Config },
    Kubeconfig { kubeconfig: Kubeconfig },
    /// No local identity; every request brings its own
    HeadersOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextInfo {
    pub name: String,
    pub cluster: String,
    pub server: Option<String>,
    pub namespace: Option<String>,
    pub is_default: bool,
}

type BundleSlot = Arc<OnceCell<Arc<ClientBundle>>>;

pub struct ContextManager {
    source: Source,
    default_context: RwLock<String>,
    factory: Arc<dyn ClientFactory>,
    policy: Arc<PolicySet>,
    events: Arc<EventBus>,
    /// Run the request validator chain in every bundle
    validation: bool,
    bundles: RwLock<HashMap<String, BundleSlot>>,
}

impl ContextManager {
    fn with_source(
        source: Source,
        default_context: String,
        factory: Arc<dyn ClientFactory>,
        policy: Arc<PolicySet>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            source,
            default_context: RwLock::new(default_context),
            factory,
            policy,
            events,
            validation: false,
            bundles: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.validation = enabled;
        self
    }

    /// Manager over a multi-context kubeconfig. The default context is
    /// `context` if given, else the kubeconfig's current-context.
    pub fn from_kubeconfig(
        kubeconfig: Kubeconfig,
        context: Option<&str>,
        factory: Arc<dyn ClientFactory>,
        policy: Arc<PolicySet>,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        let default_context = context
            .filter(|c| !c.is_empty())
            .map(String::from)
            .or_else(|| kubeconfig.current_context.clone())
            .ok_or(GateError::NoDefaultContext)?;

        // Verify context exists
        if !kubeconfig.contexts.iter().any(|c| c.name == default_context) {
            return Err(GateError::UnknownContext(default_context));
        }

        Ok(Self::with_source(
            Source::Kubeconfig { kubeconfig },
            default_context,
            factory,
            policy,
            events,
        ))
    }

    /// Manager with the single in-cluster identity
    pub fn in_cluster(
        config: Config,
        factory: Arc<dyn ClientFactory>,
        policy: Arc<PolicySet>,
        events: Arc<EventBus>,
    ) -> Self {
        Self::with_source(
            Source::InCluster { config },
            IN_CLUSTER_CONTEXT.to_string(),
            factory,
            policy,
            events,
        )
    }

    /// Manager without a local identity, for the auth-headers strategy
    pub fn headers_only(factory: Arc<dyn ClientFactory>, policy: Arc<PolicySet>, events: Arc<EventBus>) -> Self {
        Self::with_source(Source::HeadersOnly, String::new(), factory, policy, events)
    }

    /// Pick the identity source according to the configured strategy
    pub fn from_settings(
        settings: &StaticConfig,
        context: Option<&str>,
        factory: Arc<dyn ClientFactory>,
        policy: Arc<PolicySet>,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        let kubeconfig_path = settings.kubeconfig.as_deref();
        let manager = match settings.cluster_provider_strategy {
            ProviderStrategy::InCluster => Ok(Self::in_cluster(Config::incluster()?, factory, policy, events)),
            ProviderStrategy::Auto if kubeconfig_path.is_none() && running_in_cluster() => {
                info!("Running in-cluster, using service account identity");
                Ok(Self::in_cluster(Config::incluster()?, factory, policy, events))
            }
            ProviderStrategy::AuthHeaders => match read_kubeconfig(kubeconfig_path) {
                Ok(kubeconfig) if kubeconfig.current_context.is_some() || context.is_some() => {
                    Self::from_kubeconfig(kubeconfig, context, factory, policy, events)
                }
                _ => Ok(Self::headers_only(factory, policy, events)),
            },
            ProviderStrategy::Auto | ProviderStrategy::Kubeconfig => {
                let kubeconfig = read_kubeconfig(kubeconfig_path)?;
                Self::from_kubeconfig(kubeconfig, context, factory, policy, events)
            }
        }?;
        Ok(manager.with_validation(settings.validation.is_enabled()))
    }

    pub fn is_in_cluster(&self) -> bool {
        matches!(self.source, Source::InCluster { .. })
    }

    pub fn policy(&self) -> &Arc<PolicySet> {
        &self.policy
    }

    pub async fn default_context(&self) -> String {
        self.default_context.read().await.clone()
    }

    /// Map a requested name to the context it refers to, without network I/O
    async fn canonical_name(&self, name: &str) -> Result<String> {
        let name = if name.is_empty() {
            self.default_context().await
        } else {
            name.to_string()
        };

        match &self.source {
            Source::InCluster { .. } if name != IN_CLUSTER_CONTEXT => {
                Err(GateError::ContextSwitchInCluster(name))
            }
            Source::InCluster { .. } => Ok(name),
            Source::Kubeconfig { kubeconfig } => {
                if kubeconfig.contexts.iter().any(|c| c.name == name) {
                    Ok(name)
                } else {
                    Err(GateError::UnknownContext(name))
                }
            }
            Source::HeadersOnly => Err(GateError::MissingClusterOverride),
        }
    }

    /// REST config for a context, with the standard timeouts applied
    async fn rest_config(&self, name: &str) -> Result<Config> {
        let mut config = match &self.source {
            Source::InCluster { config } => config.clone(),
            Source::Kubeconfig { kubeconfig } => {
                Config::from_custom_kubeconfig(
                    kubeconfig.clone(),
                    &KubeConfigOptions {
                        context: Some(name.to_string()),
                        ..Default::default()
                    },
                )
                .await?
            }
            Source::HeadersOnly => return Err(GateError::MissingClusterOverride),
        };
        apply_timeouts(&mut config);
        Ok(config)
    }

    async fn connect(&self, name: &str, config: Config) -> Result<ClientBundle> {
        self.events.emit(GatewayEvent::Connecting {
            context: name.to_string(),
        });
        let start = Instant::now();

        let connection = self.factory.connect(name, &config).await?;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(context = %name, server = %config.cluster_url, elapsed_ms, "Connected to cluster");
        self.events.emit(GatewayEvent::Connected {
            context: name.to_string(),
            elapsed_ms,
        });

        Ok(ClientBundle::new(
            name,
            config,
            connection,
            self.policy.clone(),
            self.events.clone(),
            self.validation,
        ))
    }

    /// Get the bundle for a context; `""` means the default context
    pub async fn resolve(&self, name: &str) -> Result<Arc<ClientBundle>> {
        let name = self.canonical_name(name).await?;

        let slot = {
            let bundles = self.bundles.read().await;
            bundles.get(&name).cloned()
        };
        let slot = match slot {
            Some(slot) => slot,
            None => self.bundles.write().await.entry(name.clone()).or_default().clone(),
        };

        let bundle = slot
            .get_or_try_init(|| async {
                let config = self.rest_config(&name).await?;
                self.connect(&name, config).await.map(Arc::new)
            })
            .await?;
        Ok(bundle.clone())
    }

    /// Contexts with a built bundle, sorted
    pub async fn cached_contexts(&self) -> Vec<String> {
        let bundles = self.bundles.read().await;
        let mut names: Vec<_> = bundles
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn list_contexts(&self) -> Vec<ContextInfo> {
        let default_context = self.default_context().await;
        match &self.source {
            Source::InCluster { config } => vec![ContextInfo {
                name: IN_CLUSTER_CONTEXT.to_string(),
                cluster: IN_CLUSTER_CONTEXT.to_string(),
                server: Some(config.cluster_url.to_string()),
                namespace: Some(config.default_namespace.clone()),
                is_default: true,
            }],
            Source::Kubeconfig { kubeconfig } => kubeconfig
                .contexts
                .iter()
                .map(|named| {
                    let context = named.context.as_ref();
                    let cluster = context.map(|c| c.cluster.clone()).unwrap_or_default();
                    let server = kubeconfig
                        .clusters
                        .iter()
                        .find(|c| c.name == cluster)
                        .and_then(|c| c.cluster.as_ref())
                        .and_then(|c| c.server.clone());
                    ContextInfo {
                        name: named.name.clone(),
                        namespace: context.and_then(|c| c.namespace.clone()),
                        is_default: named.name == default_context,
                        cluster,
                        server,
                    }
                })
                .collect(),
            Source::HeadersOnly => vec![],
        }
    }

    /// Make `name` the default context, evicting the previous default's bundle
    pub async fn switch_default(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(GateError::UnknownContext(String::new()));
        }
        let name = self.canonical_name(name).await?;

        let previous = {
            let mut default_context = self.default_context.write().await;
            std::mem::replace(&mut *default_context, name.clone())
        };
        if previous == name {
            return Ok(());
        }

        self.bundles.write().await.remove(&previous);
        info!(from = %previous, to = %name, "Switched default context");
        self.events.emit(GatewayEvent::ContextSwitched { from: previous, to: name });
        Ok(())
    }

    /// Per-request bundle for `name` authenticated only by `token`.
    /// None of the context's own credentials are carried over.
    pub async fn derive_with_bearer(&self, name: &str, token: &Secret) -> Result<ClientBundle> {
        let name = self.canonical_name(name).await?;
        let mut config = self.rest_config(&name).await?;
        config.auth_info = bearer_auth_info(token)?;
        debug!(context = %name, "Building per-request bundle from bearer token");
        self.connect(&name, config).await
    }

    /// Per-request bundle for a caller-supplied cluster
    pub async fn derive_with_override(&self, cluster: &ClusterOverride) -> Result<ClientBundle> {
        let kubeconfig = override_kubeconfig(cluster)?;
        let mut config = Config::from_custom_kubeconfig(
            kubeconfig,
            &KubeConfigOptions {
                context: Some(OVERRIDE_CONTEXT.to_string()),
                ..Default::default()
            },
        )
        .await?;
        apply_timeouts(&mut config);
        debug!(server = %cluster.server, "Building per-request bundle from override headers");
        self.connect(OVERRIDE_CONTEXT, config).await
    }
}

fn bearer_auth_info(token: &Secret) -> Result<AuthInfo> {
    serde_json::from_value(json!({ "token": token.expose() }))
        .map_err(|e| GateError::InvalidOverride(format!("bearer token: {}", e)))
}

/// Single-context kubeconfig describing a header override
pub fn override_kubeconfig(cluster: &ClusterOverride) -> Result<Kubeconfig> {
    let user = match &cluster.auth {
        OverrideAuth::Bearer(token) => json!({ "token": token.expose() }),
        OverrideAuth::ClientCertificate {
            certificate_data,
            key_data,
        } => json!({
            "client-certificate-data": certificate_data,
            "client-key-data": key_data.expose(),
        }),
    };

    let mut cluster_entry = json!({
        "server": cluster.server,
        "certificate-authority-data": cluster.certificate_authority_data,
    });
    if cluster.insecure_skip_tls_verify {
        cluster_entry["insecure-skip-tls-verify"] = json!(true);
    }

    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": OVERRIDE_CONTEXT, "cluster": cluster_entry }],
        "users": [{ "name": OVERRIDE_CONTEXT, "user": user }],
        "contexts": [{
            "name": OVERRIDE_CONTEXT,
            "context": { "cluster": OVERRIDE_CONTEXT, "user": OVERRIDE_CONTEXT }
        }],
        "current-context": OVERRIDE_CONTEXT,
    }))
    .map_err(|e| GateError::InvalidOverride(e.to_string()))
}
