// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Client bundles: everything bound to one cluster identity.
//!
//! A bundle carries the REST config, the kube client (typed and dynamic
//! access share it), policy-filtered discovery and REST mapping, and the
//! RBAC reviewer. The client handed out is wrapped in the request gate, so
//! no request of any verb reaches the server for a denied type.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderValue, header::USER_AGENT};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{DeleteParams, DynamicObject, ListParams, ObjectList, Patch, PatchParams, PostParams};
use kube::{Api, Client, Config, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::access::{AccessAttributes, AccessReviewer, SelfSubjectReviewer};
use super::discovery::{ApiDiscovery, DiscoveredType, DiscoveryTransport, FilteredDiscovery};
use super::gate::{GatedService, RequestGate};
use super::mapper::FilteredRestMapper;
use super::policy::PolicySet;
use crate::error::{GateError, Result};
use crate::events::EventBus;

/// Timeout for connecting to K8s API
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for reading K8s API responses
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

pub fn apply_timeouts(config: &mut Config) {
    config.connect_timeout = Some(CONNECT_TIMEOUT);
    config.read_timeout = Some(READ_TIMEOUT);
}

/// Raw cluster handles produced for one REST config
pub struct Connection {
    /// Ungated client; discovery and access reviews use it directly
    pub client: Client,
    pub discovery: Arc<dyn DiscoveryTransport>,
    pub reviewer: Arc<dyn AccessReviewer>,
}

/// Builds the cluster handles for a context. This is the expensive step
/// (TLS and credential setup) that the context manager caches.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self, context: &str, config: &Config) -> Result<Connection>;
}

/// Factory talking to real API servers
pub struct KubeClientFactory;

#[async_trait]
impl ClientFactory for KubeClientFactory {
    async fn connect(&self, context: &str, config: &Config) -> Result<Connection> {
        debug!(context = %context, server = %config.cluster_url, "Creating client");
        let client = Client::try_from(config.clone())?;
        Ok(Connection {
            discovery: Arc::new(ApiDiscovery::new(client.clone())),
            reviewer: Arc::new(SelfSubjectReviewer::new(client.clone())),
            client,
        })
    }
}

pub struct ClientBundle {
    context: String,
    config: Config,
    /// Shared connection pool; never handed out
    base: Client,
    /// `base` behind the request gate
    client: Client,
    gate: Arc<RequestGate>,
    user_agent: Option<HeaderValue>,
    discovery: Arc<FilteredDiscovery>,
    mapper: FilteredRestMapper,
    reviewer: Arc<dyn AccessReviewer>,
}

impl ClientBundle {
    /// Must be called within a Tokio runtime
    pub fn new(
        context: &str,
        config: Config,
        connection: Connection,
        policy: Arc<PolicySet>,
        events: Arc<EventBus>,
        validation: bool,
    ) -> Self {
        let discovery = Arc::new(FilteredDiscovery::new(
            context,
            connection.discovery,
            policy,
            events,
        ));
        let gate = Arc::new(RequestGate::new(
            discovery.clone(),
            connection.reviewer.clone(),
            validation,
        ));
        let client = GatedService::new(connection.client.clone(), gate.clone(), None).into_client();
        Self {
            context: context.to_string(),
            config,
            base: connection.client,
            client,
            gate,
            user_agent: None,
            mapper: FilteredRestMapper::new(discovery.clone()),
            discovery,
            reviewer: connection.reviewer,
        }
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Client for collaborators that build their own `Api`s. Every request
    /// it sends passes the policy (and validators, when enabled).
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn discovery(&self) -> &FilteredDiscovery {
        &self.discovery
    }

    pub fn mapper(&self) -> &FilteredRestMapper {
        &self.mapper
    }

    pub fn policy(&self) -> &PolicySet {
        self.discovery.policy()
    }

    pub fn default_namespace(&self) -> &str {
        &self.config.default_namespace
    }

    pub fn user_agent(&self) -> Option<&HeaderValue> {
        self.user_agent.as_ref()
    }

    pub fn is_validating(&self) -> bool {
        self.gate.is_validating()
    }

    /// Copy of this bundle whose outbound requests carry `user_agent`.
    /// The connection pool, discovery state and reviewer are shared with
    /// the original; the header is set on each request.
    pub fn with_user_agent(&self, user_agent: &str) -> Result<Self> {
        let value = HeaderValue::from_str(user_agent)
            .map_err(|e| GateError::InvalidOverride(format!("user agent: {}", e)))?;
        let mut config = self.config.clone();
        config.headers.retain(|(name, _)| *name != USER_AGENT);
        config.headers.push((USER_AGENT, value.clone()));
        let client = GatedService::new(self.base.clone(), self.gate.clone(), Some(value.clone())).into_client();

        Ok(Self {
            context: self.context.clone(),
            config,
            base: self.base.clone(),
            client,
            gate: self.gate.clone(),
            user_agent: Some(value),
            discovery: self.discovery.clone(),
            mapper: FilteredRestMapper::new(self.discovery.clone()),
            reviewer: self.reviewer.clone(),
        })
    }

    /// Live RBAC check, one round-trip per call
    pub async fn can_use(&self, attrs: &AccessAttributes) -> Result<bool> {
        self.reviewer.review(attrs).await
    }

    /// Like `can_use`, but a denial is a `Forbidden` error
    pub async fn require(&self, attrs: &AccessAttributes) -> Result<()> {
        if self.can_use(attrs).await? {
            Ok(())
        } else {
            Err(GateError::Forbidden(attrs.clone()))
        }
    }

    /// Dynamic API for a caller-supplied type. Namespaced types without a
    /// namespace use the context's default namespace.
    pub async fn dynamic_api(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<(Api<DynamicObject>, DiscoveredType)> {
        let resolved = self.mapper.rest_mapping(api_version, kind).await?;
        let namespace = namespace
            .filter(|ns| !ns.is_empty())
            .unwrap_or(self.default_namespace());
        Ok((self.api_for(&resolved, Some(namespace)), resolved))
    }

    fn api_for(&self, resolved: &DiscoveredType, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) if resolved.namespaced => {
                Api::namespaced_with(self.client.clone(), ns, &resolved.api_resource)
            }
            _ => Api::all_with(self.client.clone(), &resolved.api_resource),
        }
    }

    pub async fn get(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject> {
        let (api, _) = self.dynamic_api(api_version, kind, namespace).await?;
        Ok(api.get(name).await?)
    }

    /// List objects. A namespaced type listed without a namespace is listed
    /// cluster-wide when RBAC permits, otherwise in the default namespace.
    pub async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> Result<ObjectList<DynamicObject>> {
        let resolved = self.mapper.rest_mapping(api_version, kind).await?;
        let namespace = self.list_namespace(&resolved, namespace).await?;
        let api = self.api_for(&resolved, namespace.as_deref());
        Ok(api.list(params).await?)
    }

    /// Namespace a list call should use; `None` means all namespaces
    pub async fn list_namespace(
        &self,
        resolved: &DiscoveredType,
        namespace: Option<&str>,
    ) -> Result<Option<String>> {
        if let Some(ns) = namespace.filter(|ns| !ns.is_empty()) {
            return Ok(Some(ns.to_string()));
        }
        if !resolved.namespaced {
            return Ok(None);
        }

        let attrs = AccessAttributes::new("list", resolved.group(), resolved.plural());
        if self.can_use(&attrs).await? {
            Ok(None)
        } else {
            info!(
                context = %self.context,
                resource = %resolved.plural(),
                namespace = %self.default_namespace(),
                "Cluster-wide list not permitted, falling back to default namespace"
            );
            Ok(Some(self.default_namespace().to_string()))
        }
    }

    pub async fn create(
        &self,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let types = object.types.as_ref().ok_or_else(|| {
            GateError::InvalidObject("missing apiVersion/kind".to_string())
        })?;
        let namespace = namespace.or(object.metadata.namespace.as_deref());
        let (api, _) = self
            .dynamic_api(&types.api_version, &types.kind, namespace)
            .await?;
        Ok(api.create(&PostParams::default(), object).await?)
    }

    /// Server-side apply under `field_manager`
    pub async fn apply(
        &self,
        namespace: Option<&str>,
        object: &DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject> {
        let types = object.types.as_ref().ok_or_else(|| {
            GateError::InvalidObject("missing apiVersion/kind".to_string())
        })?;
        let name = object
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| GateError::InvalidObject("missing metadata.name".to_string()))?;
        let namespace = namespace.or(object.metadata.namespace.as_deref());
        let (api, _) = self
            .dynamic_api(&types.api_version, &types.kind, namespace)
            .await?;
        let params = PatchParams::apply(field_manager).force();
        Ok(api.patch(name, &params, &Patch::Apply(object)).await?)
    }

    pub async fn delete(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<()> {
        let (api, _) = self.dynamic_api(api_version, kind, namespace).await?;
        api.delete(name, &DeleteParams::default()).await?;
        info!(context = %self.context, kind = %kind, name = %name, "Deleted resource");
        Ok(())
    }

    /// Check a compiled-in type against the policy
    fn check_typed<K>(&self) -> Result<()>
    where
        K: Resource<DynamicType = ()>,
    {
        self.policy()
            .check(&K::group(&()), &K::version(&()), &K::kind(&()))
    }

    /// Typed API across all namespaces (or for a cluster-scoped type)
    pub fn typed_all<K>(&self) -> Result<Api<K>>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
    {
        self.check_typed::<K>()?;
        Ok(Api::all(self.client.clone()))
    }

    /// Typed API in one namespace
    pub fn typed_namespaced<K>(&self, namespace: &str) -> Result<Api<K>>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    {
        self.check_typed::<K>()?;
        Ok(Api::namespaced(self.client.clone(), namespace))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::kubernetes::access::testing::RecordingReviewer;
    use crate::kubernetes::discovery::testing::{StaticTransport, sample_types};
    use http::{Request, Response};
    use kube::client::Body;
    use std::convert::Infallible;
    use std::sync::Mutex;
    use std::task::{Context, Poll};

    /// A request as it reached the (fake) API server
    #[derive(Debug, Clone, PartialEq)]
    pub struct SentRequest {
        pub method: String,
        pub path: String,
        pub user_agent: Option<String>,
    }

    /// Stands in for the API server: records each request and answers
    /// with a ConfigMap
    #[derive(Clone, Default)]
    pub struct ApiRecorder {
        sent: Arc<Mutex<Vec<SentRequest>>>,
    }

    impl ApiRecorder {
        pub fn sent(&self) -> Vec<SentRequest> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl tower::Service<Request<Body>> for ApiRecorder {
        type Response = Response<Body>;
        type Error = Infallible;
        type Future = std::future::Ready<std::result::Result<Response<Body>, Infallible>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, request: Request<Body>) -> Self::Future {
            self.sent.lock().unwrap().push(SentRequest {
                method: request.method().to_string(),
                path: request.uri().path().to_string(),
                user_agent: request
                    .headers()
                    .get(USER_AGENT)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from),
            });
            let body = serde_json::json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": { "name": "settings", "namespace": "default" }
            });
            let response = Response::builder()
                .status(200)
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap();
            std::future::ready(Ok(response))
        }
    }

    /// Install the process crypto provider rustls needs to build clients
    pub fn init_crypto() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }

    /// Factory whose clients talk to an `ApiRecorder`; records connects
    pub struct CountingFactory {
        pub calls: Mutex<Vec<String>>,
        pub transport: Arc<StaticTransport>,
        pub reviewer: Arc<RecordingReviewer>,
        pub api: ApiRecorder,
    }

    impl CountingFactory {
        pub fn new() -> Arc<Self> {
            Self::with_reviewer(RecordingReviewer::allow_all())
        }

        pub fn with_reviewer(reviewer: RecordingReviewer) -> Arc<Self> {
            init_crypto();
            Arc::new(Self {
                calls: Mutex::new(vec![]),
                transport: StaticTransport::new(sample_types()),
                reviewer: Arc::new(reviewer),
                api: ApiRecorder::default(),
            })
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ClientFactory for CountingFactory {
        async fn connect(&self, context: &str, config: &Config) -> Result<Connection> {
            self.calls.lock().unwrap().push(context.to_string());
            // Reject what a live client would reject
            Client::try_from(config.clone())?;
            Ok(Connection {
                client: Client::new(self.api.clone(), config.default_namespace.clone()),
                discovery: self.transport.clone(),
                reviewer: self.reviewer.clone(),
            })
        }
    }

    pub fn test_config(server: &str, namespace: &str) -> Config {
        let mut config = Config::new(server.parse().unwrap());
        config.default_namespace = namespace.to_string();
        apply_timeouts(&mut config);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::config::ResourceRule;
    use crate::kubernetes::access::testing::RecordingReviewer;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
    use kube::api::WatchParams;

    async fn bundle(factory: &CountingFactory, denied: Vec<ResourceRule>) -> ClientBundle {
        build(factory, denied, false).await
    }

    async fn build(factory: &CountingFactory, denied: Vec<ResourceRule>, validation: bool) -> ClientBundle {
        let config = test_config("https://cluster.example:6443", "team-a");
        let connection = factory.connect("test", &config).await.unwrap();
        ClientBundle::new(
            "test",
            config,
            connection,
            Arc::new(PolicySet::new(denied, vec![])),
            Arc::new(EventBus::new()),
            validation,
        )
    }

    fn denied_secrets() -> Vec<ResourceRule> {
        vec![ResourceRule::new("", "v1", "Secret")]
    }

    #[tokio::test]
    async fn test_typed_access_checks_policy() {
        let factory = CountingFactory::new();
        let bundle = bundle(&factory, vec![ResourceRule::new("", "v1", "Secret")]).await;

        let err = bundle.typed_namespaced::<Secret>("default").unwrap_err();
        assert_eq!(err.to_string(), "resource not allowed: /v1, Kind=Secret");
        assert!(bundle.typed_all::<Namespace>().is_ok());
        assert!(bundle.typed_namespaced::<Deployment>("default").is_ok());
    }

    #[tokio::test]
    async fn test_dynamic_access_denied_before_discovery() {
        let factory = CountingFactory::new();
        let bundle = bundle(&factory, vec![ResourceRule::new("", "v1", "Secret")]).await;

        let err = bundle.get("v1", "Secret", Some("default"), "db-password").await.unwrap_err();
        assert!(err.is_policy_denial());
        let err = bundle.delete("v1", "Secret", None, "db-password").await.unwrap_err();
        assert!(err.is_policy_denial());
        let err = bundle
            .list("v1", "Secret", None, &ListParams::default())
            .await
            .unwrap_err();
        assert!(err.is_policy_denial());

        let secret: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": "db-password", "namespace": "default" }
        }))
        .unwrap();
        let err = bundle.create(None, &secret).await.unwrap_err();
        assert!(err.is_policy_denial());

        assert_eq!(factory.transport.calls(), 0);
        assert!(factory.reviewer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_dynamic_api_defaults_namespace() {
        let factory = CountingFactory::new();
        let bundle = bundle(&factory, vec![]).await;

        let (api, resolved) = bundle.dynamic_api("v1", "Pod", None).await.unwrap();
        assert_eq!(resolved.plural(), "pods");
        assert_eq!(api.resource_url(), "/api/v1/namespaces/team-a/pods");

        let (api, _) = bundle.dynamic_api("v1", "Namespace", Some("ignored")).await.unwrap();
        assert_eq!(api.resource_url(), "/api/v1/namespaces");
    }

    #[tokio::test]
    async fn test_list_namespace_fallback() {
        let reviewer = RecordingReviewer::new(|attrs| attrs.resource != "secrets");
        let factory = CountingFactory::with_reviewer(reviewer);
        let bundle = bundle(&factory, vec![]).await;

        let pods = bundle.mapper().rest_mapping("v1", "Pod").await.unwrap();
        assert_eq!(bundle.list_namespace(&pods, None).await.unwrap(), None);

        let secrets = bundle.mapper().rest_mapping("v1", "Secret").await.unwrap();
        assert_eq!(
            bundle.list_namespace(&secrets, None).await.unwrap().as_deref(),
            Some("team-a")
        );

        // Explicit namespace and cluster-scoped types need no review
        assert_eq!(
            bundle.list_namespace(&secrets, Some("other")).await.unwrap().as_deref(),
            Some("other")
        );
        let nodes = bundle.mapper().rest_mapping("v1", "Node").await.unwrap();
        assert_eq!(bundle.list_namespace(&nodes, None).await.unwrap(), None);

        let calls = factory.reviewer.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1], AccessAttributes::new("list", "", "secrets"));
    }

    #[tokio::test]
    async fn test_require_maps_denial_to_forbidden() {
        let reviewer = RecordingReviewer::new(|attrs| attrs.verb == "get");
        let factory = CountingFactory::with_reviewer(reviewer);
        let bundle = bundle(&factory, vec![]).await;

        let get = AccessAttributes::new("get", "", "pods").in_namespace(Some("default"));
        assert!(bundle.can_use(&get).await.unwrap());
        bundle.require(&get).await.unwrap();

        let delete = AccessAttributes::new("delete", "", "pods").in_namespace(Some("default"));
        let err = bundle.require(&delete).await.unwrap_err();
        assert!(matches!(err, GateError::Forbidden(_)));
        assert!(!err.is_policy_denial());

        // Every check is a fresh review
        bundle.can_use(&get).await.unwrap();
        assert_eq!(factory.reviewer.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_raw_client_is_gated() {
        let factory = CountingFactory::new();
        let bundle = bundle(&factory, denied_secrets()).await;

        let secrets: Api<Secret> = Api::namespaced(bundle.client(), "default");
        let err = GateError::from(secrets.get("db-password").await.unwrap_err());
        assert!(err.is_policy_denial());
        let err = GateError::from(secrets.list(&ListParams::default()).await.unwrap_err());
        assert!(err.is_policy_denial());
        let err = GateError::from(
            secrets
                .patch("db-password", &PatchParams::default(), &Patch::Merge(serde_json::json!({})))
                .await
                .unwrap_err(),
        );
        assert!(err.is_policy_denial());
        let err = GateError::from(
            secrets
                .delete_collection(&DeleteParams::default(), &ListParams::default())
                .await
                .unwrap_err(),
        );
        assert!(err.is_policy_denial());
        let watch = Api::<Secret>::all(bundle.client())
            .watch(&WatchParams::default(), "0")
            .await;
        let err = GateError::from(watch.err().unwrap());
        assert!(err.is_policy_denial());
        assert!(factory.api.sent().is_empty());

        let configmaps: Api<ConfigMap> = Api::namespaced(bundle.client(), "default");
        let cm = configmaps.get("settings").await.unwrap();
        assert_eq!(cm.metadata.name.as_deref(), Some("settings"));
        let sent = factory.api.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, "GET");
        assert_eq!(sent[0].path, "/api/v1/namespaces/default/configmaps/settings");
        assert_eq!(sent[0].user_agent, None);
    }

    #[tokio::test]
    async fn test_apply() {
        let factory = CountingFactory::new();
        let bundle = bundle(&factory, denied_secrets()).await;
        let object = |kind: &str| -> DynamicObject {
            serde_json::from_value(serde_json::json!({
                "apiVersion": "v1",
                "kind": kind,
                "metadata": { "name": "settings", "namespace": "default" }
            }))
            .unwrap()
        };

        let err = bundle.apply(None, &object("Secret"), "kubemcp").await.unwrap_err();
        assert!(err.is_policy_denial());

        let applied = bundle.apply(None, &object("ConfigMap"), "kubemcp").await.unwrap();
        assert_eq!(applied.metadata.name.as_deref(), Some("settings"));
        let sent = factory.api.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, "PATCH");
        assert_eq!(sent[0].path, "/api/v1/namespaces/default/configmaps/settings");

        let mut unnamed = object("ConfigMap");
        unnamed.metadata.name = None;
        let err = bundle.apply(None, &unnamed, "kubemcp").await.unwrap_err();
        assert!(matches!(err, GateError::InvalidObject(_)));
    }

    #[tokio::test]
    async fn test_validation_runs_through_client() {
        let reviewer = RecordingReviewer::new(|attrs| attrs.verb != "delete");
        let factory = CountingFactory::with_reviewer(reviewer);
        let bundle = build(&factory, vec![], true).await;
        assert!(bundle.is_validating());

        let configmaps: Api<ConfigMap> = Api::namespaced(bundle.client(), "default");
        let err = GateError::from(
            configmaps
                .delete("settings", &DeleteParams::default())
                .await
                .err()
                .unwrap(),
        );
        match err {
            GateError::Validation(err) => {
                assert_eq!(err.code, crate::kubernetes::ValidationCode::PermissionDenied)
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(factory.api.sent().is_empty());

        configmaps.get("settings").await.unwrap();
        assert_eq!(factory.api.sent().len(), 1);
        assert_eq!(factory.reviewer.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_with_user_agent() {
        let factory = CountingFactory::new();
        let bundle = bundle(&factory, vec![]).await;
        let agent = "kubemcp/0.1.0 (linux/x86_64) agent/1.0";

        let tagged = bundle.with_user_agent(agent).unwrap();
        assert_eq!(tagged.user_agent().unwrap(), agent);
        assert!(bundle.user_agent().is_none());
        assert_eq!(
            tagged
                .config()
                .headers
                .iter()
                .filter(|(name, _)| *name == USER_AGENT)
                .count(),
            1
        );

        let configmaps: Api<ConfigMap> = Api::namespaced(tagged.client(), "default");
        configmaps.get("settings").await.unwrap();
        let configmaps: Api<ConfigMap> = Api::namespaced(bundle.client(), "default");
        configmaps.get("settings").await.unwrap();

        let sent = factory.api.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].user_agent.as_deref(), Some(agent));
        assert_eq!(sent[1].user_agent, None);

        // Tagging reuses the connection and the discovered catalog
        assert_eq!(factory.calls(), vec!["test"]);
        assert_eq!(factory.transport.calls(), 1);

        let retagged = tagged.with_user_agent("kubemcp/0.1.0 (linux/x86_64)").unwrap();
        assert_eq!(
            retagged
                .config()
                .headers
                .iter()
                .filter(|(name, _)| *name == USER_AGENT)
                .count(),
            1
        );
        assert_eq!(retagged.context(), "test");
        assert!(bundle.with_user_agent("bad\nagent").is_err());
    }
}
