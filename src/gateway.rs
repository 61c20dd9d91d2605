// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Configuration generations and per-request scopes.
//!
//! A `Generation` bundles everything derived from one configuration
//! snapshot: the policy set, the context manager with its bundle cache, and
//! the active operation set. A reload builds a complete new generation and
//! swaps it in; requests hold the generation they started with until they
//! finish.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info};

use crate::catalog::{ActiveOperations, OperationRegistry};
use crate::config::{ConfigSnapshot, ConfigStore, ProviderStrategy, StaticConfig};
use crate::error::{GateError, Result};
use crate::events::EventBus;
use crate::identity::{CallerInfo, EffectiveIdentity};
use crate::kubernetes::{ClientBundle, ClientFactory, ContextManager, PolicySet};

/// Called with the new `log_level` after every successful reload
pub type LogLevelHook = Box<dyn Fn(u8) + Send + Sync>;

pub struct Generation {
    pub snapshot: Arc<ConfigSnapshot>,
    pub policy: Arc<PolicySet>,
    pub contexts: Arc<ContextManager>,
    pub operations: Arc<ActiveOperations>,
}

impl Generation {
    pub fn version(&self) -> u64 {
        self.snapshot.version
    }

    pub fn config(&self) -> &StaticConfig {
        &self.snapshot.merged
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config().request_timeout_secs)
    }
}

/// Components derived from settings, before the snapshot is committed
struct Derived {
    policy: Arc<PolicySet>,
    contexts: Arc<ContextManager>,
    operations: Arc<ActiveOperations>,
}

impl Derived {
    fn into_generation(self, snapshot: Arc<ConfigSnapshot>) -> Generation {
        Generation {
            snapshot,
            policy: self.policy,
            contexts: self.contexts,
            operations: self.operations,
        }
    }
}

pub struct Gateway {
    store: ConfigStore,
    current: watch::Sender<Arc<Generation>>,
    factory: Arc<dyn ClientFactory>,
    registry: OperationRegistry,
    /// Default context chosen on the command line or switched at runtime
    default_context: RwLock<Option<String>>,
    events: Arc<EventBus>,
    log_level_hook: Option<LogLevelHook>,
}

impl Gateway {
    pub async fn open(
        store: ConfigStore,
        factory: Arc<dyn ClientFactory>,
        registry: OperationRegistry,
        context: Option<String>,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        let snapshot = store.current_snapshot();
        let derived = derive(
            &snapshot.merged,
            context.as_deref(),
            &factory,
            &registry,
            &events,
        )?;
        let (current, _) = watch::channel(Arc::new(derived.into_generation(snapshot)));

        Ok(Self {
            store,
            current,
            factory,
            registry,
            default_context: RwLock::new(context),
            events,
            log_level_hook: None,
        })
    }

    pub fn with_log_level_hook(mut self, hook: LogLevelHook) -> Self {
        self.log_level_hook = Some(hook);
        self
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The latest generation, never partially built
    pub fn current(&self) -> Arc<Generation> {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Generation>> {
        self.current.subscribe()
    }

    /// Re-read configuration and swap in a new generation.
    /// On failure the current generation stays active.
    pub async fn reload(&self) -> Result<Arc<Generation>> {
        let guard = self.store.begin().await;
        // Held until the swap so a concurrent default switch lands before or after
        let context = self.default_context.read().await;

        let prepared = async {
            let snapshot = guard.load().await?;
            let derived = derive(
                &snapshot.merged,
                context.as_deref(),
                &self.factory,
                &self.registry,
                &self.events,
            )?;
            Ok::<_, GateError>((snapshot, derived))
        }
        .await;

        let (snapshot, derived) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.events.reload_failed(&e);
                return Err(e);
            }
        };

        let snapshot = guard.commit(snapshot);
        let generation = Arc::new(derived.into_generation(snapshot));
        self.current.send_replace(generation.clone());
        drop(context);

        if let Some(hook) = &self.log_level_hook {
            hook(generation.config().log_level);
        }
        info!(
            version = generation.version(),
            operations = generation.operations.len(),
            "Activated configuration generation"
        );
        self.events.reloaded(generation.version());
        Ok(generation)
    }

    /// Switch the default context of the current generation; kept across reloads
    pub async fn switch_default(&self, name: &str) -> Result<()> {
        let mut default_context = self.default_context.write().await;
        self.current().contexts.switch_default(name).await?;
        *default_context = Some(name.to_string());
        Ok(())
    }

    /// Capture the current generation and the caller's identity
    pub fn begin_request(
        &self,
        headers: &HeaderMap,
        context: Option<&str>,
        caller: Option<&CallerInfo>,
    ) -> Result<RequestScope> {
        let generation = self.current();
        let identity = EffectiveIdentity::from_request(headers, context, caller)?;

        if generation.config().cluster_provider_strategy == ProviderStrategy::AuthHeaders
            && identity.cluster_override.is_none()
        {
            return Err(GateError::MissingClusterOverride);
        }

        debug!(
            version = generation.version(),
            context = %identity.context,
            user_agent = %identity.user_agent,
            override_headers = identity.cluster_override.is_some(),
            "Request scope"
        );
        Ok(RequestScope {
            generation,
            identity,
        })
    }
}

fn derive(
    config: &StaticConfig,
    context: Option<&str>,
    factory: &Arc<dyn ClientFactory>,
    registry: &OperationRegistry,
    events: &Arc<EventBus>,
) -> Result<Derived> {
    let policy = Arc::new(PolicySet::from_config(config));
    let contexts = ContextManager::from_settings(
        config,
        context,
        factory.clone(),
        policy.clone(),
        events.clone(),
    )?;
    Ok(Derived {
        policy,
        contexts: Arc::new(contexts),
        operations: Arc::new(registry.activate(config)),
    })
}

/// One inbound request: the generation it was accepted under and its identity
pub struct RequestScope {
    generation: Arc<Generation>,
    identity: EffectiveIdentity,
}

impl RequestScope {
    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    pub fn identity(&self) -> &EffectiveIdentity {
        &self.identity
    }

    pub fn is_operation_active(&self, name: &str) -> bool {
        self.generation.operations.contains(name)
    }

    /// Client bundle for this request, tagged with the request's user agent.
    ///
    /// Override headers take precedence, then an OAuth bearer token, then the
    /// cached bundle of the requested context.
    pub async fn bundle(&self) -> Result<ClientBundle> {
        let contexts = &self.generation.contexts;
        let identity = &self.identity;

        if let Some(cluster) = &identity.cluster_override {
            let bundle = contexts.derive_with_override(cluster).await?;
            return bundle.with_user_agent(&identity.user_agent);
        }
        if let Some(token) = &identity.bearer_token {
            let bundle = contexts.derive_with_bearer(&identity.context, token).await?;
            return bundle.with_user_agent(&identity.user_agent);
        }
        contexts
            .resolve(&identity.context)
            .await?
            .with_user_agent(&identity.user_agent)
    }

    /// Run a cluster call under the generation's request timeout.
    /// Dropping the returned future cancels the call.
    pub async fn run<F, T>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout = self.generation.request_timeout();
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| GateError::Timeout(timeout))?
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::ConfigSources;
    use crate::kubernetes::client::testing::CountingFactory;
    use crate::kubernetes::context::testing::TWO_CONTEXTS;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    pub struct Fixture {
        pub dir: TempDir,
        pub factory: Arc<CountingFactory>,
    }

    impl Fixture {
        pub fn new(extra: &str) -> Self {
            let dir = TempDir::new().unwrap();
            let kubeconfig = dir.path().join("kubeconfig");
            fs::write(&kubeconfig, TWO_CONTEXTS).unwrap();
            fs::create_dir(dir.path().join("conf.d")).unwrap();
            fs::write(
                dir.path().join("config.toml"),
                format!(
                    "kubeconfig = {:?}\ncluster_provider_strategy = \"kubeconfig\"\n{}",
                    kubeconfig, extra
                ),
            )
            .unwrap();
            Self {
                dir,
                factory: CountingFactory::new(),
            }
        }

        pub fn primary(&self) -> PathBuf {
            self.dir.path().join("config.toml")
        }

        pub fn write_drop_in(&self, name: &str, content: &str) {
            fs::write(self.dir.path().join("conf.d").join(name), content).unwrap();
        }

        pub async fn gateway(&self) -> Gateway {
            let store = ConfigStore::open(ConfigSources::new(Some(self.primary()), None))
                .await
                .unwrap();
            Gateway::open(
                store,
                self.factory.clone(),
                OperationRegistry::with_defaults(),
                None,
                Arc::new(EventBus::new()),
            )
            .await
            .unwrap()
        }
    }
}
