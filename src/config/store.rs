// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Versioned configuration store
//!
//! Readers get an `Arc<ConfigSnapshot>` without blocking. Reloads are
//! serialized, build a complete snapshot off to the side, and only then
//! publish it. A failed reload leaves the previous snapshot in place.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, watch};
use tracing::{info, warn};

use super::{ConfigError, ConfigSnapshot, ConfigSources, load};

pub struct ConfigStore {
    sources: ConfigSources,
    current: watch::Sender<Arc<ConfigSnapshot>>,
    reload_lock: Mutex<()>,
}

/// Exclusive reload permit. Holding it keeps other reloads waiting until the
/// snapshot is committed or the guard is dropped.
pub struct ReloadGuard<'a> {
    store: &'a ConfigStore,
    _permit: MutexGuard<'a, ()>,
}

impl ConfigStore {
    /// Load every source and start at version 1
    pub async fn open(sources: ConfigSources) -> Result<Self, ConfigError> {
        let mut snapshot = load(&sources).await?;
        snapshot.version = 1;
        Ok(Self::with_snapshot(sources, snapshot))
    }

    /// Store seeded with an already built snapshot
    pub fn with_snapshot(sources: ConfigSources, snapshot: ConfigSnapshot) -> Self {
        let (current, _) = watch::channel(Arc::new(snapshot));
        Self {
            sources,
            current,
            reload_lock: Mutex::new(()),
        }
    }

    pub fn sources(&self) -> &ConfigSources {
        &self.sources
    }

    /// The latest committed snapshot
    pub fn current_snapshot(&self) -> Arc<ConfigSnapshot> {
        self.current.borrow().clone()
    }

    /// Notified on every committed reload
    pub fn subscribe(&self) -> watch::Receiver<Arc<ConfigSnapshot>> {
        self.current.subscribe()
    }

    /// Wait for exclusive reload access
    pub async fn begin(&self) -> ReloadGuard<'_> {
        ReloadGuard {
            store: self,
            _permit: self.reload_lock.lock().await,
        }
    }

    /// Re-read all sources and publish the result
    pub async fn reload(&self) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        let guard = self.begin().await;
        let snapshot = guard.load().await?;
        Ok(guard.commit(snapshot))
    }
}

impl ReloadGuard<'_> {
    /// Read the sources; nothing is published yet
    pub async fn load(&self) -> Result<ConfigSnapshot, ConfigError> {
        match load(&self.store.sources).await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                warn!(
                    version = self.store.current.borrow().version,
                    error = %e,
                    "Configuration reload failed, keeping current version"
                );
                Err(e)
            }
        }
    }

    /// Publish `snapshot` as the next version
    pub fn commit(self, mut snapshot: ConfigSnapshot) -> Arc<ConfigSnapshot> {
        snapshot.version = self.store.current.borrow().version + 1;
        let snapshot = Arc::new(snapshot);
        self.store.current.send_replace(snapshot.clone());
        info!(version = snapshot.version, "Configuration reloaded");
        snapshot
    }
}
