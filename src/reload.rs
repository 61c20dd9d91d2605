// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Background reload trigger.
//!
//! Three sources funnel into `Gateway::reload`, which serializes them:
//! - SIGHUP (unix only)
//! - polling the configuration files, drop-in directory and kubeconfig for
//!   content changes
//! - explicit requests through a `ReloadHandle`, which get the result back
//!
//! The trigger task stops once every `ReloadHandle` has been dropped.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::config::drop_in_files;
use crate::error::{GateError, Result};
use crate::gateway::{Gateway, Generation};

type ReloadReply = oneshot::Sender<Result<Arc<Generation>>>;

/// Requests a reload from the running trigger
#[derive(Clone)]
pub struct ReloadHandle {
    requests: mpsc::Sender<ReloadReply>,
}

impl ReloadHandle {
    /// Reload now and wait for the outcome
    pub async fn reload(&self) -> Result<Arc<Generation>> {
        let (reply, outcome) = oneshot::channel();
        self.requests
            .send(reply)
            .await
            .map_err(|_| GateError::ReloaderStopped)?;
        outcome.await.map_err(|_| GateError::ReloaderStopped)?
    }
}

/// Content fingerprint of everything that feeds a generation
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint(Vec<(PathBuf, Option<u64>)>);

async fn hash_file(path: &Path) -> Option<u64> {
    let contents = tokio::fs::read(path).await.ok()?;
    let mut hasher = DefaultHasher::new();
    contents.hash(&mut hasher);
    Some(hasher.finish())
}

async fn fingerprint(paths: &[PathBuf]) -> Fingerprint {
    let mut entries = Vec::new();
    for path in paths {
        if tokio::fs::metadata(path).await.is_ok_and(|m| m.is_dir()) {
            match drop_in_files(path).await {
                Ok(files) => {
                    for file in files {
                        let hash = hash_file(&file).await;
                        entries.push((file, hash));
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to list drop-in directory"),
            }
        } else {
            // A missing file is recorded too, so deletion counts as a change
            entries.push((path.clone(), hash_file(path).await));
        }
    }
    Fingerprint(entries)
}

/// Files and directories whose contents feed the current generation
fn watched_paths(gateway: &Gateway) -> Vec<PathBuf> {
    let mut paths = gateway.store().sources().watched_paths();
    if let Some(kubeconfig) = &gateway.current().config().kubeconfig {
        paths.push(kubeconfig.clone());
    }
    paths
}

#[cfg(unix)]
struct Hangup(Option<tokio::signal::unix::Signal>);

#[cfg(unix)]
impl Hangup {
    fn new() -> Self {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::hangup()) {
            Ok(signal) => Self(Some(signal)),
            Err(e) => {
                warn!(error = %e, "Failed to install SIGHUP handler");
                Self(None)
            }
        }
    }

    async fn recv(&mut self) {
        if let Some(signal) = &mut self.0
            && signal.recv().await.is_some()
        {
            return;
        }
        // Handler missing or the signal stream ended
        std::future::pending().await
    }
}

#[cfg(not(unix))]
struct Hangup;

#[cfg(not(unix))]
impl Hangup {
    fn new() -> Self {
        Self
    }

    async fn recv(&mut self) {
        std::future::pending().await
    }
}

pub struct ReloadTrigger {
    gateway: Arc<Gateway>,
    interval: Duration,
    listen_hangup: bool,
}

impl ReloadTrigger {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        let interval = Duration::from_millis(gateway.current().config().watch_interval_ms.max(1));
        Self {
            gateway,
            interval,
            listen_hangup: true,
        }
    }

    /// Poll interval override
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Do not install the SIGHUP handler
    pub fn without_hangup(mut self) -> Self {
        self.listen_hangup = false;
        self
    }

    pub fn spawn(self) -> (ReloadHandle, JoinHandle<()>) {
        let (requests, rx) = mpsc::channel(8);
        let task = tokio::spawn(self.run(rx));
        (ReloadHandle { requests }, task)
    }

    async fn reload(&self, reason: &str) -> Result<Arc<Generation>> {
        info!(reason, "Reloading configuration");
        let result = self.gateway.reload().await;
        if let Err(e) = &result {
            warn!(reason, error = %e, "Configuration reload failed");
        }
        result
    }

    async fn run(self, mut requests: mpsc::Receiver<ReloadReply>) {
        let mut hangup = if self.listen_hangup {
            Some(Hangup::new())
        } else {
            None
        };

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut watched = watched_paths(&self.gateway);
        let mut last = fingerprint(&watched).await;
        debug!(paths = ?watched, interval_ms = self.interval.as_millis() as u64, "Watching configuration");

        loop {
            let reloaded = tokio::select! {
                _ = async {
                    match hangup.as_mut() {
                        Some(hangup) => hangup.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    let _ = self.reload("SIGHUP").await;
                    true
                }
                _ = ticker.tick() => {
                    let current = fingerprint(&watched).await;
                    if current == last {
                        trace!("Configuration unchanged");
                        false
                    } else {
                        let _ = self.reload("files changed").await;
                        true
                    }
                }
                request = requests.recv() => match request {
                    Some(reply) => {
                        let _ = reply.send(self.reload("requested").await);
                        true
                    }
                    None => break,
                },
            };

            if reloaded {
                // The kubeconfig path may have moved with the new settings
                watched = watched_paths(&self.gateway);
                last = fingerprint(&watched).await;
            }
        }
        debug!("Reload trigger stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::Fixture;
    use std::fs;

    #[tokio::test]
    async fn test_fingerprint_tracks_contents() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("config.toml");
        fs::write(&file, "log_level = 1").unwrap();
        let drop_ins = dir.path().join("conf.d");
        fs::create_dir(&drop_ins).unwrap();
        let paths = vec![file.clone(), drop_ins.clone()];

        let first = fingerprint(&paths).await;
        assert_eq!(first, fingerprint(&paths).await);

        fs::write(&file, "log_level = 2").unwrap();
        let second = fingerprint(&paths).await;
        assert_ne!(first, second);

        fs::write(drop_ins.join("10-a.toml"), "read_only = true").unwrap();
        let third = fingerprint(&paths).await;
        assert_ne!(second, third);

        fs::remove_file(&file).unwrap();
        assert_ne!(third, fingerprint(&paths).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fingerprint_follows_mounted_links() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::TempDir::new().unwrap();
        let drop_ins = dir.path().join("conf.d");
        fs::create_dir(&drop_ins).unwrap();
        let v1 = dir.path().join("v1");
        let v2 = dir.path().join("v2");
        fs::create_dir(&v1).unwrap();
        fs::create_dir(&v2).unwrap();
        fs::write(v1.join("level.toml"), "log_level = 1").unwrap();
        fs::write(v2.join("level.toml"), "log_level = 2").unwrap();

        // Kubelet swaps a data link when a mounted ConfigMap changes
        let data = drop_ins.join("..data");
        symlink(&v1, &data).unwrap();
        symlink("..data/level.toml", drop_ins.join("10-level.toml")).unwrap();
        let paths = vec![drop_ins.clone()];

        let before = fingerprint(&paths).await;
        assert_eq!(before.0.len(), 1);

        fs::remove_file(&data).unwrap();
        symlink(&v2, &data).unwrap();
        assert_ne!(before, fingerprint(&paths).await);
    }

    #[tokio::test]
    async fn test_requested_reload_returns_result() {
        let fixture = Fixture::new("");
        let gateway = Arc::new(fixture.gateway().await);
        let (handle, task) = ReloadTrigger::new(gateway.clone())
            .with_interval(Duration::from_secs(3600))
            .without_hangup()
            .spawn();

        let generation = handle.reload().await.unwrap();
        assert_eq!(generation.version(), 2);

        fixture.write_drop_in("10-broken.toml", "toolsets = [");
        let err = handle.reload().await.err().unwrap();
        assert!(matches!(err, GateError::Reload(_)));
        assert_eq!(gateway.current().version(), 2);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_file_change_triggers_reload() {
        let fixture = Fixture::new("");
        let gateway = Arc::new(fixture.gateway().await);
        let mut generations = gateway.subscribe();
        let (handle, task) = ReloadTrigger::new(gateway.clone())
            .with_interval(Duration::from_millis(20))
            .without_hangup()
            .spawn();

        // Let the trigger take its initial fingerprint
        tokio::time::sleep(Duration::from_millis(100)).await;
        fixture.write_drop_in("10-ro.toml", "read_only = true");

        tokio::time::timeout(Duration::from_secs(10), generations.changed())
            .await
            .unwrap()
            .unwrap();
        let generation = gateway.current();
        assert!(generation.config().read_only);
        assert!(!generation.operations.contains("pods_delete"));

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stopped_trigger() {
        let fixture = Fixture::new("");
        let gateway = Arc::new(fixture.gateway().await);
        let (handle, task) = ReloadTrigger::new(gateway).without_hangup().spawn();
        task.abort();
        let _ = task.await;

        assert!(matches!(
            handle.reload().await.err().unwrap(),
            GateError::ReloaderStopped
        ));
    }
}
