// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Lifecycle events for connection, discovery and reloads
//!
//! Best-effort side channel: sends never block and are dropped when nobody
//! is subscribed.

use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;

#[derive(Clone, Debug, PartialEq)]
pub enum GatewayEvent {
    // === Connection/Discovery phases ===
    /// Building clients for a context
    Connecting { context: String },
    /// Client bundle for a context is ready
    Connected { context: String, elapsed_ms: u64 },
    /// Fetching the server type catalog
    Discovering { context: String },
    DiscoveryComplete {
        context: String,
        type_count: usize,
        elapsed_ms: u64,
    },

    // === Configuration phases ===
    ContextSwitched { from: String, to: String },
    /// A new generation is active
    ConfigReloaded { version: u64 },
    /// The previous generation is still active
    ReloadFailed { error: String },
}

pub struct EventBus {
    sender: broadcast::Sender<GatewayEvent>,
    reloads_ok: AtomicUsize,
    reloads_failed: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(100);
        Self {
            sender,
            reloads_ok: AtomicUsize::new(0),
            reloads_failed: AtomicUsize::new(0),
        }
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: GatewayEvent) {
        match &event {
            GatewayEvent::ConfigReloaded { .. } => {
                self.reloads_ok.fetch_add(1, Ordering::SeqCst);
            }
            GatewayEvent::ReloadFailed { .. } => {
                self.reloads_failed.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
        let _ = self.sender.send(event);
    }

    /// Report a successful reload
    pub fn reloaded(&self, version: u64) {
        self.emit(GatewayEvent::ConfigReloaded { version });
    }

    /// Report a failed reload
    pub fn reload_failed(&self, error: &dyn std::fmt::Display) {
        self.emit(GatewayEvent::ReloadFailed {
            error: error.to_string(),
        });
    }

    /// (successful, failed) reload counts since start
    pub fn reload_stats(&self) -> (usize, usize) {
        (
            self.reloads_ok.load(Ordering::SeqCst),
            self.reloads_failed.load(Ordering::SeqCst),
        )
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_bus_default() {
        let bus = EventBus::default();
        assert_eq!(bus.reload_stats(), (0, 0));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        bus.emit(GatewayEvent::Connecting {
            context: "a".to_string(),
        });
        bus.reloaded(2);
        assert_eq!(bus.reload_stats(), (1, 0));
    }

    #[test]
    fn test_reload_counters() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.reloaded(2);
        bus.reload_failed(&"bad fragment");
        bus.reloaded(3);
        assert_eq!(bus.reload_stats(), (2, 1));

        let updates: Vec<_> = std::iter::from_fn(|| receiver.try_recv().ok()).collect();
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0], GatewayEvent::ConfigReloaded { version: 2 });
        assert!(matches!(
            &updates[1],
            GatewayEvent::ReloadFailed { error } if error == "bad fragment"
        ));
    }

    #[test]
    fn test_subscribe_receives_context_events() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.emit(GatewayEvent::Connecting {
            context: "prod".to_string(),
        });
        bus.emit(GatewayEvent::Connected {
            context: "prod".to_string(),
            elapsed_ms: 12,
        });
        bus.emit(GatewayEvent::ContextSwitched {
            from: "prod".to_string(),
            to: "staging".to_string(),
        });

        let updates: Vec<_> = std::iter::from_fn(|| receiver.try_recv().ok()).collect();
        assert!(matches!(updates[0], GatewayEvent::Connecting { .. }));
        assert!(matches!(updates[1], GatewayEvent::Connected { elapsed_ms: 12, .. }));
        assert!(matches!(updates[2], GatewayEvent::ContextSwitched { .. }));
    }
}
