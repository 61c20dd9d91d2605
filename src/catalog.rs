// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Registered operations and the subset a configuration exposes.
//!
//! Operation handlers live outside this crate; they register a descriptor
//! carrying the flags the filters need. The active set is computed once per
//! configuration generation.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::config::StaticConfig;

/// Known operation groups
pub const TOOLSETS: &[&str] = &["core", "config", "helm"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDescriptor {
    pub name: String,
    pub toolset: String,
    /// Never modifies cluster state
    pub read_only: bool,
    /// May delete or overwrite cluster state
    pub destructive: bool,
}

impl OperationDescriptor {
    pub fn read(name: &str, toolset: &str) -> Self {
        Self {
            name: name.to_string(),
            toolset: toolset.to_string(),
            read_only: true,
            destructive: false,
        }
    }

    pub fn write(name: &str, toolset: &str, destructive: bool) -> Self {
        Self {
            name: name.to_string(),
            toolset: toolset.to_string(),
            read_only: false,
            destructive,
        }
    }

    fn is_applicable(&self, config: &StaticConfig) -> bool {
        if !config.toolsets.iter().any(|t| *t == self.toolset) {
            return false;
        }
        if config.read_only && !self.read_only {
            return false;
        }
        if config.disable_destructive && self.destructive {
            return false;
        }
        if !config.enabled_tools.is_empty() && !config.enabled_tools.contains(&self.name) {
            return false;
        }
        !config.disabled_tools.contains(&self.name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct OperationRegistry {
    operations: Vec<OperationDescriptor>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the standard cluster operations
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for op in [
            OperationDescriptor::read("configuration_view", "config"),
            OperationDescriptor::read("configuration_contexts_list", "config"),
            OperationDescriptor::read("events_list", "core"),
            OperationDescriptor::read("namespaces_list", "core"),
            OperationDescriptor::read("pods_list", "core"),
            OperationDescriptor::read("pods_list_in_namespace", "core"),
            OperationDescriptor::read("pods_get", "core"),
            OperationDescriptor::read("pods_log", "core"),
            OperationDescriptor::read("pods_top", "core"),
            OperationDescriptor::write("pods_delete", "core", true),
            OperationDescriptor::write("pods_exec", "core", true),
            OperationDescriptor::write("pods_run", "core", false),
            OperationDescriptor::read("resources_list", "core"),
            OperationDescriptor::read("resources_get", "core"),
            OperationDescriptor::write("resources_create_or_update", "core", true),
            OperationDescriptor::write("resources_delete", "core", true),
            OperationDescriptor::read("helm_list", "helm"),
            OperationDescriptor::write("helm_install", "helm", false),
            OperationDescriptor::write("helm_uninstall", "helm", true),
        ] {
            registry.register(op);
        }
        registry
    }

    /// Add or replace a descriptor
    pub fn register(&mut self, op: OperationDescriptor) {
        self.operations.retain(|existing| existing.name != op.name);
        self.operations.push(op);
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Operations exposed under `config`
    pub fn activate(&self, config: &StaticConfig) -> ActiveOperations {
        for toolset in &config.toolsets {
            if !TOOLSETS.contains(&toolset.as_str()) {
                warn!(toolset = %toolset, "Unknown toolset in configuration");
            }
        }

        let operations: BTreeMap<_, _> = self
            .operations
            .iter()
            .filter(|op| op.is_applicable(config))
            .map(|op| (op.name.clone(), op.clone()))
            .collect();
        debug!(
            registered = self.operations.len(),
            active = operations.len(),
            "Computed active operations"
        );
        ActiveOperations { operations }
    }
}

/// Immutable set of operations for one generation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveOperations {
    operations: BTreeMap<String, OperationDescriptor>,
}

impl ActiveOperations {
    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&OperationDescriptor> {
        self.operations.get(name)
    }

    /// Names in sorted order
    pub fn names(&self) -> Vec<&str> {
        self.operations.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
