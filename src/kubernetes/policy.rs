// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Allow/deny policy over resource types.
//!
//! A `PolicySet` is built once per configuration generation and never
//! mutated; a reload builds a new one.

use crate::config::{ResourceRule, StaticConfig};
use crate::error::{GateError, Result};

const WILDCARD: &str = "*";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySet {
    denied: Vec<ResourceRule>,
    allowed: Vec<ResourceRule>,
}

fn field_matches(rule: &str, value: &str) -> bool {
    rule == WILDCARD || rule == value
}

/// Kinds compare case-insensitively, like kind lookups do
fn kind_matches(rule: &str, kind: &str) -> bool {
    rule == WILDCARD || rule.eq_ignore_ascii_case(kind)
}

/// Rule with an explicit kind: all three fields must match
fn matches_exact(rule: &ResourceRule, group: &str, version: &str, kind: &str) -> bool {
    !rule.kind.is_empty()
        && field_matches(&rule.group, group)
        && field_matches(&rule.version, version)
        && kind_matches(&rule.kind, kind)
}

/// Rule without a kind: covers the whole group/version
fn matches_group_version(rule: &ResourceRule, group: &str, version: &str) -> bool {
    rule.kind.is_empty() && field_matches(&rule.group, group) && field_matches(&rule.version, version)
}

fn matches_any(rules: &[ResourceRule], group: &str, version: &str, kind: &str) -> bool {
    rules.iter().any(|r| matches_exact(r, group, version, kind))
        || rules.iter().any(|r| matches_group_version(r, group, version))
}

impl PolicySet {
    pub fn new(denied: Vec<ResourceRule>, allowed: Vec<ResourceRule>) -> Self {
        Self { denied, allowed }
    }

    pub fn from_config(config: &StaticConfig) -> Self {
        Self::new(config.denied_resources.clone(), config.allowed_resources.clone())
    }

    /// Policy that permits everything
    pub fn permissive() -> Self {
        Self::default()
    }

    pub fn denied(&self) -> &[ResourceRule] {
        &self.denied
    }

    pub fn allowed(&self) -> &[ResourceRule] {
        &self.allowed
    }

    /// True when the type may be used
    pub fn is_allowed(&self, group: &str, version: &str, kind: &str) -> bool {
        if matches_any(&self.denied, group, version, kind) {
            return false;
        }
        self.allowed.is_empty() || matches_any(&self.allowed, group, version, kind)
    }

    /// Err with the stable "resource not allowed" text when the type is denied
    pub fn check(&self, group: &str, version: &str, kind: &str) -> Result<()> {
        if self.is_allowed(group, version, kind) {
            Ok(())
        } else {
            Err(GateError::not_allowed(group, version, kind))
        }
    }
}
