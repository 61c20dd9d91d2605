// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! REST mapping that refuses denied types before touching discovery.

use std::sync::Arc;

use tracing::debug;

use super::discovery::{DiscoveredType, FilteredDiscovery, TypeCatalog};
use crate::error::{GateError, Result};

/// Split `apps/v1` into `("apps", "v1")`, `v1` into `("", "v1")`
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    api_version.split_once('/').unwrap_or(("", api_version))
}

pub struct FilteredRestMapper {
    discovery: Arc<FilteredDiscovery>,
}

impl FilteredRestMapper {
    pub fn new(discovery: Arc<FilteredDiscovery>) -> Self {
        Self { discovery }
    }

    /// Resolve an `{apiVersion, kind}` pair as given by a caller
    pub async fn rest_mapping(&self, api_version: &str, kind: &str) -> Result<DiscoveredType> {
        let (group, version) = split_api_version(api_version);
        self.rest_mapping_gvk(group, version, kind).await
    }

    pub async fn rest_mapping_gvk(&self, group: &str, version: &str, kind: &str) -> Result<DiscoveredType> {
        self.discovery.policy().check(group, version, kind)?;

        let found = self
            .lookup(|catalog| catalog.find_kind(group, version, kind).cloned())
            .await?
            .ok_or_else(|| GateError::NoKindMatch {
                group: group.to_string(),
                version: version.to_string(),
                kind: kind.to_string(),
            })?;
        // The lookup is case-insensitive; judge the kind the server uses
        self.discovery.policy().check(found.group(), found.version(), found.kind())?;
        Ok(found)
    }

    /// Map a plural resource name to its type; the policy applies to the kind
    pub async fn kind_for(&self, group: &str, version: &str, resource: &str) -> Result<DiscoveredType> {
        let found = self
            .lookup(|catalog| catalog.find_resource(group, version, resource).cloned())
            .await?
            .ok_or_else(|| GateError::NoResourceMatch {
                group: group.to_string(),
                version: version.to_string(),
                resource: resource.to_string(),
            })?;
        self.discovery.policy().check(found.group(), found.version(), found.kind())?;
        Ok(found)
    }

    /// Invalidate the discovery cache
    pub async fn reset(&self) {
        self.discovery.reset().await;
    }

    /// Look up in the catalog; a miss on a cached catalog refreshes it once
    async fn lookup<F>(&self, find: F) -> Result<Option<DiscoveredType>>
    where
        F: Fn(&TypeCatalog) -> Option<DiscoveredType>,
    {
        let (catalog, cached) = self.discovery.catalog().await?;
        if let Some(found) = find(&catalog) {
            return Ok(Some(found));
        }
        if !cached {
            return Ok(None);
        }

        debug!("Type not in cached catalog, refreshing discovery");
        self.discovery.reset().await;
        let (catalog, _) = self.discovery.catalog().await?;
        Ok(find(&catalog))
    }
}
