// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Live RBAC checks via SelfSubjectAccessReview.
//!
//! Decisions are never cached: every call is one round-trip to the API
//! server, so a revoked permission takes effect immediately.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use kube::api::PostParams;
use kube::{Api, Client};
use tracing::debug;

use crate::error::Result;

/// The `{verb, group, resource, namespace, name}` tuple being checked
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessAttributes {
    pub verb: String,
    pub group: String,
    pub resource: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

impl AccessAttributes {
    pub fn new(verb: &str, group: &str, resource: &str) -> Self {
        Self {
            verb: verb.to_string(),
            group: group.to_string(),
            resource: resource.to_string(),
            namespace: None,
            name: None,
        }
    }

    pub fn in_namespace(mut self, namespace: Option<&str>) -> Self {
        self.namespace = namespace.filter(|ns| !ns.is_empty()).map(String::from);
        self
    }

    pub fn named(mut self, name: Option<&str>) -> Self {
        self.name = name.filter(|n| !n.is_empty()).map(String::from);
        self
    }

    fn to_review(&self) -> SelfSubjectAccessReview {
        SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    verb: Some(self.verb.clone()),
                    group: Some(self.group.clone()),
                    resource: Some(self.resource.clone()),
                    namespace: self.namespace.clone(),
                    name: self.name.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

impl fmt::Display for AccessAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.verb, self.resource)?;
        if !self.group.is_empty() {
            write!(f, ".{}", self.group)?;
        }
        if let Some(name) = &self.name {
            write!(f, " \"{}\"", name)?;
        }
        match &self.namespace {
            Some(ns) => write!(f, " in namespace \"{}\"", ns),
            None => write!(f, " at cluster scope"),
        }
    }
}

/// Asks the cluster whether the bound identity may perform an action
#[async_trait]
pub trait AccessReviewer: Send + Sync {
    async fn review(&self, attrs: &AccessAttributes) -> Result<bool>;
}

/// Reviewer issuing a SelfSubjectAccessReview with the bundle's own client
pub struct SelfSubjectReviewer {
    client: Client,
}

impl SelfSubjectReviewer {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AccessReviewer for SelfSubjectReviewer {
    async fn review(&self, attrs: &AccessAttributes) -> Result<bool> {
        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let response = api.create(&PostParams::default(), &attrs.to_review()).await?;
        let allowed = response.status.is_some_and(|s| s.allowed);
        debug!(access = %attrs, allowed, "SelfSubjectAccessReview");
        Ok(allowed)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Reviewer answering from a fixed rule and recording every call
    pub struct RecordingReviewer {
        decide: Box<dyn Fn(&AccessAttributes) -> bool + Send + Sync>,
        calls: Mutex<Vec<AccessAttributes>>,
    }

    impl RecordingReviewer {
        pub fn new(decide: impl Fn(&AccessAttributes) -> bool + Send + Sync + 'static) -> Self {
            Self {
                decide: Box::new(decide),
                calls: Mutex::new(vec![]),
            }
        }

        pub fn allow_all() -> Self {
            Self::new(|_| true)
        }

        pub fn calls(&self) -> Vec<AccessAttributes> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AccessReviewer for RecordingReviewer {
        async fn review(&self, attrs: &AccessAttributes) -> Result<bool> {
            self.calls.lock().unwrap().push(attrs.clone());
            Ok((self.decide)(attrs))
        }
    }
}
