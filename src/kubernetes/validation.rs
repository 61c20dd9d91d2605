// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Pre-flight request validation.
//!
//! When enabled, every resource request that passed the policy gate runs
//! through a chain of validators before it is sent. The first failure
//! aborts the request with a coded `ValidationError`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use super::access::{AccessAttributes, AccessReviewer};
use super::discovery::DiscoveredType;
use super::gate::ApiPath;
use crate::error::{Result, api_version};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationCode {
    ResourceNotFound,
    InvalidField,
    PermissionDenied,
    InvalidManifest,
}

impl ValidationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResourceNotFound => "RESOURCE_NOT_FOUND",
            Self::InvalidField => "INVALID_FIELD",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::InvalidManifest => "INVALID_MANIFEST",
        }
    }
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Validation Error [{code}]: {message}{}", field_suffix(.field))]
pub struct ValidationError {
    pub code: ValidationCode,
    pub message: String,
    pub field: Option<String>,
}

fn field_suffix(field: &Option<String>) -> String {
    match field {
        Some(field) => format!("\n  Field: {}", field),
        None => String::new(),
    }
}

impl ValidationError {
    pub fn resource_not_found(api_version: &str, resource: &str) -> Self {
        Self {
            code: ValidationCode::ResourceNotFound,
            message: format!("Resource {}/{} does not exist in the cluster", api_version, resource),
            field: None,
        }
    }

    pub fn invalid_field(field: &str, kind: &str) -> Self {
        Self {
            code: ValidationCode::InvalidField,
            message: format!("Invalid field \"{}\" in {}", field, kind),
            field: Some(field.to_string()),
        }
    }

    pub fn permission_denied(verb: &str, resource: &str, namespace: Option<&str>) -> Self {
        let message = match namespace {
            Some(ns) => format!("Cannot {} {} in namespace \"{}\"", verb, resource, ns),
            None => format!("Cannot {} {} (cluster-scoped)", verb, resource),
        };
        Self {
            code: ValidationCode::PermissionDenied,
            message,
            field: None,
        }
    }

    pub fn invalid_manifest(reason: &str) -> Self {
        Self {
            code: ValidationCode::InvalidManifest,
            message: format!("Invalid resource manifest: {}", reason),
            field: None,
        }
    }
}

/// What a validator gets to look at
pub struct ValidationRequest<'a> {
    pub path: &'a ApiPath,
    pub verb: &'a str,
    /// `None` when the server does not serve the addressed resource
    pub resolved: Option<&'a DiscoveredType>,
    /// Buffered body of create and update calls
    pub body: Option<&'a [u8]>,
}

#[async_trait]
pub trait RequestValidator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn validate(&self, request: &ValidationRequest<'_>) -> Result<()>;
}

/// The standard chain, in the order it runs
pub fn default_validators(reviewer: Arc<dyn AccessReviewer>) -> Vec<Box<dyn RequestValidator>> {
    vec![
        Box::new(ResourceValidator),
        Box::new(ManifestValidator),
        Box::new(RbacValidator::new(reviewer)),
    ]
}

/// The addressed resource type must exist
pub struct ResourceValidator;

#[async_trait]
impl RequestValidator for ResourceValidator {
    fn name(&self) -> &'static str {
        "resource"
    }

    async fn validate(&self, request: &ValidationRequest<'_>) -> Result<()> {
        if request.resolved.is_some() {
            return Ok(());
        }
        let path = request.path;
        Err(ValidationError::resource_not_found(&api_version(&path.group, &path.version), &path.resource).into())
    }
}

/// Create and update bodies must be objects of the addressed type
pub struct ManifestValidator;

#[async_trait]
impl RequestValidator for ManifestValidator {
    fn name(&self) -> &'static str {
        "manifest"
    }

    async fn validate(&self, request: &ValidationRequest<'_>) -> Result<()> {
        // Subresources (eviction, binding, scale) post their own types
        let (Some(body), Some(resolved)) = (request.body, request.resolved) else {
            return Ok(());
        };
        if request.path.subresource.is_some() || body.is_empty() {
            return Ok(());
        }

        let manifest: Value = serde_json::from_slice(body)
            .map_err(|e| ValidationError::invalid_manifest(&format!("body is not valid JSON: {}", e)))?;
        let Value::Object(object) = &manifest else {
            return Err(ValidationError::invalid_manifest("body is not an object").into());
        };

        for (field, expected) in [("apiVersion", resolved.api_version()), ("kind", resolved.kind())] {
            match object.get(field) {
                None => {}
                Some(Value::String(given)) if given.as_str() == expected => {}
                Some(Value::String(given)) => {
                    return Err(ValidationError::invalid_manifest(&format!(
                        "{} \"{}\" does not match {} {}",
                        field,
                        given,
                        resolved.api_version(),
                        resolved.kind()
                    ))
                    .into());
                }
                Some(_) => return Err(ValidationError::invalid_field(field, resolved.kind()).into()),
            }
        }

        match object.get("metadata") {
            None | Some(Value::Object(_)) => Ok(()),
            Some(_) => Err(ValidationError::invalid_field("metadata", resolved.kind()).into()),
        }
    }
}

/// The bound identity must be allowed the verb, checked live
pub struct RbacValidator {
    reviewer: Arc<dyn AccessReviewer>,
}

impl RbacValidator {
    pub fn new(reviewer: Arc<dyn AccessReviewer>) -> Self {
        Self { reviewer }
    }
}

#[async_trait]
impl RequestValidator for RbacValidator {
    fn name(&self) -> &'static str {
        "rbac"
    }

    async fn validate(&self, request: &ValidationRequest<'_>) -> Result<()> {
        let path = request.path;
        let attrs = AccessAttributes::new(request.verb, &path.group, &path.resource)
            .in_namespace(path.namespace.as_deref())
            .named(path.name.as_deref());
        if self.reviewer.review(&attrs).await? {
            return Ok(());
        }
        let resource = if path.group.is_empty() {
            path.resource.clone()
        } else {
            format!("{}.{}", path.resource, path.group)
        };
        Err(ValidationError::permission_denied(request.verb, &resource, path.namespace.as_deref()).into())
    }
}
