// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Typed errors returned to operation handlers.
//!
//! Policy denials and unknown types are separate variants so callers never
//! have to inspect message text to tell "forbidden" from "doesn't exist".
//! The `Display` output of both is kept stable for existing clients.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::kubernetes::access::AccessAttributes;
use crate::kubernetes::validation::ValidationError;

pub type Result<T, E = GateError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum GateError {
    /// The requested context is not present in the loaded kubeconfig
    #[error("no such context \"{0}\" in kubeconfig")]
    UnknownContext(String),

    /// In-cluster mode only has the implicit context
    #[error("context switching not applicable in-cluster (requested \"{0}\")")]
    ContextSwitchInCluster(String),

    #[error("no context requested and no current-context set in kubeconfig")]
    NoDefaultContext,

    /// The type matches a deny rule (or misses the allow-list)
    #[error("resource not allowed: {group}/{version}, Kind={kind}")]
    ResourceNotAllowed {
        group: String,
        version: String,
        kind: String,
    },

    /// The server does not serve this kind in this version
    #[error("no matches for kind \"{kind}\" in version \"{}\"", api_version(.group, .version))]
    NoKindMatch {
        group: String,
        version: String,
        kind: String,
    },

    /// The server does not serve this resource (plural) in this version
    #[error("no matches for {group}/{version}, Resource={resource}")]
    NoResourceMatch {
        group: String,
        version: String,
        resource: String,
    },

    /// Live RBAC review returned `allowed: false`
    #[error("forbidden: cannot {0} (denied by cluster RBAC)")]
    Forbidden(AccessAttributes),

    #[error(
        "kubernetes-server, kubernetes-certificate-authority-data and kubernetes-authorization \
         headers are required by the auth-headers provider"
    )]
    MissingClusterOverride,

    #[error("invalid cluster override: {0}")]
    InvalidOverride(String),

    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// Rejected by the pre-flight validator chain
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("configuration reload failed: {0}")]
    Reload(#[from] ConfigError),

    #[error("reload trigger is not running")]
    ReloaderStopped,

    #[error("cluster request timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error(transparent)]
    InCluster(#[from] kube::config::InClusterError),

    #[error(transparent)]
    Kube(kube::Error),
}

/// Errors raised by the request gate travel through kube's service stack
/// boxed; unwrap them so callers see the original variant.
impl From<kube::Error> for GateError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Service(inner) => match inner.downcast::<GateError>() {
                Ok(gate) => *gate,
                Err(other) => Self::Kube(kube::Error::Service(other)),
            },
            other => Self::Kube(other),
        }
    }
}

impl GateError {
    pub fn not_allowed(group: &str, version: &str, kind: &str) -> Self {
        Self::ResourceNotAllowed {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// True for policy denials, never for unknown types
    pub fn is_policy_denial(&self) -> bool {
        matches!(self, Self::ResourceNotAllowed { .. })
    }

    /// True when the server has no such type
    pub fn is_no_match(&self) -> bool {
        matches!(self, Self::NoKindMatch { .. } | Self::NoResourceMatch { .. })
    }
}

/// `v1` for the core group, `apps/v1` otherwise
pub fn api_version(group: &str, version: &str) -> String {
    if group.is_empty() {
        version.to_string()
    } else {
        format!("{}/{}", group, version)
    }
}
