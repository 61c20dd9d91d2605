// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Request-level gate in front of the kube client.
//!
//! Every HTTP request a bundle's client sends, whatever API built it, is
//! mapped back from its URL to a resource type and checked against the
//! policy before it leaves the process. With validation enabled the
//! validator chain runs as well.

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::header::USER_AGENT;
use http::{HeaderValue, Method, Request, Response, Uri};
use http_body_util::BodyExt;
use kube::Client;
use kube::client::Body;
use tower::Service;
use tracing::{debug, trace};

use super::access::AccessReviewer;
use super::discovery::{DiscoveredType, FilteredDiscovery};
use super::mapper::FilteredRestMapper;
use super::validation::{RequestValidator, ValidationRequest, default_validators};
use crate::error::{GateError, Result};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A resource URL taken apart
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiPath {
    pub group: String,
    pub version: String,
    pub resource: String,
    pub subresource: Option<String>,
    pub namespace: Option<String>,
    pub name: Option<String>,
    /// Legacy `/watch/` path prefix
    pub watch: bool,
}

impl ApiPath {
    /// `None` for discovery documents and other non-resource paths
    pub fn parse(path: &str) -> Option<Self> {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let (group, version, rest) = match segments.as_slice() {
            ["api", version, rest @ ..] => ("", *version, rest),
            ["apis", group, version, rest @ ..] => (*group, *version, rest),
            _ => return None,
        };

        let (watch, rest) = match rest {
            ["watch", rest @ ..] => (true, rest),
            rest => (false, rest),
        };

        let (namespace, rest) = match rest {
            // Subresources of the namespace object itself
            ["namespaces", _, "status" | "finalize"] if group.is_empty() => (None, rest),
            ["namespaces", namespace, tail @ ..] if !tail.is_empty() => (Some(*namespace), tail),
            rest => (None, rest),
        };

        let (resource, name, subresource) = match rest {
            [] | [""] => return None,
            [resource] => (*resource, None, None),
            [resource, name] => (*resource, Some(*name), None),
            [resource, name, sub @ ..] => (*resource, Some(*name), Some(sub.join("/"))),
        };

        Some(Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
            subresource,
            namespace: namespace.map(String::from),
            name: name.map(String::from),
            watch,
        })
    }

    fn is_access_review(&self) -> bool {
        self.group == "authorization.k8s.io" && self.resource == "selfsubjectaccessreviews"
    }
}

/// RBAC verb of a request
pub fn verb(method: &Method, uri: &Uri, path: &ApiPath) -> String {
    let collection = path.name.is_none();
    match method.as_str() {
        "GET" if path.watch || watch_query(uri) => "watch".to_string(),
        "GET" if collection => "list".to_string(),
        "GET" => "get".to_string(),
        "POST" => "create".to_string(),
        "PUT" => "update".to_string(),
        "PATCH" => "patch".to_string(),
        "DELETE" if collection => "deletecollection".to_string(),
        "DELETE" => "delete".to_string(),
        other => other.to_lowercase(),
    }
}

fn watch_query(uri: &Uri) -> bool {
    uri.query()
        .into_iter()
        .flat_map(|query| query.split('&'))
        .any(|pair| matches!(pair, "watch=true" | "watch=1"))
}

/// Policy check plus the optional validator chain
pub struct RequestGate {
    mapper: FilteredRestMapper,
    validators: Vec<Box<dyn RequestValidator>>,
}

impl RequestGate {
    pub fn new(discovery: Arc<FilteredDiscovery>, reviewer: Arc<dyn AccessReviewer>, validation: bool) -> Self {
        let validators = if validation {
            default_validators(reviewer)
        } else {
            vec![]
        };
        Self {
            mapper: FilteredRestMapper::new(discovery),
            validators,
        }
    }

    pub fn is_validating(&self) -> bool {
        !self.validators.is_empty()
    }

    /// Decide whether a request may be sent; create and update bodies are
    /// buffered for the validators and handed back intact.
    pub async fn admit(&self, request: Request<Body>) -> Result<Request<Body>> {
        let Some(path) = ApiPath::parse(request.uri().path()) else {
            return Ok(request);
        };

        let resolved = match self.mapper.kind_for(&path.group, &path.version, &path.resource).await {
            Ok(resolved) => Some(resolved),
            Err(e) if e.is_no_match() && self.is_validating() => None,
            Err(e) => {
                debug!(path = %request.uri().path(), error = %e, "Request refused");
                return Err(e);
            }
        };

        if !self.is_validating() || path.is_access_review() {
            return Ok(request);
        }

        let verb = verb(request.method(), request.uri(), &path);
        let (parts, body) = request.into_parts();
        let (buffered, passthrough) = match verb.as_str() {
            "create" | "update" => (Some(body.collect().await?.to_bytes()), None),
            _ => (None, Some(body)),
        };

        self.validate(&path, &verb, resolved.as_ref(), buffered.as_deref())
            .await?;

        let body = match (buffered, passthrough) {
            (Some(bytes), _) => Body::from(bytes.to_vec()),
            (None, Some(body)) => body,
            (None, None) => unreachable!("body is either buffered or passed through"),
        };
        Ok(Request::from_parts(parts, body))
    }

    async fn validate(
        &self,
        path: &ApiPath,
        verb: &str,
        resolved: Option<&DiscoveredType>,
        body: Option<&[u8]>,
    ) -> Result<()> {
        let request = ValidationRequest {
            path,
            verb,
            resolved,
            body,
        };
        for validator in &self.validators {
            if let Err(e) = validator.validate(&request).await {
                debug!(validator = validator.name(), verb = %verb, resource = %path.resource, error = %e, "Validation failed");
                return Err(e);
            }
        }
        trace!(verb = %verb, resource = %path.resource, "Request validated");
        Ok(())
    }
}

/// Service handed to `kube::Client::new`: tags the user agent, admits the
/// request through the gate, then sends it with the shared base client.
#[derive(Clone)]
pub struct GatedService {
    base: Client,
    gate: Arc<RequestGate>,
    user_agent: Option<HeaderValue>,
}

impl GatedService {
    pub fn new(base: Client, gate: Arc<RequestGate>, user_agent: Option<HeaderValue>) -> Self {
        Self {
            base,
            gate,
            user_agent,
        }
    }

    pub fn into_client(self) -> Client {
        let namespace = self.base.default_namespace().to_string();
        Client::new(self, namespace)
    }
}

impl Service<Request<Body>> for GatedService {
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = BoxFuture<'static, std::result::Result<Response<Body>, BoxError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), BoxError>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        if let Some(agent) = &self.user_agent {
            request.headers_mut().insert(USER_AGENT, agent.clone());
        }
        let base = self.base.clone();
        let gate = self.gate.clone();
        Box::pin(async move {
            let request = gate.admit(request).await?;
            Ok::<_, BoxError>(base.send(request).await?)
        })
    }
}
