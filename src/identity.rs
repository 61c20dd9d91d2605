// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Per-request identity derived from transport metadata.
//!
//! Everything here is a pure function of the inbound header map and the
//! caller's self-reported client info. Nothing is stored beyond the request.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::HeaderMap;
use http::header::{AUTHORIZATION, USER_AGENT};

use crate::error::{GateError, Result};

pub const HEADER_SERVER: &str = "kubernetes-server";
pub const HEADER_CERTIFICATE_AUTHORITY_DATA: &str = "kubernetes-certificate-authority-data";
pub const HEADER_AUTHORIZATION: &str = "kubernetes-authorization";
pub const HEADER_INSECURE_SKIP_TLS_VERIFY: &str = "kubernetes-insecure-skip-tls-verify";
pub const HEADER_CLIENT_CERTIFICATE_DATA: &str = "kubernetes-client-certificate-data";
pub const HEADER_CLIENT_KEY_DATA: &str = "kubernetes-client-key-data";

/// A credential that never shows up in Debug output or logs
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverrideAuth {
    Bearer(Secret),
    /// Base64 PEM data, as in a kubeconfig
    ClientCertificate { certificate_data: String, key_data: Secret },
}

/// Cluster endpoint and credentials supplied by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterOverride {
    pub server: String,
    /// Base64 PEM CA bundle
    pub certificate_authority_data: String,
    pub auth: OverrideAuth,
    pub insecure_skip_tls_verify: bool,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn strip_bearer(value: &str) -> &str {
    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => token.trim(),
        _ => value,
    }
}

fn check_base64(name: &str, value: &str) -> Result<()> {
    STANDARD
        .decode(value)
        .map(|_| ())
        .map_err(|e| GateError::InvalidOverride(format!("{} is not valid base64: {}", name, e)))
}

impl ClusterOverride {
    /// Extract the override from request headers.
    ///
    /// `Ok(None)` when the server/CA/credential set is incomplete; the caller
    /// then falls back to the configured identity. A complete but malformed
    /// set is an error.
    pub fn from_headers(headers: &HeaderMap) -> Result<Option<Self>> {
        let (Some(server), Some(ca_data)) = (
            header(headers, HEADER_SERVER),
            header(headers, HEADER_CERTIFICATE_AUTHORITY_DATA),
        ) else {
            return Ok(None);
        };

        let auth = match (
            header(headers, HEADER_AUTHORIZATION),
            header(headers, HEADER_CLIENT_CERTIFICATE_DATA),
            header(headers, HEADER_CLIENT_KEY_DATA),
        ) {
            (Some(token), _, _) => OverrideAuth::Bearer(Secret::new(strip_bearer(token))),
            (None, Some(cert), Some(key)) => {
                check_base64(HEADER_CLIENT_CERTIFICATE_DATA, cert)?;
                check_base64(HEADER_CLIENT_KEY_DATA, key)?;
                OverrideAuth::ClientCertificate {
                    certificate_data: cert.to_string(),
                    key_data: Secret::new(key),
                }
            }
            _ => return Ok(None),
        };

        let uri: http::Uri = server
            .parse()
            .map_err(|e| GateError::InvalidOverride(format!("{}: {}", HEADER_SERVER, e)))?;
        if uri.scheme().is_none() || uri.host().is_none() {
            return Err(GateError::InvalidOverride(format!(
                "{} must be an absolute URL, got \"{}\"",
                HEADER_SERVER, server
            )));
        }
        check_base64(HEADER_CERTIFICATE_AUTHORITY_DATA, ca_data)?;

        let insecure_skip_tls_verify = header(headers, HEADER_INSECURE_SKIP_TLS_VERIFY)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));

        Ok(Some(Self {
            server: server.to_string(),
            certificate_authority_data: ca_data.to_string(),
            auth,
            insecure_skip_tls_verify,
        }))
    }
}

/// `Authorization: Bearer <token>` passed through from an OAuth-fronted caller
pub fn bearer_token(headers: &HeaderMap) -> Option<Secret> {
    let value = header(headers, AUTHORIZATION.as_str())?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| Secret::new(token))
}

/// Client name and version reported by the caller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerInfo {
    pub name: String,
    pub version: String,
}

impl CallerInfo {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.trim().to_string(),
            version: version.trim().to_string(),
        }
    }

    /// `name/version`, `name`, or nothing
    fn segment(&self) -> Option<String> {
        match (self.name.is_empty(), self.version.is_empty()) {
            (true, _) => None,
            (false, true) => Some(self.name.clone()),
            (false, false) => Some(format!("{}/{}", self.name, self.version)),
        }
    }
}

/// `kubemcp/<version> (<os>/<arch>)` followed by the caller segment when known
pub fn user_agent(caller: Option<&str>) -> String {
    let base = format!(
        "{}/{} ({}/{})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    match caller.map(str::trim).filter(|c| !c.is_empty()) {
        Some(caller) => format!("{} {}", base, caller),
        None => base,
    }
}

/// Resolved identity for one inbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveIdentity {
    /// Requested context; empty means the default one
    pub context: String,
    pub cluster_override: Option<ClusterOverride>,
    pub bearer_token: Option<Secret>,
    pub user_agent: String,
}

impl EffectiveIdentity {
    /// The caller segment is the client name/version the caller announced;
    /// transports without client info fall back to the inbound User-Agent.
    pub fn from_request(headers: &HeaderMap, context: Option<&str>, caller: Option<&CallerInfo>) -> Result<Self> {
        let caller_segment = caller
            .and_then(CallerInfo::segment)
            .or_else(|| header(headers, USER_AGENT.as_str()).map(String::from));

        Ok(Self {
            context: context.unwrap_or_default().trim().to_string(),
            cluster_override: ClusterOverride::from_headers(headers)?,
            bearer_token: bearer_token(headers),
            user_agent: user_agent(caller_segment.as_deref()),
        })
    }
}
