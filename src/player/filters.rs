// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: (C) 2025 Cranky Kernel <crankykernel@proton.me>

//! Hooks the engine runs on every outgoing request and incoming response.

use tracing::debug;
use url::Url;

use super::errors::EngineError;
use crate::config::ProxyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Manifest,
    Segment,
    License,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRequest {
    pub kind: RequestKind,
    /// Candidate URIs, tried in order.
    pub uris: Vec<String>,
    pub headers: Vec<(String, String)>,
}

impl NetworkRequest {
    pub fn new(kind: RequestKind, uri: impl Into<String>) -> Self {
        Self {
            kind,
            uris: vec![uri.into()],
            headers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkResponse {
    pub kind: RequestKind,
    pub uri: String,
    pub status: u16,
}

pub trait RequestFilter: Send + Sync {
    fn filter(&self, request: &mut NetworkRequest);
}

pub trait ResponseFilter: Send + Sync {
    fn filter(&self, response: &NetworkResponse) -> Result<(), EngineError>;
}

/// Extra headers attached to every request of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthHeaders(pub Vec<(String, String)>);

impl AuthHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.push((name.into(), value.into()));
        self
    }
}

/// Routes requests for the upstream streaming host through the local
/// reverse proxy and attaches the session's auth headers.
#[derive(Debug, Clone)]
pub struct ProxyRewriter {
    upstream: Option<Url>,
    local_path: String,
    headers: AuthHeaders,
}

impl ProxyRewriter {
    pub fn new(config: &ProxyConfig, headers: AuthHeaders) -> Self {
        let upstream = if config.upstream_prefix.trim().is_empty() {
            None
        } else {
            match Url::parse(&config.upstream_prefix) {
                Ok(url) => Some(url),
                Err(e) => {
                    debug!(
                        "Ignoring invalid upstream prefix {:?}: {}",
                        config.upstream_prefix, e
                    );
                    None
                }
            }
        };

        Self {
            upstream,
            local_path: config.local_path.trim_end_matches('/').to_string(),
            headers,
        }
    }

    /// Returns `uri` rewritten onto the proxy path when it targets the
    /// upstream host, unchanged otherwise.
    pub fn rewrite(&self, uri: &str) -> String {
        let Some(upstream) = &self.upstream else {
            return uri.to_string();
        };
        let Ok(parsed) = Url::parse(uri) else {
            return uri.to_string();
        };

        let same_origin = parsed.scheme() == upstream.scheme()
            && parsed.host_str() == upstream.host_str()
            && parsed.port_or_known_default() == upstream.port_or_known_default();
        let base_path = upstream.path().trim_end_matches('/');
        if !same_origin || !parsed.path().starts_with(base_path) {
            return uri.to_string();
        }

        let rest = &parsed.path()[base_path.len()..];
        if !rest.is_empty() && !rest.starts_with('/') {
            return uri.to_string();
        }
        let mut rewritten = format!("{}/{}", self.local_path, rest.trim_start_matches('/'));
        if let Some(query) = parsed.query() {
            rewritten.push('?');
            rewritten.push_str(query);
        }
        rewritten
    }
}

impl RequestFilter for ProxyRewriter {
    fn filter(&self, request: &mut NetworkRequest) {
        for uri in request.uris.iter_mut() {
            let rewritten = self.rewrite(uri);
            if rewritten != *uri {
                debug!("Proxying {} -> {}", uri, rewritten);
                *uri = rewritten;
            }
        }
        request.headers.extend(self.headers.0.iter().cloned());
    }
}

/// Reports upstream gateway failures as retryable network errors.
#[derive(Debug, Clone)]
pub struct RetryableStatusFilter {
    statuses: Vec<u16>,
}

impl RetryableStatusFilter {
    pub fn new(statuses: Vec<u16>) -> Self {
        Self { statuses }
    }
}

impl ResponseFilter for RetryableStatusFilter {
    fn filter(&self, response: &NetworkResponse) -> Result<(), EngineError> {
        if self.statuses.contains(&response.status) {
            debug!(
                "Treating HTTP {} from {} as retryable",
                response.status, response.uri
            );
            return Err(EngineError::bad_http_status(response.status, &response.uri));
        }
        Ok(())
    }
}
