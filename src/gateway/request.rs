//! Bridged-request types and CGI parameter derivation.
//!
//! # Responsibilities
//! - Define the handler → engine request envelope and the engine → handler
//!   response channels
//! - Translate an HTTP request into the conventional CGI parameter set

use std::pin::Pin;

use axum::http::{request::Parts, Method, StatusCode, Version};
use bytes::Bytes;
use futures_util::Stream;
use tokio::sync::{mpsc, oneshot};

use crate::config::ServerConfig;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Inbound HTTP body as an opaque chunk stream.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send>>;

/// Error surfaced into a streaming response body.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    #[error("backend connection lost before the response completed")]
    BackendLost,
    #[error("gateway shut down")]
    GatewayClosed,
}

/// One HTTP request handed to the gateway engine.
pub struct BridgeRequest {
    pub method: Method,
    /// Path + query, for logging only.
    pub target: String,
    /// CGI parameters, already derived, in insertion order.
    pub params: Vec<(String, String)>,
    /// Present only for methods that carry a body (PUT/POST).
    pub body: Option<BodyStream>,
    /// Fires once response headers are resolved. Dropped on abort-before-
    /// headers, which the handler maps to 502.
    pub reply: oneshot::Sender<ResponseHead>,
}

impl BridgeRequest {
    /// Whether this method sends a request body to the backend. Anything
    /// other than PUT/POST terminates stdin immediately.
    pub fn method_has_body(method: &Method) -> bool {
        *method == Method::PUT || *method == Method::POST
    }
}

/// Resolved response head plus the body channel.
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: mpsc::Receiver<Result<Bytes, BridgeError>>,
}

/// Identity values reported to the backend.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub port: u16,
    pub software: String,
}

impl ServerInfo {
    pub fn new(config: &ServerConfig, port: u16) -> Self {
        Self {
            name: config.name.clone(),
            port,
            software: config.software.clone(),
        }
    }
}

fn protocol_name(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

/// Map a header name to its CGI form: HTTP_ prefix, uppercased, hyphens to
/// underscores.
fn cgi_header_name(name: &str) -> String {
    let mut out = String::with_capacity(5 + name.len());
    out.push_str("HTTP_");
    for c in name.chars() {
        if c == '-' {
            out.push('_');
        } else {
            out.push(c.to_ascii_uppercase());
        }
    }
    out
}

/// Derive the CGI parameter set for one request.
///
/// Follows the conventional mapping: request line values, server identity,
/// every inbound header as `HTTP_<UPPER_SNAKE_CASE>`, plus content and auth
/// parameters when the corresponding headers are present.
pub fn cgi_params(parts: &Parts, server: &ServerInfo) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = Vec::new();

    params.push(("PATH_INFO".into(), parts.uri.path().to_string()));
    params.push(("SERVER_NAME".into(), server.name.clone()));
    params.push(("SERVER_PORT".into(), server.port.to_string()));
    params.push(("SERVER_PROTOCOL".into(), protocol_name(parts.version).into()));
    params.push(("SERVER_SOFTWARE".into(), server.software.clone()));

    for (name, value) in parts.headers.iter() {
        params.push((
            cgi_header_name(name.as_str()),
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
        ));
    }

    params.push(("REQUEST_METHOD".into(), parts.method.to_string()));
    params.push((
        "QUERY_STRING".into(),
        parts.uri.query().unwrap_or("").to_string(),
    ));

    if let Some(length) = parts.headers.get("content-length") {
        params.push((
            "CONTENT_LENGTH".into(),
            String::from_utf8_lossy(length.as_bytes()).into_owned(),
        ));
    }
    if let Some(kind) = parts.headers.get("content-type") {
        params.push((
            "CONTENT_TYPE".into(),
            String::from_utf8_lossy(kind.as_bytes()).into_owned(),
        ));
    }
    if let Some(auth) = parts.headers.get("authorization") {
        let value = String::from_utf8_lossy(auth.as_bytes());
        if let Some(scheme) = value.split_whitespace().next() {
            params.push(("AUTH_TYPE".into(), scheme.to_string()));
        }
    }

    params
}
