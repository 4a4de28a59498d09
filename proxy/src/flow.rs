//! Data model for a single client connection: the `Request`/`Response` pair
//! exchanged per iteration of the session loop, the `ConnectRequest`
//! captured once for explicit-mode `CONNECT` tunnels, and the lightweight
//! `Session` handle hooks and the exception sink see.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};
use roxy_shared::{uri::RUri, version::HttpVersion};

use crate::config::UpstreamProxy;

/// One HTTP request as read off the client connection. `request_locked`
/// gates every mutation method below; once set, hook code can no longer
/// change the request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub uri: RUri,
    pub version: HttpVersion,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub has_body: bool,
    pub is_chunked: bool,
    pub content_length: u64,
    pub expect_continue: bool,
    pub upgrade_to_websocket: bool,
    pub request_locked: bool,
    pub cancel: bool,
}

impl Request {
    /// Guarded mutation: returns `false` without touching state once the
    /// request is locked, the same contract every hook-facing setter below
    /// follows.
    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) -> bool {
        if self.request_locked {
            return false;
        }
        self.headers.insert(name, value);
        true
    }

    pub fn append_header(&mut self, name: HeaderName, value: HeaderValue) -> bool {
        if self.request_locked {
            return false;
        }
        self.headers.append(name, value);
        true
    }

    pub fn remove_header(&mut self, name: &HeaderName) -> bool {
        if self.request_locked {
            return false;
        }
        self.headers.remove(name);
        true
    }

    /// `BeforeRequest` hooks cancel the session this way; a no-op once
    /// locked, same as every other mutator here.
    pub fn set_cancel(&mut self, cancel: bool) -> bool {
        if self.request_locked {
            return false;
        }
        self.cancel = cancel;
        true
    }

    /// Lets a `BeforeRequest` hook substitute a request body it already read
    /// and decoded off the wire. Forwarding then writes these bytes verbatim
    /// instead of streaming from the client, and re-derives `Content-Length`
    /// from them rather than re-encoding chunked.
    pub fn set_body(&mut self, body: Bytes) -> bool {
        if self.request_locked {
            return false;
        }
        self.body = Some(body);
        true
    }

    pub fn lock(&mut self) {
        self.request_locked = true;
    }

    pub fn host(&self) -> &str {
        self.uri.host()
    }
}

/// The response half of a session. Mirrors `Request`'s shape.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub version: HttpVersion,
    pub headers: HeaderMap,
    pub keep_alive: bool,
    pub is_100_continue: bool,
    pub expectation_failed: bool,
}

impl Response {
    pub fn new(version: HttpVersion, status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            version,
            headers: HeaderMap::new(),
            keep_alive: matches!(version.0, http::Version::HTTP_11),
            is_100_continue: false,
            expectation_failed: false,
        }
    }
}

/// Captured once per `CONNECT`, in explicit mode only; attached to every
/// session born from the tunnel it opened.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub authority: String,
    pub version: HttpVersion,
    pub headers: HeaderMap,
}

/// Lightweight, cloneable description of "which client, which target" a
/// session belongs to. Not the request/response payload itself — those are
/// owned locally by the session loop — just enough for hooks and the
/// exception sink to identify the session they were called about.
#[derive(Debug, Clone)]
pub struct Session {
    pub client_addr: SocketAddr,
    pub target: RUri,
    pub connect: Option<Arc<ConnectRequest>>,
}

impl Session {
    pub fn new(client_addr: SocketAddr, target: RUri, connect: Option<Arc<ConnectRequest>>) -> Self {
        Self {
            client_addr,
            target,
            connect,
        }
    }
}

/// What `GetCustomUpStreamHttpProxyFunc`/`GetCustomUpStreamHttpsProxyFunc`
/// hand back for a given session; re-exported here since it is part of the
/// session's observable state (the effective upstream proxy, for
/// observability).
pub type ResolvedUpstreamProxy = Option<UpstreamProxy>;

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use http::header::CONTENT_LENGTH;
    use roxy_shared::uri::RUri;

    fn sample_request() -> Request {
        Request {
            method: "GET".into(),
            uri: "http://example.com/".parse::<RUri>().unwrap(),
            version: HttpVersion(http::Version::HTTP_11),
            headers: HeaderMap::new(),
            body: None,
            has_body: false,
            is_chunked: false,
            content_length: 0,
            expect_continue: false,
            upgrade_to_websocket: false,
            request_locked: false,
            cancel: false,
        }
    }

    #[test]
    fn mutations_rejected_once_locked() {
        let mut req = sample_request();
        assert!(req.set_header(CONTENT_LENGTH, HeaderValue::from_static("5")));
        req.lock();
        assert!(!req.set_header(CONTENT_LENGTH, HeaderValue::from_static("10")));
        assert_eq!(req.headers.get(CONTENT_LENGTH).unwrap(), "5");
        assert!(!req.set_cancel(true));
        assert!(!req.cancel);
    }
}
