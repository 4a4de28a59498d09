//! The embedder hook surface: subscriber lists the session loop fans
//! requests and events out to. Registered once at startup and never mutated
//! afterwards; invocation is the only concurrent operation against them.
//!
//! `BeforeRequest` is the one hook that mutates shared state, so its
//! subscribers are handed the request behind a `tokio::sync::Mutex` rather
//! than a bare reference — real concurrent *mutation* isn't expressible
//! safely in Rust the way the source language allows it, so each subscriber
//! takes the lock for the brief span it needs to read or write a field. The
//! fan-out itself (spawning every subscriber's future before awaiting any of
//! them) still happens in parallel, which is the part that matters for
//! request latency.

use std::sync::Arc;

use futures::future::{BoxFuture, join_all};
use tokio::sync::Mutex;

use crate::config::UpstreamProxy;
use crate::error::ProxyError;
use crate::flow::{ConnectRequest, Request, Session};

pub trait BeforeRequestHook: Send + Sync {
    fn call(&self, request: Arc<Mutex<Request>>) -> BoxFuture<'static, ()>;
}

pub trait TunnelConnectRequestHook: Send + Sync {
    fn call(&self, connect: Arc<ConnectRequest>) -> BoxFuture<'static, ()>;
}

pub trait TunnelConnectResponseHook: Send + Sync {
    fn call(&self, connect: Arc<ConnectRequest>, status: u16) -> BoxFuture<'static, ()>;
}

/// The resolver slots for `GetCustomUpStreamHttpProxyFunc` and
/// `GetCustomUpStreamHttpsProxyFunc`: first-registered-wins, not a fan-out,
/// since "return an upstream proxy or none" only makes sense from one voice.
pub trait UpstreamProxyResolver: Send + Sync {
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, Option<UpstreamProxy>>;
}

/// Terminal error sink (`ExceptionFunc`); synchronous because nothing
/// downstream of it can affect how the session is torn down.
pub trait ExceptionHook: Send + Sync {
    fn call(&self, err: &ProxyError, session: &Session);
}

#[derive(Clone, Default)]
pub struct HookRegistry {
    before_request: Vec<Arc<dyn BeforeRequestHook>>,
    tunnel_connect_request: Vec<Arc<dyn TunnelConnectRequestHook>>,
    tunnel_connect_response: Vec<Arc<dyn TunnelConnectResponseHook>>,
    upstream_http_proxy: Option<Arc<dyn UpstreamProxyResolver>>,
    upstream_https_proxy: Option<Arc<dyn UpstreamProxyResolver>>,
    exception: Vec<Arc<dyn ExceptionHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_before_request(&mut self, hook: Arc<dyn BeforeRequestHook>) {
        self.before_request.push(hook);
    }

    pub fn add_tunnel_connect_request(&mut self, hook: Arc<dyn TunnelConnectRequestHook>) {
        self.tunnel_connect_request.push(hook);
    }

    pub fn add_tunnel_connect_response(&mut self, hook: Arc<dyn TunnelConnectResponseHook>) {
        self.tunnel_connect_response.push(hook);
    }

    pub fn set_upstream_http_proxy_resolver(&mut self, resolver: Arc<dyn UpstreamProxyResolver>) {
        self.upstream_http_proxy = Some(resolver);
    }

    pub fn set_upstream_https_proxy_resolver(&mut self, resolver: Arc<dyn UpstreamProxyResolver>) {
        self.upstream_https_proxy = Some(resolver);
    }

    pub fn add_exception_hook(&mut self, hook: Arc<dyn ExceptionHook>) {
        self.exception.push(hook);
    }

    /// Fans `BeforeRequest` out to every subscriber and awaits all of them
    /// before returning whatever `request.cancel` ends up as.
    pub async fn fire_before_request(&self, request: Arc<Mutex<Request>>) -> bool {
        let futs = self
            .before_request
            .iter()
            .map(|hook| hook.call(request.clone()));
        join_all(futs).await;
        request.lock().await.cancel
    }

    pub async fn fire_tunnel_connect_request(&self, connect: Arc<ConnectRequest>) {
        let futs = self
            .tunnel_connect_request
            .iter()
            .map(|hook| hook.call(connect.clone()));
        join_all(futs).await;
    }

    pub async fn fire_tunnel_connect_response(&self, connect: Arc<ConnectRequest>, status: u16) {
        let futs = self
            .tunnel_connect_response
            .iter()
            .map(|hook| hook.call(connect.clone(), status));
        join_all(futs).await;
    }

    pub async fn resolve_http_proxy(&self, host: &str, port: u16) -> Option<UpstreamProxy> {
        match &self.upstream_http_proxy {
            Some(resolver) => resolver.resolve(host, port).await,
            None => None,
        }
    }

    pub async fn resolve_https_proxy(&self, host: &str, port: u16) -> Option<UpstreamProxy> {
        match &self.upstream_https_proxy {
            Some(resolver) => resolver.resolve(host, port).await,
            None => None,
        }
    }

    pub fn fire_exception(&self, err: &ProxyError, session: &Session) {
        for hook in &self.exception {
            hook.call(err, session);
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;
    use roxy_shared::{uri::RUri, version::HttpVersion};
    use std::sync::atomic::{AtomicUsize, Ordering};

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

    struct CancelHook;
    impl BeforeRequestHook for CancelHook {
        fn call(&self, request: Arc<Mutex<Request>>) -> BoxFuture<'static, ()> {
            Box::pin(async move {
                request.lock().await.set_cancel(true);
            })
        }
    }

    struct CountingHook(Arc<AtomicUsize>);
    impl BeforeRequestHook for CountingHook {
        fn call(&self, request: Arc<Mutex<Request>>) -> BoxFuture<'static, ()> {
            let counter = self.0.clone();
            Box::pin(async move {
                let _ = request.lock().await;
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    #[tokio::test]
    async fn before_request_fan_out_awaits_all_subscribers() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut registry = HookRegistry::new();
        registry.add_before_request(Arc::new(CountingHook(counter.clone())));
        registry.add_before_request(Arc::new(CountingHook(counter.clone())));
        registry.add_before_request(Arc::new(CancelHook));

        let request = Arc::new(Mutex::new(sample_request()));
        let cancelled = registry.fire_before_request(request).await;

        assert!(cancelled);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
