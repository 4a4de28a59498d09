//! The client dispatcher, session loop, forwarding, and the upstream
//! connector that ties them to real sockets. `ProxyServer` is the thin
//! accept loop that gives all of the above somewhere to run end to end in
//! integration tests.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};

use http::{HeaderMap, HeaderValue, Uri, header::HOST};
use rustls::RootCertStore;
use rustls::pki_types::ServerName;
use tokio::io::{self, AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::{TlsConnector, client::TlsStream as ClientTlsStream};
use tracing::{debug, error, trace, warn};

use roxy_shared::{
    cert::CertificateAuthority,
    tls::TlsConfig,
    uri::{RUri, Scheme},
    version::HttpVersion,
};

use crate::config::{EndpointConfig, ProxyConfig, UpstreamProxy};
use crate::error::ProxyError;
use crate::flow::{ConnectRequest, Request, Response, Session};
use crate::hooks::HookRegistry;
use crate::http as codec;
use crate::interceptor::{self, InterceptOutcome};
use crate::peek_stream::PeekStream;
use crate::tunnel::{self, NoopObserver};

/// Process-wide, fetch-add on upstream creation and fetch-sub exactly once
/// per connection via `UpstreamConnection::dispose`. Shared across every
/// client task in the process.
pub static SERVER_CONNECTION_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Everything a client task needs that is read-only after `ProxyServer::bind`:
/// configuration, the certificate authority, the hook registry, TLS
/// machinery for both legs, and the connector.
pub struct ProxyContext {
    pub config: Arc<ProxyConfig>,
    pub ca: Arc<dyn CertificateAuthority>,
    pub hooks: Arc<HookRegistry>,
    pub tls_config: Arc<TlsConfig>,
    pub connector: TcpConnectionFactory,
}

impl ProxyContext {
    pub fn new(
        config: ProxyConfig,
        ca: Arc<dyn CertificateAuthority>,
        hooks: HookRegistry,
        tls_config: TlsConfig,
        upstream_roots: Arc<RootCertStore>,
    ) -> Self {
        let tls_config = Arc::new(tls_config);
        Self {
            config: Arc::new(config),
            ca,
            hooks: Arc::new(hooks),
            connector: TcpConnectionFactory::new(tls_config.clone(), upstream_roots),
            tls_config,
        }
    }

    /// Proxy-authentication gate: always allows. Windows proxy authentication
    /// negotiation is an external collaborator this crate does not
    /// implement, so this stays a named pass-through rather than being
    /// deleted, since `enable_win_auth` is still surfaced configuration.
    fn proxy_auth_allows(&self) -> bool {
        true
    }
}

/// Binds a loopback listener and spawns the accept loop.
pub struct ProxyServer {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl ProxyServer {
    pub async fn bind(context: Arc<ProxyContext>, port: Option<u16>) -> io::Result<Self> {
        let listener = roxy_shared::io::local_tcp_listener(port).await?;
        let local_addr = listener.local_addr()?;

        let handle = tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("accept failed: {e}");
                        continue;
                    }
                };
                let context = context.clone();
                tokio::spawn(async move {
                    if let Err(err) = dispatch(stream, peer_addr, context).await {
                        trace!(%peer_addr, "session ended: {}", roxy_shared::util::report(&err));
                    }
                });
            }
        });

        Ok(Self { local_addr, handle })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Client dispatcher entry point: branches on the configured endpoint kind.
async fn dispatch(
    stream: TcpStream,
    peer_addr: SocketAddr,
    context: Arc<ProxyContext>,
) -> Result<(), ProxyError> {
    match context.config.endpoint.clone() {
        EndpointConfig::Explicit => dispatch_explicit(stream, peer_addr, context).await,
        EndpointConfig::Transparent {
            tls_enabled,
            generic_cert_name,
        } => dispatch_transparent(stream, peer_addr, context, tls_enabled, generic_cert_name).await,
    }
}

async fn dispatch_explicit(
    stream: TcpStream,
    peer_addr: SocketAddr,
    context: Arc<ProxyContext>,
) -> Result<(), ProxyError> {
    let buffer_size = context.config.buffer_size;
    let mut client = BufReader::with_capacity(buffer_size, stream);

    let Some(line) = codec::read_line(&mut client, buffer_size).await? else {
        return Ok(());
    };
    if line.is_empty() {
        return Ok(());
    }
    let request_line = codec::parse_request_line(&line)?;
    let headers = codec::read_headers(&mut client, buffer_size).await?;

    if request_line.method == "CONNECT" {
        handle_connect(client, peer_addr, context, request_line, headers).await
    } else {
        session_loop(client, peer_addr, context, None, None, Some((request_line, headers))).await
    }
}

async fn dispatch_transparent(
    stream: TcpStream,
    peer_addr: SocketAddr,
    context: Arc<ProxyContext>,
    tls_enabled: bool,
    generic_cert_name: String,
) -> Result<(), ProxyError> {
    let buffer_size = context.config.buffer_size;

    if !tls_enabled {
        let client = BufReader::with_capacity(buffer_size, stream);
        return session_loop(client, peer_addr, context, None, None, None).await;
    }

    let client = BufReader::with_capacity(buffer_size, stream);
    match interceptor::intercept(
        client,
        &generic_cert_name,
        false,
        context.ca.as_ref(),
        &context.tls_config,
        &context.config.supported_ssl_protocols,
    )
    .await?
    {
        InterceptOutcome::Intercepted(tls_stream) => {
            // A TLS context was just established over a transparent listener:
            // `httpsConnectHostname` becomes the generic cert name per §4.7,
            // so the reconstructed request URI and upstream dial both use
            // `https`, matching the CONNECT-then-intercept path's `connect`.
            let client = BufReader::with_capacity(buffer_size, tls_stream);
            session_loop(client, peer_addr, context, None, Some(generic_cert_name), None).await
        }
        InterceptOutcome::Tunnel(peeked) => {
            let client = BufReader::with_capacity(buffer_size, peeked);
            session_loop(client, peer_addr, context, None, None, None).await
        }
    }
}

/// Splits a `CONNECT` authority (`host:port`, no scheme) into its parts.
fn parse_authority(target: &str) -> Result<(String, u16), ProxyError> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::MalformedRequest(format!("CONNECT target missing port: {target}")))?;
    if host.is_empty() {
        return Err(ProxyError::MalformedRequest(format!("CONNECT target missing host: {target}")));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| ProxyError::MalformedRequest(format!("CONNECT target bad port: {target}")))?;
    Ok((host.to_string(), port))
}

async fn handle_connect<S>(
    mut client: BufReader<S>,
    peer_addr: SocketAddr,
    context: Arc<ProxyContext>,
    request_line: codec::RequestLine,
    headers: HeaderMap,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (host, port) = parse_authority(&request_line.target)?;
    let connect = Arc::new(ConnectRequest {
        authority: request_line.target.clone(),
        version: request_line.version,
        headers,
    });
    context.hooks.fire_tunnel_connect_request(connect.clone()).await;

    if !context.proxy_auth_allows() {
        context.hooks.fire_tunnel_connect_response(connect.clone(), 407).await;
        codec::write_status_line(&mut client, request_line.version, 407, "Proxy Authentication Required").await?;
        client.write_all(b"\r\n").await?;
        client.flush().await?;
        return Err(ProxyError::AuthDenied);
    }

    let excluded = context.config.is_excluded(&host);

    codec::write_status_line(&mut client, request_line.version, 200, "Connection established").await?;
    client
        .write_all(format!("Timestamp: {}\r\n", httpdate_now()).as_bytes())
        .await?;
    client.write_all(b"\r\n").await?;
    client.flush().await?;
    context.hooks.fire_tunnel_connect_response(connect.clone(), 200).await;

    let buffer_size = context.config.buffer_size;
    match interceptor::intercept(
        client,
        &host,
        excluded,
        context.ca.as_ref(),
        &context.tls_config,
        &context.config.supported_ssl_protocols,
    )
    .await?
    {
        InterceptOutcome::Intercepted(tls_stream) => {
            let client = BufReader::with_capacity(buffer_size, tls_stream);
            session_loop(client, peer_addr, context, Some(connect), None, None).await
        }
        InterceptOutcome::Tunnel(peeked) => tunnel_raw(peeked, &host, port, &context).await,
    }
}

fn httpdate_now() -> String {
    chrono::Utc::now().to_rfc2822()
}

async fn tunnel_raw<S>(
    client: PeekStream<S>,
    host: &str,
    port: u16,
    context: &ProxyContext,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(ProxyError::UpstreamUnavailable)?;
    SERVER_CONNECTION_COUNT.fetch_add(1, Ordering::SeqCst);
    let result = {
        let mut client = client;
        let mut tcp = tcp;
        tunnel::relay(&mut client, &mut tcp, context.config.buffer_size, &NoopObserver).await
    };
    SERVER_CONNECTION_COUNT.fetch_sub(1, Ordering::SeqCst);
    result.map_err(ProxyError::from)
}

// --- Upstream Connector ----------------------------------------------------

enum UpstreamIo {
    Plain(TcpStream),
    Tls(Box<ClientTlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamIo {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamIo::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamIo {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamIo::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamIo::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamIo::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamIo::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A connection to an origin (or upstream proxy), scoped to one client
/// session. `dispose` is the single decrement path for
/// `SERVER_CONNECTION_COUNT`: it is idempotent, and `Drop` calls it too so
/// every exit path — including error paths that never call it explicitly —
/// still decrements exactly once.
pub struct UpstreamConnection {
    pub host: String,
    pub port: u16,
    pub scheme: Scheme,
    pub version: HttpVersion,
    /// Set when this connection's socket is to an upstream HTTP proxy rather
    /// than the origin directly: the request line written to it must carry
    /// the absolute URI, since the proxy has no other way to learn the real
    /// target.
    pub via_http_proxy: bool,
    io: UpstreamIo,
    disposed: AtomicBool,
}

impl UpstreamConnection {
    fn new(host: String, port: u16, scheme: Scheme, version: HttpVersion, io: UpstreamIo, via_http_proxy: bool) -> Self {
        SERVER_CONNECTION_COUNT.fetch_add(1, Ordering::SeqCst);
        Self {
            host,
            port,
            scheme,
            version,
            via_http_proxy,
            io,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            SERVER_CONNECTION_COUNT.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn matches(&self, host: &str, port: u16, scheme: Scheme) -> bool {
        self.scheme == scheme && self.port == port && self.host.eq_ignore_ascii_case(host)
    }
}

impl Drop for UpstreamConnection {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl AsyncRead for UpstreamConnection {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl AsyncWrite for UpstreamConnection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

/// Opens direct or upstream-proxy-chained connections to an origin.
#[derive(Clone)]
pub struct TcpConnectionFactory {
    tls_config: Arc<TlsConfig>,
    roots: Arc<RootCertStore>,
}

impl TcpConnectionFactory {
    pub fn new(tls_config: Arc<TlsConfig>, roots: Arc<RootCertStore>) -> Self {
        Self { tls_config, roots }
    }

    pub async fn create_client(
        &self,
        host: &str,
        port: u16,
        version: HttpVersion,
        scheme: Scheme,
        http_proxy: Option<&UpstreamProxy>,
        https_proxy: Option<&UpstreamProxy>,
    ) -> Result<UpstreamConnection, ProxyError> {
        debug!(host, port, %scheme, "opening upstream connection");
        match scheme {
            Scheme::Https => self.create_https(host, port, version, https_proxy).await,
            Scheme::Http => self.create_http(host, port, version, http_proxy).await,
        }
    }

    async fn create_http(
        &self,
        host: &str,
        port: u16,
        version: HttpVersion,
        http_proxy: Option<&UpstreamProxy>,
    ) -> Result<UpstreamConnection, ProxyError> {
        let (connect_host, connect_port) = match http_proxy {
            Some(proxy) => (proxy.host.as_str(), proxy.port),
            None => (host, port),
        };
        let tcp = TcpStream::connect((connect_host, connect_port))
            .await
            .map_err(ProxyError::UpstreamUnavailable)?;
        Ok(UpstreamConnection::new(
            host.to_string(),
            port,
            Scheme::Http,
            version,
            UpstreamIo::Plain(tcp),
            http_proxy.is_some(),
        ))
    }

    async fn create_https(
        &self,
        host: &str,
        port: u16,
        version: HttpVersion,
        https_proxy: Option<&UpstreamProxy>,
    ) -> Result<UpstreamConnection, ProxyError> {
        let tcp = match https_proxy {
            Some(proxy) => self.connect_through_proxy(proxy, host, port).await?,
            None => TcpStream::connect((host, port))
                .await
                .map_err(ProxyError::UpstreamUnavailable)?,
        };

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| ProxyError::UpstreamUnavailable(io::Error::other(e)))?;
        let client_config = self
            .tls_config
            .client_config(self.roots.clone())
            .map_err(|e| ProxyError::UpstreamUnavailable(io::Error::other(e)))?;
        let connector = TlsConnector::from(Arc::new(client_config));
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(ProxyError::UpstreamUnavailable)?;

        Ok(UpstreamConnection::new(
            host.to_string(),
            port,
            Scheme::Https,
            version,
            UpstreamIo::Tls(Box::new(tls)),
            false,
        ))
    }

    async fn connect_through_proxy(
        &self,
        proxy: &UpstreamProxy,
        host: &str,
        port: u16,
    ) -> Result<TcpStream, ProxyError> {
        let mut tcp = TcpStream::connect((proxy.host.as_str(), proxy.port))
            .await
            .map_err(ProxyError::UpstreamUnavailable)?;
        let connect_line = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
        tcp.write_all(connect_line.as_bytes())
            .await
            .map_err(ProxyError::UpstreamUnavailable)?;

        let mut reader = BufReader::new(tcp);
        let status_line = codec::read_line(&mut reader, 8192)
            .await
            .map_err(ProxyError::UpstreamUnavailable)?
            .ok_or_else(|| ProxyError::UpstreamUnavailable(io::Error::other("upstream proxy closed before CONNECT response")))?;
        if !status_line.contains(" 200") {
            warn!(%status_line, proxy_host = %proxy.host, "upstream proxy refused CONNECT");
            return Err(ProxyError::UpstreamUnavailable(io::Error::other(format!(
                "upstream proxy refused CONNECT: {status_line}"
            ))));
        }
        let _ = codec::read_headers(&mut reader, 8192)
            .await
            .map_err(|e| ProxyError::UpstreamUnavailable(io::Error::other(e.to_string())))?;

        Ok(reader.into_inner())
    }
}

// --- Session Loop ------------------------------------------------------

/// Runs the session loop until the client closes, a hook cancels, or an
/// unrecoverable error is hit. `pending_first` carries the request line and
/// headers already read by the Client Dispatcher for the non-`CONNECT`
/// explicit-mode path, so they are not read twice. `https_connect_hostname`
/// is `Some` exactly when a transparent listener's TLS interception (rather
/// than an explicit-mode `CONNECT`) established the HTTPS context this
/// session runs under — §4.7's `httpsConnectHostname`.
async fn session_loop<S>(
    mut client: BufReader<S>,
    client_addr: SocketAddr,
    context: Arc<ProxyContext>,
    connect: Option<Arc<ConnectRequest>>,
    https_connect_hostname: Option<String>,
    mut pending_first: Option<(codec::RequestLine, HeaderMap)>,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let buffer_size = context.config.buffer_size;
    let mut upstream: Option<UpstreamConnection> = None;

    loop {
        let (request_line, headers) = match pending_first.take() {
            Some(pair) => pair,
            None => {
                let Some(line) = codec::read_line(&mut client, buffer_size).await? else {
                    break;
                };
                if line.is_empty() {
                    break;
                }
                let request_line = codec::parse_request_line(&line)?;
                let headers = codec::read_headers(&mut client, buffer_size).await?;
                (request_line, headers)
            }
        };

        let fallback_target = RUri::new(Uri::from_static("/"));
        let target = match resolve_target(&request_line.target, &headers, connect.as_deref(), https_connect_hostname.as_deref()) {
            Ok(target) => target,
            Err(err) => {
                report_and_dispose(&context, &mut upstream, client_addr, &connect, fallback_target, &err);
                return Err(err);
            }
        };

        if connect.is_none() && !context.proxy_auth_allows() {
            return Err(ProxyError::AuthDenied);
        }

        let target_for_report = target.clone();
        match handle_one_request(&mut client, &context, connect.as_ref(), target, request_line, headers, &mut upstream, buffer_size).await {
            Ok(true) => continue,
            Ok(false) => break,
            Err(err) => {
                report_and_dispose(&context, &mut upstream, client_addr, &connect, target_for_report, &err);
                return Err(err);
            }
        }
    }

    if let Some(conn) = upstream.take() {
        conn.dispose();
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn report_and_dispose(
    context: &ProxyContext,
    upstream: &mut Option<UpstreamConnection>,
    client_addr: SocketAddr,
    connect: &Option<Arc<ConnectRequest>>,
    target: RUri,
    err: &ProxyError,
) {
    if let Some(conn) = upstream.take() {
        conn.dispose();
    }
    if matches!(err, ProxyError::HookCancelled) {
        return;
    }
    let session = Session::new(client_addr, target, connect.clone());
    context.hooks.fire_exception(err, &session);
}

/// Reconstructs the absolute request URI. The HTTPS context for this session
/// was established either by a prior explicit-mode `CONNECT` (`connect`) or
/// by a transparent listener's own TLS interception
/// (`https_connect_hostname`, §4.7) — either one being present means the
/// scheme is `https` and supplies a fallback authority when `Host` is
/// missing.
fn resolve_target(
    target: &str,
    headers: &HeaderMap,
    connect: Option<&ConnectRequest>,
    https_connect_hostname: Option<&str>,
) -> Result<RUri, ProxyError> {
    let request_uri: Uri = target
        .parse()
        .map_err(|_| ProxyError::MalformedRequest(format!("bad request-target: {target}")))?;

    if request_uri.authority().is_some() {
        return Ok(RUri::new(request_uri));
    }

    let is_tls = connect.is_some() || https_connect_hostname.is_some();

    let authority = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| connect.map(|c| c.authority.clone()))
        .or_else(|| https_connect_hostname.map(str::to_string))
        .ok_or_else(|| ProxyError::MalformedRequest("missing Host header and no prior CONNECT authority".into()))?;

    let authority_uri: Uri = format!("http://{authority}")
        .parse()
        .map_err(|_| ProxyError::MalformedRequest(format!("bad Host header: {authority}")))?;

    let scheme = if is_tls { http::uri::Scheme::HTTPS } else { http::uri::Scheme::HTTP };
    RUri::new(authority_uri)
        .and(&request_uri, scheme)
        .map_err(|e| ProxyError::MalformedRequest(e.to_string()))
}

#[allow(clippy::too_many_arguments)]
async fn handle_one_request<S>(
    client: &mut BufReader<S>,
    context: &Arc<ProxyContext>,
    connect: Option<&Arc<ConnectRequest>>,
    target: RUri,
    request_line: codec::RequestLine,
    mut headers: HeaderMap,
    upstream: &mut Option<UpstreamConnection>,
    buffer_size: usize,
) -> Result<bool, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let flags = codec::extract_flags(&headers);

    let prelude_headers = headers.clone();
    let request = Arc::new(tokio::sync::Mutex::new(Request {
        method: request_line.method.clone(),
        uri: target.clone(),
        version: request_line.version,
        headers: std::mem::take(&mut headers),
        body: None,
        has_body: flags.has_body,
        is_chunked: flags.is_chunked,
        content_length: flags.content_length,
        expect_continue: flags.expect_continue,
        upgrade_to_websocket: flags.upgrade_to_websocket,
        request_locked: false,
        cancel: false,
    }));

    if context.hooks.fire_before_request(request.clone()).await {
        return Err(ProxyError::HookCancelled);
    }

    let mut request = Arc::try_unwrap(request)
        .map_err(|_| ProxyError::UpstreamIo(io::Error::other("hook retained request handle past fan-out")))?
        .into_inner();
    request.lock();
    codec::prepare_request_headers(&mut request.headers);
    request
        .headers
        .insert(HOST, HeaderValue::from_str(&target.host_header_value()).map_err(|e| ProxyError::MalformedHeader(e.to_string()))?);

    // A hook that substituted the body overrides framing: Content-Length is
    // recomputed from the bytes in hand and chunked re-encoding is not
    // attempted.
    if let Some(body) = request.body.as_ref() {
        let len = body.len();
        request.headers.remove(http::header::TRANSFER_ENCODING);
        request.headers.insert(
            http::header::CONTENT_LENGTH,
            HeaderValue::from_str(&len.to_string()).map_err(|e| ProxyError::MalformedHeader(e.to_string()))?,
        );
        request.content_length = len as u64;
        request.is_chunked = false;
        request.has_body = true;
    }

    let host = target.host().to_string();
    let port = target.port();
    let scheme = target.scheme();

    let needs_new_upstream = match upstream.as_ref() {
        Some(existing) => !existing.matches(&host, port, scheme),
        None => true,
    };
    if needs_new_upstream {
        if let Some(old) = upstream.take() {
            old.dispose();
        }
        let http_proxy = context.hooks.resolve_http_proxy(&host, port).await.or_else(|| context.config.upstream_http_proxy.clone());
        let https_proxy = context.hooks.resolve_https_proxy(&host, port).await.or_else(|| context.config.upstream_https_proxy.clone());
        let conn = context
            .connector
            .create_client(&host, port, request.version, scheme, http_proxy.as_ref(), https_proxy.as_ref())
            .await?;
        *upstream = Some(conn);
    }
    let conn = upstream
        .as_mut()
        .ok_or_else(|| ProxyError::UpstreamIo(io::Error::other("upstream connection missing after ensure step")))?;

    if request.upgrade_to_websocket {
        let mut prelude = format!("{} {} {}\r\n", request_line.method, request_line.target, request_line.version);
        for (name, value) in prelude_headers.iter() {
            prelude.push_str(name.as_str());
            prelude.push_str(": ");
            prelude.push_str(value.to_str().unwrap_or(""));
            prelude.push_str("\r\n");
        }
        prelude.push_str("\r\n");
        tunnel::relay_with_upstream_prelude(client, conn, prelude.as_bytes(), buffer_size, &NoopObserver)
            .await
            .map_err(ProxyError::from)?;
        return Ok(false);
    }

    let response = forward(client, conn, &request, context.config.enable_100_continue, buffer_size).await?;
    conn.version = request.version;

    let keep_alive = response.keep_alive && !needs_reconnect_after(&response);
    if !keep_alive {
        if let Some(conn) = upstream.take() {
            conn.dispose();
        }
    }

    Ok(keep_alive)
}

fn needs_reconnect_after(response: &Response) -> bool {
    response.expectation_failed
}

// --- Forwarding --------------------------------------------------------

async fn forward<S>(
    client: &mut BufReader<S>,
    upstream: &mut UpstreamConnection,
    request: &Request,
    enable_100_continue: bool,
    buffer_size: usize,
) -> Result<Response, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let via_http_proxy = upstream.via_http_proxy;
    write_request_head(upstream, request, via_http_proxy).await?;

    let mut expectation_failed = false;
    if request.expect_continue && enable_100_continue {
        upstream.flush().await?;
        let mut upstream_reader = BufReader::with_capacity(buffer_size, &mut *upstream);
        let line = codec::read_line(&mut upstream_reader, buffer_size)
            .await?
            .ok_or(ProxyError::ClientClosed)?;
        let status = parse_status_line(&line)?;
        if status.status == 100 {
            codec::write_status_line(client, request.version, 100, "Continue").await?;
            client.write_all(b"\r\n").await?;
            client.flush().await?;
        } else {
            expectation_failed = status.status == 417;
            let resp_headers = codec::read_headers(&mut upstream_reader, buffer_size).await?;
            let mut response =
                write_response_head(client, status.status, status.version, status.reason, &resp_headers).await?;
            response.expectation_failed = expectation_failed;
            forward_response_body(&mut upstream_reader, client, &resp_headers, buffer_size, status.status, &request.method).await?;
            client.flush().await?;
            return Ok(response);
        }
    } else {
        upstream.flush().await?;
    }

    if !expectation_failed && request.has_body {
        if let Some(body) = request.body.as_ref() {
            upstream.write_all(body).await?;
        } else {
            forward_request_body(client, upstream, request, buffer_size).await?;
        }
    }
    upstream.flush().await?;

    let mut upstream_reader = BufReader::with_capacity(buffer_size, &mut *upstream);
    let response = read_and_forward_response(&mut upstream_reader, client, buffer_size, &request.method).await?;
    client.flush().await?;
    Ok(response)
}

async fn write_request_head<W>(upstream: &mut W, request: &Request, via_http_proxy: bool) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    let target = if via_http_proxy {
        request.uri.to_string()
    } else {
        request.uri.path_and_query().to_string()
    };
    upstream
        .write_all(format!("{} {} {}\r\n", request.method, target, request.version).as_bytes())
        .await?;
    codec::write_headers(upstream, &request.headers).await?;
    Ok(())
}

async fn forward_request_body<R, W>(
    client: &mut R,
    upstream: &mut W,
    request: &Request,
    buffer_size: usize,
) -> Result<(), ProxyError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if request.is_chunked {
        copy_chunked(client, upstream, buffer_size).await
    } else {
        copy_fixed_length(client, upstream, request.content_length).await
    }
}

async fn read_and_forward_response<R, W>(
    upstream: &mut R,
    client: &mut W,
    buffer_size: usize,
    request_method: &str,
) -> Result<Response, ProxyError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let line = codec::read_line(upstream, buffer_size).await?.ok_or(ProxyError::ClientClosed)?;
    let status = parse_status_line(&line)?;
    let headers = codec::read_headers(upstream, buffer_size).await?;
    let response = write_response_head(client, status.status, status.version, status.reason, &headers).await?;
    forward_response_body(upstream, client, &headers, buffer_size, status.status, request_method).await?;
    Ok(response)
}

async fn write_response_head<W>(
    client: &mut W,
    status: u16,
    version: HttpVersion,
    reason: String,
    headers: &HeaderMap,
) -> Result<Response, ProxyError>
where
    W: AsyncWrite + Unpin,
{
    codec::write_status_line(client, version, status, &reason).await?;
    codec::write_headers(client, headers).await?;
    let mut response = Response::new(version, status, reason);
    response.headers = headers.clone();
    response.keep_alive = codec::keep_alive_for(version, headers);
    Ok(response)
}

#[allow(clippy::too_many_arguments)]
async fn forward_response_body<R, W>(
    upstream: &mut R,
    client: &mut W,
    headers: &HeaderMap,
    buffer_size: usize,
    status: u16,
    request_method: &str,
) -> Result<(), ProxyError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if is_bodiless_response(status, request_method) {
        return Ok(());
    }
    let flags = codec::extract_flags(headers);
    if flags.is_chunked {
        copy_chunked(upstream, client, buffer_size).await
    } else if headers.contains_key(http::header::CONTENT_LENGTH) {
        copy_fixed_length(upstream, client, flags.content_length).await
    } else {
        copy_until_eof(upstream, client).await
    }
}

/// Responses that carry no body regardless of framing headers: 1xx
/// informational, `204 No Content`, `304 Not Modified`, and any response to
/// a `HEAD` request. Falling through to `copy_until_eof` for one of these
/// would block until the upstream closes, which never happens on a
/// keep-alive connection.
fn is_bodiless_response(status: u16, request_method: &str) -> bool {
    matches!(status, 100..=199 | 204 | 304) || request_method.eq_ignore_ascii_case("HEAD")
}

struct StatusLine {
    status: u16,
    version: HttpVersion,
    reason: String,
}

/// Parses `HTTP/<v> <status> <reason>`.
fn parse_status_line(line: &str) -> Result<StatusLine, ProxyError> {
    let mut parts = line.splitn(3, ' ');
    let version_str = parts.next().ok_or_else(|| ProxyError::MalformedRequest(format!("bad status line: {line}")))?;
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProxyError::MalformedRequest(format!("bad status line: {line}")))?;
    let reason = parts.next().unwrap_or("").to_string();
    let version = if version_str.eq_ignore_ascii_case("HTTP/1.0") {
        HttpVersion(http::Version::HTTP_10)
    } else {
        HttpVersion(http::Version::HTTP_11)
    };
    Ok(StatusLine { status, version, reason })
}

async fn copy_fixed_length<R, W>(src: &mut R, dst: &mut W, len: u64) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = len;
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let to_read = remaining.min(buf.len() as u64) as usize;
        let n = src.read(&mut buf[..to_read]).await?;
        if n == 0 {
            return Err(ProxyError::ClientClosed);
        }
        dst.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    Ok(())
}

async fn copy_until_eof<R, W>(src: &mut R, dst: &mut W) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n]).await?;
    }
    Ok(())
}

async fn copy_chunked<R, W>(src: &mut R, dst: &mut W, max_line: usize) -> Result<(), ProxyError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let size_line = codec::read_line(src, max_line).await?.ok_or(ProxyError::ClientClosed)?;
        let size = u64::from_str_radix(size_line.split(';').next().unwrap_or("").trim(), 16)
            .map_err(|_| ProxyError::MalformedRequest(format!("bad chunk size: {size_line}")))?;
        dst.write_all(format!("{size_line}\r\n").as_bytes()).await?;
        if size == 0 {
            break;
        }
        let mut remaining = size;
        let mut buf = [0u8; 8192];
        while remaining > 0 {
            let to_read = remaining.min(buf.len() as u64) as usize;
            src.read_exact(&mut buf[..to_read]).await?;
            dst.write_all(&buf[..to_read]).await?;
            remaining -= to_read as u64;
        }
        let mut crlf = [0u8; 2];
        src.read_exact(&mut crlf).await?;
        dst.write_all(&crlf).await?;
    }
    loop {
        let line = codec::read_line(src, max_line).await?.ok_or(ProxyError::ClientClosed)?;
        dst.write_all(format!("{line}\r\n").as_bytes()).await?;
        if line.is_empty() {
            break;
        }
    }
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn bodiless_responses_skip_eof_framing() {
        assert!(is_bodiless_response(204, "GET"));
        assert!(is_bodiless_response(304, "GET"));
        assert!(is_bodiless_response(100, "GET"));
        assert!(is_bodiless_response(200, "head"));
        assert!(!is_bodiless_response(200, "GET"));
    }

    #[test]
    fn parses_connect_authority() {
        let (host, port) = parse_authority("example.com:443").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
        assert!(parse_authority("example.com").is_err());
        assert!(parse_authority(":443").is_err());
    }

    #[test]
    fn resolves_absolute_form_target_directly() {
        let headers = HeaderMap::new();
        let target = resolve_target("http://example.com/a", &headers, None, None).unwrap();
        assert_eq!(target.host(), "example.com");
        assert_eq!(target.path_and_query(), "/a");
    }

    #[test]
    fn resolves_origin_form_target_via_host_header() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("example.com"));
        let target = resolve_target("/a", &headers, None, None).unwrap();
        assert_eq!(target.host(), "example.com");
        assert_eq!(target.path_and_query(), "/a");
        assert!(!target.is_tls());
    }

    #[test]
    fn resolves_origin_form_target_via_connect_authority_when_host_missing() {
        let headers = HeaderMap::new();
        let connect = ConnectRequest {
            authority: "example.com:443".into(),
            version: HttpVersion(http::Version::HTTP_11),
            headers: HeaderMap::new(),
        };
        let target = resolve_target("/a", &headers, Some(&connect), None).unwrap();
        assert_eq!(target.host(), "example.com");
        assert!(target.is_tls());
    }

    #[test]
    fn resolves_origin_form_target_as_tls_under_transparent_interception() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("example.com"));
        let target = resolve_target("/a", &headers, None, Some("generic-cert-name")).unwrap();
        assert_eq!(target.host(), "example.com");
        assert!(target.is_tls());
    }

    #[test]
    fn falls_back_to_https_connect_hostname_when_host_missing() {
        let headers = HeaderMap::new();
        let target = resolve_target("/a", &headers, None, Some("example.com")).unwrap();
        assert_eq!(target.host(), "example.com");
        assert!(target.is_tls());
    }

    #[test]
    fn rejects_origin_form_target_with_no_host_source() {
        let headers = HeaderMap::new();
        assert!(resolve_target("/a", &headers, None, None).is_err());
    }
}
