//! End-to-end session-loop tests: real sockets through `ProxyServer`,
//! exercising the literal wire-protocol scenarios from the design notes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use regex::Regex;
use rustls::RootCertStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use roxy_proxy::config::ProxyConfig;
use roxy_proxy::hooks::HookRegistry;
use roxy_proxy::proxy::{ProxyContext, ProxyServer, SERVER_CONNECTION_COUNT};
use roxy_shared::cert::generate_root_ca_with_path;
use roxy_shared::tls::TlsConfig;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Serializes the one test below that reads the process-wide
/// `SERVER_CONNECTION_COUNT`; every other test in this file owns its own
/// ephemeral sockets and can run concurrently with it.
static SERIAL: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

async fn start_proxy(config: ProxyConfig) -> (ProxyServer, tempfile::TempDir) {
    start_proxy_with_hooks(config, HookRegistry::new()).await
}

async fn start_proxy_with_hooks(config: ProxyConfig, hooks: HookRegistry) -> (ProxyServer, tempfile::TempDir) {
    roxy_proxy::init_test_logging();
    let temp_dir = tempfile::tempdir().unwrap();
    let ca = generate_root_ca_with_path(Some(temp_dir.path().to_path_buf())).unwrap();
    let context = Arc::new(ProxyContext::new(
        config,
        Arc::new(ca),
        hooks,
        TlsConfig::default(),
        Arc::new(RootCertStore::empty()),
    ));
    let server = ProxyServer::bind(context, None).await.unwrap();
    (server, temp_dir)
}

async fn read_until_double_crlf<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await.unwrap();
        assert_ne!(n, 0, "stream closed before a blank line was seen");
        buf.push(byte[0]);
        if buf.len() >= 4 && buf[buf.len() - 4..] == *b"\r\n\r\n" {
            break;
        }
    }
    buf
}

async fn read_exact_n<S: tokio::io::AsyncRead + Unpin>(stream: &mut S, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

/// Plaintext GET via explicit proxy. `Accept-Encoding` is normalized and the
/// request-target is rewritten to origin-form; the `Host` header is re-sent
/// without a redundant default port.
#[tokio::test]
async fn plaintext_get_rewrites_accept_encoding_and_host() {
    let (server, _tmp) = start_proxy(ProxyConfig::default()).await;

    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_port = origin.local_addr().unwrap().port();

    let origin_task = tokio::spawn(async move {
        let (mut stream, _) = origin.accept().await.unwrap();
        let head = String::from_utf8(read_until_double_crlf(&mut stream).await).unwrap();
        // header names always round-trip through `http::HeaderMap` in lowercase,
        // regardless of how the client wrote them on the wire.
        let expected =
            format!("GET /a HTTP/1.1\r\nhost: 127.0.0.1:{origin_port}\r\naccept-encoding: gzip,deflate\r\n\r\n");
        assert_eq!(head, expected);
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
    });

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    let request =
        format!("GET http://127.0.0.1:{origin_port}/a HTTP/1.1\r\nHost: 127.0.0.1:{origin_port}\r\nAccept-Encoding: br\r\n\r\n");
    client.write_all(request.as_bytes()).await.unwrap();

    let head = String::from_utf8(read_until_double_crlf(&mut client).await).unwrap();
    assert_eq!(head, "HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\n");
    assert_eq!(read_exact_n(&mut client, 5).await, b"hello");

    timeout(TIMEOUT, origin_task).await.unwrap().unwrap();
}

/// Two consecutive requests to the same host reuse one upstream connection;
/// switching host disposes the old one and opens exactly one new one;
/// `SERVER_CONNECTION_COUNT` returns to its baseline once the client
/// connection closes.
#[tokio::test]
async fn keep_alive_reuse_and_counter_invariant() {
    let _guard = SERIAL.lock().await;
    let baseline = SERVER_CONNECTION_COUNT.load(Ordering::SeqCst);

    let (server, _tmp) = start_proxy(ProxyConfig::default()).await;

    let origin_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_a_port = origin_a.local_addr().unwrap().port();
    let origin_a_accepts = Arc::new(AtomicUsize::new(0));
    let origin_a_accepts_clone = origin_a_accepts.clone();
    let origin_a_task = tokio::spawn(async move {
        let (mut stream, _) = origin_a.accept().await.unwrap();
        origin_a_accepts_clone.fetch_add(1, Ordering::SeqCst);
        for _ in 0..2 {
            let _head = read_until_double_crlf(&mut stream).await;
            stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await.unwrap();
        }
    });

    let origin_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_b_port = origin_b.local_addr().unwrap().port();
    let origin_b_accepts = Arc::new(AtomicUsize::new(0));
    let origin_b_accepts_clone = origin_b_accepts.clone();
    let origin_b_task = tokio::spawn(async move {
        let (mut stream, _) = origin_b.accept().await.unwrap();
        origin_b_accepts_clone.fetch_add(1, Ordering::SeqCst);
        let _head = read_until_double_crlf(&mut stream).await;
        stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await.unwrap();
    });

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

    for path in ["/1", "/2"] {
        let request =
            format!("GET http://127.0.0.1:{origin_a_port}{path} HTTP/1.1\r\nHost: 127.0.0.1:{origin_a_port}\r\n\r\n");
        client.write_all(request.as_bytes()).await.unwrap();
        let head = String::from_utf8(read_until_double_crlf(&mut client).await).unwrap();
        assert!(head.starts_with("HTTP/1.1 200"));
    }

    let request = format!("GET http://127.0.0.1:{origin_b_port}/3 HTTP/1.1\r\nHost: 127.0.0.1:{origin_b_port}\r\n\r\n");
    client.write_all(request.as_bytes()).await.unwrap();
    let head = String::from_utf8(read_until_double_crlf(&mut client).await).unwrap();
    assert!(head.starts_with("HTTP/1.1 200"));

    drop(client);

    timeout(TIMEOUT, origin_a_task).await.unwrap().unwrap();
    timeout(TIMEOUT, origin_b_task).await.unwrap().unwrap();

    assert_eq!(origin_a_accepts.load(Ordering::SeqCst), 1);
    assert_eq!(origin_b_accepts.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(SERVER_CONNECTION_COUNT.load(Ordering::SeqCst), baseline);
}

/// An excluded `CONNECT` target gets a byte-for-byte raw tunnel, no TLS
/// handshake attempted on either leg.
#[tokio::test]
async fn excluded_connect_tunnels_raw_bytes() {
    let config = ProxyConfig {
        exclude_https_patterns: vec![Regex::new(r"^127\.0\.0\.1$").unwrap()],
        ..ProxyConfig::default()
    };
    let (server, _tmp) = start_proxy(config).await;

    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_port = origin.local_addr().unwrap().port();
    let origin_task = tokio::spawn(async move {
        let (mut stream, _) = origin.accept().await.unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        stream.write_all(&buf[..n]).await.unwrap();
    });

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    let connect_line = format!("CONNECT 127.0.0.1:{origin_port} HTTP/1.1\r\n\r\n");
    client.write_all(connect_line.as_bytes()).await.unwrap();

    let head = String::from_utf8(read_until_double_crlf(&mut client).await).unwrap();
    assert!(head.starts_with("HTTP/1.1 200"));

    let payload = b"ping-pong-test";
    client.write_all(payload).await.unwrap();
    let echoed = read_exact_n(&mut client, payload.len()).await;
    assert_eq!(&echoed, payload);

    timeout(TIMEOUT, origin_task).await.unwrap().unwrap();
}

/// A WebSocket upgrade request is replayed verbatim to the upstream, then
/// both sides are blindly relayed.
#[tokio::test]
async fn websocket_upgrade_relays_raw_bytes_after_prelude() {
    let (server, _tmp) = start_proxy(ProxyConfig::default()).await;

    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_port = origin.local_addr().unwrap().port();
    let origin_task = tokio::spawn(async move {
        let (mut stream, _) = origin.accept().await.unwrap();
        let head = String::from_utf8(read_until_double_crlf(&mut stream).await).unwrap();
        assert!(head.starts_with("GET "));
        // header name is lowercased by `http::HeaderMap` on the way through;
        // the value is preserved exactly as the client sent it.
        assert!(head.contains("upgrade: websocket"));
        stream
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        stream.write_all(&buf[..n]).await.unwrap();
    });

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    let request = format!(
        "GET http://127.0.0.1:{origin_port}/ws HTTP/1.1\r\nHost: 127.0.0.1:{origin_port}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let response = String::from_utf8(read_until_double_crlf(&mut client).await).unwrap();
    assert_eq!(response, "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n");

    client.write_all(b"hello").await.unwrap();
    let echoed = read_exact_n(&mut client, 5).await;
    assert_eq!(&echoed, b"hello");

    timeout(TIMEOUT, origin_task).await.unwrap().unwrap();
}

/// `Expect: 100-continue` is relayed before the body is forwarded; the
/// final response only follows once the body has been sent.
#[tokio::test]
async fn expect_continue_negotiates_before_body() {
    let (server, _tmp) = start_proxy(ProxyConfig::default()).await;

    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_port = origin.local_addr().unwrap().port();
    let origin_task = tokio::spawn(async move {
        let (mut stream, _) = origin.accept().await.unwrap();
        let head = String::from_utf8(read_until_double_crlf(&mut stream).await).unwrap();
        assert!(head.contains("expect: 100-continue"));
        stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await.unwrap();

        let mut body = [0u8; 5];
        stream.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"hello");

        stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await.unwrap();
    });

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    let request = format!(
        "POST http://127.0.0.1:{origin_port}/body HTTP/1.1\r\nHost: 127.0.0.1:{origin_port}\r\nContent-Length: 5\r\nExpect: 100-continue\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let interim = String::from_utf8(read_until_double_crlf(&mut client).await).unwrap();
    assert_eq!(interim, "HTTP/1.1 100 Continue\r\n\r\n");

    client.write_all(b"hello").await.unwrap();

    let head = String::from_utf8(read_until_double_crlf(&mut client).await).unwrap();
    assert_eq!(head, "HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\n");
    assert_eq!(read_exact_n(&mut client, 2).await, b"ok");

    timeout(TIMEOUT, origin_task).await.unwrap().unwrap();
}

/// A `BeforeRequest` hook that substitutes the body (as if it had already
/// consumed and decoded it) overrides framing — the client's original
/// `Transfer-Encoding: chunked` body is never streamed, and the upstream
/// sees a plain `Content-Length` matching the replacement bytes.
#[tokio::test]
async fn before_request_hook_body_substitution_overrides_framing() {
    struct ReplaceBodyHook;
    impl roxy_proxy::hooks::BeforeRequestHook for ReplaceBodyHook {
        fn call(&self, request: Arc<tokio::sync::Mutex<roxy_proxy::flow::Request>>) -> futures::future::BoxFuture<'static, ()> {
            Box::pin(async move {
                let mut request = request.lock().await;
                request.set_body(bytes::Bytes::from_static(b"replaced"));
            })
        }
    }

    let mut hooks = HookRegistry::new();
    hooks.add_before_request(Arc::new(ReplaceBodyHook));
    let (server, _tmp) = start_proxy_with_hooks(ProxyConfig::default(), hooks).await;

    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_port = origin.local_addr().unwrap().port();
    let origin_task = tokio::spawn(async move {
        let (mut stream, _) = origin.accept().await.unwrap();
        let head = String::from_utf8(read_until_double_crlf(&mut stream).await).unwrap();
        assert!(head.contains("content-length: 8"));
        assert!(!head.to_lowercase().contains("transfer-encoding"));
        let body = read_exact_n(&mut stream, 8).await;
        assert_eq!(&body, b"replaced");
        stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await.unwrap();
    });

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    let request = format!(
        "POST http://127.0.0.1:{origin_port}/body HTTP/1.1\r\nHost: 127.0.0.1:{origin_port}\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let head = String::from_utf8(read_until_double_crlf(&mut client).await).unwrap();
    assert_eq!(head, "HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n");

    timeout(TIMEOUT, origin_task).await.unwrap().unwrap();
}

/// A `204 No Content` response carrying neither `Content-Length` nor
/// `Transfer-Encoding: chunked` must not be read to EOF — the upstream
/// connection stays open (keep-alive), and a second request on the same
/// client connection must still go through.
#[tokio::test]
async fn bodiless_response_does_not_block_keep_alive_reuse() {
    let (server, _tmp) = start_proxy(ProxyConfig::default()).await;

    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_port = origin.local_addr().unwrap().port();
    let origin_task = tokio::spawn(async move {
        let (mut stream, _) = origin.accept().await.unwrap();
        let _head = read_until_double_crlf(&mut stream).await;
        stream.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();

        let _head = read_until_double_crlf(&mut stream).await;
        stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await.unwrap();
    });

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    let request =
        format!("GET http://127.0.0.1:{origin_port}/1 HTTP/1.1\r\nHost: 127.0.0.1:{origin_port}\r\n\r\n");
    client.write_all(request.as_bytes()).await.unwrap();

    let head = timeout(TIMEOUT, read_until_double_crlf(&mut client)).await.unwrap();
    assert_eq!(String::from_utf8(head).unwrap(), "HTTP/1.1 204 No Content\r\n\r\n");

    let request =
        format!("GET http://127.0.0.1:{origin_port}/2 HTTP/1.1\r\nHost: 127.0.0.1:{origin_port}\r\n\r\n");
    client.write_all(request.as_bytes()).await.unwrap();

    let head = timeout(TIMEOUT, read_until_double_crlf(&mut client)).await.unwrap();
    assert_eq!(String::from_utf8(head).unwrap(), "HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\n");
    assert_eq!(read_exact_n(&mut client, 2).await, b"ok");

    timeout(TIMEOUT, origin_task).await.unwrap().unwrap();
}
