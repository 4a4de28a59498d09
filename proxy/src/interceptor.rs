//! On an accepted `CONNECT`, peek the first client byte to decide whether
//! this is a TLS ClientHello, mint (or reuse) a wildcard-normalized leaf
//! certificate, and perform the server-side TLS handshake, or else hand the
//! connection off unmolested to the raw tunnel.

use rustls::SupportedProtocolVersion;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{TlsAcceptor, server::TlsStream};
use tracing::{debug, trace};

use roxy_shared::{cert::CertificateAuthority, tls::TlsConfig, uri::wildcard_host};

use crate::error::ProxyError;
use crate::peek_stream::PeekStream;

/// The TLS record type byte for a ClientHello (first byte of a TLS record
/// carrying a handshake message with `HandshakeType::client_hello`).
const CLIENT_HELLO_RECORD_TYPE: u8 = 0x16;

pub enum InterceptOutcome<S> {
    /// TLS interception succeeded; `Session Loop` should read plaintext
    /// HTTP off this wrapped stream from here on.
    Intercepted(TlsStream<PeekStream<S>>),
    /// Excluded by configuration, or the first byte wasn't a ClientHello:
    /// hand the peeked stream to the Raw Tunnel unchanged.
    Tunnel(PeekStream<S>),
}

/// Runs the peek-then-decide interception steps (the `200 Connection
/// established` line is written by the caller beforehand, since that
/// happens before we even know whether this will be excluded). `host` is the
/// bare hostname from the `CONNECT` authority, used both for the exclusion
/// check result the caller already computed and for the wildcard cert
/// subject.
pub async fn intercept<S>(
    stream: S,
    host: &str,
    excluded: bool,
    ca: &dyn CertificateAuthority,
    tls_config: &TlsConfig,
    versions: &[&'static SupportedProtocolVersion],
) -> Result<InterceptOutcome<S>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (peeked, first_bytes) = PeekStream::new(stream, 1)
        .await
        .map_err(|e| ProxyError::TlsHandshakeFailed(Box::new(e)))?;

    let is_client_hello = first_bytes.first() == Some(&CLIENT_HELLO_RECORD_TYPE);

    if excluded || !is_client_hello {
        trace!(host, excluded, is_client_hello, "not intercepting, tunneling raw");
        return Ok(InterceptOutcome::Tunnel(peeked));
    }

    let wildcard = wildcard_host(host);
    let leaf = ca
        .sign_leaf(host)
        .map_err(|e| ProxyError::TlsHandshakeFailed(Box::new(e)))?;
    debug!(host, wildcard, "minted leaf certificate for interception");

    let server_config = tls_config
        .server_config(leaf, versions)
        .map_err(|e| ProxyError::TlsHandshakeFailed(Box::new(e)))?;

    let acceptor = TlsAcceptor::from(std::sync::Arc::new(server_config));
    let tls_stream = acceptor
        .accept(peeked)
        .await
        .map_err(|e| ProxyError::TlsHandshakeFailed(Box::new(e)))?;

    Ok(InterceptOutcome::Intercepted(tls_stream))
}
