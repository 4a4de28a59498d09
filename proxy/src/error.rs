use std::{error::Error, fmt};

/// The closed error taxonomy for the session loop. Every variant maps to a
/// terminal action (close silently, close with a response, report and
/// close) decided at the point it is caught, never further up the stack.
#[derive(Debug)]
pub enum ProxyError {
    /// Clean EOF while reading a request line: end the session silently.
    ClientClosed,
    /// The request line or headers could not be parsed.
    MalformedRequest(String),
    MalformedHeader(String),
    /// Proxy authentication was denied by the external auth collaborator.
    AuthDenied,
    /// Certificate acquisition or the TLS server handshake failed.
    TlsHandshakeFailed(Box<dyn Error + Send + Sync>),
    /// Connecting to the origin or an upstream proxy failed.
    UpstreamUnavailable(std::io::Error),
    /// A read/write failure after the upstream connection was established.
    UpstreamIo(std::io::Error),
    /// A `BeforeRequest` hook set `request.cancel`.
    HookCancelled,
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::ClientClosed => write!(f, "client closed the connection"),
            ProxyError::MalformedRequest(msg) => write!(f, "malformed request: {msg}"),
            ProxyError::MalformedHeader(msg) => write!(f, "malformed header: {msg}"),
            ProxyError::AuthDenied => write!(f, "proxy authentication denied"),
            ProxyError::TlsHandshakeFailed(e) => write!(f, "TLS handshake failed: {e}"),
            ProxyError::UpstreamUnavailable(e) => write!(f, "upstream unavailable: {e}"),
            ProxyError::UpstreamIo(e) => write!(f, "upstream I/O error: {e}"),
            ProxyError::HookCancelled => write!(f, "request cancelled by hook"),
        }
    }
}

impl Error for ProxyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ProxyError::TlsHandshakeFailed(e) => Some(e.as_ref()),
            ProxyError::UpstreamUnavailable(e) | ProxyError::UpstreamIo(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rustls::Error> for ProxyError {
    fn from(value: rustls::Error) -> Self {
        ProxyError::TlsHandshakeFailed(Box::new(value))
    }
}

/// Classifies a plain I/O error arising while talking to an *already
/// established* upstream connection as `UpstreamIo`; callers establishing a
/// new connection should use `ProxyError::UpstreamUnavailable` directly.
impl From<std::io::Error> for ProxyError {
    fn from(value: std::io::Error) -> Self {
        if value.kind() == std::io::ErrorKind::UnexpectedEof {
            ProxyError::ClientClosed
        } else {
            ProxyError::UpstreamIo(value)
        }
    }
}
