use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Binds a loopback listener; `port == Some(0)` (or `None`) yields an
/// ephemeral port, which is how integration tests get a collision-free
/// address for the proxy server.
pub async fn local_tcp_listener(port: Option<u16>) -> Result<TcpListener, io::Error> {
    TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port.unwrap_or(0)))).await
}
