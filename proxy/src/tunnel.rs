//! Once a `CONNECT` is excluded (or a request upgrades to WebSocket), the
//! session loop stops parsing and becomes a blind bidirectional byte relay
//! between the client and the upstream connection.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Observes byte counts crossing the tunnel; the default no-op impl is what
/// every caller gets unless they want traffic accounting.
pub trait TunnelObserver: Send + Sync {
    fn client_to_upstream(&self, _bytes: usize) {}
    fn upstream_to_client(&self, _bytes: usize) {}
}

pub struct NoopObserver;
impl TunnelObserver for NoopObserver {}

/// Relays bytes in both directions until either side closes or errors. Ends
/// the moment one direction hits EOF; the half-closed remainder on the other
/// side is simply dropped, matching a plain TCP proxy rather than a protocol
/// that cares about half-close semantics.
pub async fn relay<C, U>(
    mut client: C,
    mut upstream: U,
    buffer_size: usize,
    observer: &dyn TunnelObserver,
) -> std::io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_buf = vec![0u8; buffer_size];
    let mut upstream_buf = vec![0u8; buffer_size];

    loop {
        tokio::select! {
            result = client.read(&mut client_buf) => {
                let n = result?;
                if n == 0 {
                    break;
                }
                upstream.write_all(&client_buf[..n]).await?;
                observer.client_to_upstream(n);
            }
            result = upstream.read(&mut upstream_buf) => {
                let n = result?;
                if n == 0 {
                    break;
                }
                client.write_all(&upstream_buf[..n]).await?;
                observer.upstream_to_client(n);
            }
        }
    }
    Ok(())
}

/// WebSocket-upgrade pass-through: the request line and headers that already
/// convinced the origin to answer `101 Switching Protocols` were consumed by
/// the codec before the loop knew this was an upgrade, so they're replayed
/// onto the upstream side before the blind relay starts.
pub async fn relay_with_upstream_prelude<C, U>(
    client: C,
    mut upstream: U,
    prelude: &[u8],
    buffer_size: usize,
    observer: &dyn TunnelObserver,
) -> std::io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    upstream.write_all(prelude).await?;
    relay(client, upstream, buffer_size, observer).await
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn relays_bytes_until_either_side_closes() {
        let (mut client_near, client_far) = duplex(64);
        let (mut upstream_near, upstream_far) = duplex(64);

        let relay_task = tokio::spawn(async move {
            relay(client_far, upstream_far, 16, &NoopObserver).await
        });

        client_near.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        upstream_near.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        upstream_near.write_all(b"world").await.unwrap();
        let mut buf = [0u8; 5];
        client_near.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        drop(client_near);
        drop(upstream_near);
        relay_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn prelude_is_written_before_client_bytes_relay() {
        let (client_near, client_far) = duplex(64);
        let (mut upstream_near, upstream_far) = duplex(128);
        drop(client_near);

        relay_with_upstream_prelude(client_far, upstream_far, b"GET / HTTP/1.1\r\n\r\n", 16, &NoopObserver)
            .await
            .unwrap();

        let mut buf = vec![0u8; 19];
        upstream_near.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET / HTTP/1.1\r\n\r\n");
    }
}
