//! Byte relay for upgraded WebSocket connections
//!
//! Frames are not parsed or run through hooks. Once both sides have switched
//! protocols the two streams are spliced until either end closes.

use crate::flow::Flow;
use crate::socket::MaybeTlsStream;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Splice `client` and `upstream` until either side closes.
///
/// `client_buffered` holds bytes the client sent after its handshake that
/// were already read; the upstream read buffer is drained the same way.
pub(crate) async fn relay<C>(
  flow: &Flow,
  mut client: C,
  client_buffered: Bytes,
  upstream: BufReader<MaybeTlsStream>,
) where
  C: AsyncRead + AsyncWrite + Unpin,
{
  let upstream_buffered = Bytes::copy_from_slice(upstream.buffer());
  let mut upstream = upstream.into_inner();

  let result = async {
    if !client_buffered.is_empty() {
      upstream.write_all(&client_buffered).await?;
    }
    if !upstream_buffered.is_empty() {
      client.write_all(&upstream_buffered).await?;
    }
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await
  }
  .await;

  match result {
    Ok((sent, received)) => tracing::debug!(
      flow = %flow.id(),
      sent = sent + client_buffered.len() as u64,
      received = received + upstream_buffered.len() as u64,
      "websocket closed"
    ),
    Err(e) => tracing::debug!(flow = %flow.id(), "websocket relay ended: {}", e),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::flow::Request;
  use http::{Method, Uri, Version};
  use tokio::io::AsyncReadExt;
  use tokio::net::{TcpListener, TcpStream};

  #[tokio::test]
  async fn relays_buffered_and_live_bytes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let origin = tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut buf = [0u8; 5];
      socket.read_exact(&mut buf).await.unwrap();
      assert_eq!(&buf, b"early");
      socket.write_all(b"pong").await.unwrap();
    });

    let upstream = BufReader::new(MaybeTlsStream::Tcp(TcpStream::connect(addr).await.unwrap()));
    let (mut client, proxy_side) = tokio::io::duplex(64);
    let flow = Flow::new(
      "127.0.0.1:1".parse().unwrap(),
      Request::new(Method::GET, Uri::from_static("http://a/"), Version::HTTP_11),
    );
    let relay = tokio::spawn(async move {
      relay(&flow, proxy_side, Bytes::from_static(b"early"), upstream).await;
    });

    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
    origin.await.unwrap();
    drop(client);
    relay.await.unwrap();
  }
}
