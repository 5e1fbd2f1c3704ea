//! TCP listener and per-connection protocol detection
//!
//! Every accepted connection is sniffed by peeking its first byte. A TLS
//! record header (`0x16`) is intercepted with a leaf issued for the SNI;
//! anything else is treated as plaintext HTTP/1.1, which may ask for a
//! `CONNECT` tunnel that is then sniffed the same way.

use crate::ca::CertificateAuthority;
use crate::errors::{Error, Result};
use crate::handler::{FlowHandler, Origin};
use crate::http1::{self, Served};
use crate::http2;
use crate::pool::Scheme;
use crate::socket::ClientStream;
use crate::tls::{self, LeafResolver, ALPN_H2, ALPN_HTTP11};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::LazyConfigAcceptor;

const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// State shared by every client connection.
#[derive(Debug)]
pub(crate) struct ConnContext {
  pub(crate) ca: Arc<CertificateAuthority>,
  pub(crate) handler: FlowHandler,
  pub(crate) accept_timeout: Duration,
}

enum Sniffed {
  Tls,
  Plain,
  Closed,
}

/// Accept connections until a shutdown signal arrives.
pub(crate) async fn run(
  listener: TcpListener,
  ctx: Arc<ConnContext>,
  mut shutdown: broadcast::Receiver<()>,
) {
  loop {
    tokio::select! {
      _ = shutdown.recv() => {
        tracing::info!("TCP listener stopping");
        break;
      }
      accepted = listener.accept() => match accepted {
        Ok((stream, peer)) => {
          let ctx = ctx.clone();
          tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, ctx).await {
              tracing::warn!(client = %peer, "connection closed: {}", e);
            }
          });
        }
        Err(e) => tracing::warn!("accept failed: {}", e),
      }
    }
  }
}

async fn sniff(stream: &TcpStream, accept_timeout: Duration) -> Result<Sniffed> {
  let mut first = [0u8; 1];
  match tokio::time::timeout(accept_timeout, stream.peek(&mut first)).await {
    Err(_) => {
      tracing::debug!("no data before accept timeout");
      Ok(Sniffed::Closed)
    }
    Ok(Ok(0)) => Ok(Sniffed::Closed),
    Ok(Ok(_)) if first[0] == TLS_HANDSHAKE_RECORD => Ok(Sniffed::Tls),
    Ok(Ok(_)) => Ok(Sniffed::Plain),
    Ok(Err(e)) => Err(e.into()),
  }
}

async fn handle_connection(
  stream: TcpStream,
  peer: SocketAddr,
  ctx: Arc<ConnContext>,
) -> Result<()> {
  if let Err(e) = stream.set_nodelay(true) {
    tracing::debug!(client = %peer, "set_nodelay failed: {}", e);
  }
  match sniff(&stream, ctx.accept_timeout).await? {
    Sniffed::Closed => Ok(()),
    Sniffed::Tls => intercept_tls(stream, peer, None, ctx).await,
    Sniffed::Plain => {
      let client = ClientStream::Plain(stream);
      match http1::serve(client, peer, Origin::plain(), &ctx, true).await? {
        Served::Closed => Ok(()),
        Served::Connect { authority, stream } => match stream {
          ClientStream::Plain(tcp) => tunnel(tcp, peer, &authority, ctx).await,
          ClientStream::Tls(_) => Err(Error::parse("CONNECT inside TLS")),
        },
      }
    }
  }
}

/// Answer a `CONNECT` and serve whatever the client sends through it.
async fn tunnel(
  mut stream: TcpStream,
  peer: SocketAddr,
  authority: &str,
  ctx: Arc<ConnContext>,
) -> Result<()> {
  let (host, port) = parse_host_port(authority)?;
  stream
    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
    .await?;
  stream.flush().await?;
  tracing::debug!(client = %peer, host = %host, port, "tunnel established");

  match sniff(&stream, ctx.accept_timeout).await? {
    Sniffed::Closed => Ok(()),
    Sniffed::Tls => intercept_tls(stream, peer, Some((host, port)), ctx).await,
    Sniffed::Plain => {
      let origin = Origin::tunnel(Scheme::Http, &host, port);
      http1::serve(ClientStream::Plain(stream), peer, origin, &ctx, false).await?;
      Ok(())
    }
  }
}

/// Terminate client TLS with a leaf from the CA and serve the decrypted
/// connection over HTTP/2 or HTTP/1.1, whichever ALPN picked.
async fn intercept_tls(
  stream: TcpStream,
  peer: SocketAddr,
  connect: Option<(String, u16)>,
  ctx: Arc<ConnContext>,
) -> Result<()> {
  let handshake = async {
    let start = LazyConfigAcceptor::new(Acceptor::default(), stream)
      .await
      .map_err(|e| Error::handshake(format!("bad ClientHello from {}: {}", peer, e)))?;
    let sni = start.client_hello().server_name().map(str::to_string);
    let (host, port) = match (sni, connect) {
      (Some(sni), Some((_, port))) => (sni, port),
      (Some(sni), None) => (sni, Scheme::Https.default_port()),
      (None, Some(target)) => target,
      (None, None) => {
        return Err(Error::handshake(format!(
          "direct TLS from {} without SNI",
          peer
        )))
      }
    };
    let resolver = Arc::new(LeafResolver::with_fallback(ctx.ca.clone(), host.clone()));
    let config = tls::server_config(resolver, &[ALPN_H2, ALPN_HTTP11])?;
    let tls = start
      .into_stream(Arc::new(config))
      .await
      .map_err(|e| Error::handshake(format!("TLS with {} for {}: {}", peer, host, e)))?;
    Ok::<_, Error>((tls, host, port))
  };
  let (tls, host, port) = tokio::time::timeout(ctx.accept_timeout, handshake)
    .await
    .map_err(|_| Error::handshake(format!("TLS handshake with {} timed out", peer)))??;

  let client = ClientStream::Tls(Box::new(tls));
  let origin = Origin::tunnel(Scheme::Https, &host, port);
  let h2 = client.alpn_protocol() == Some(ALPN_H2);
  tracing::debug!(client = %peer, host = %host, port, h2, "TLS intercepted");
  if h2 {
    http2::serve(client, peer, origin, ctx).await
  } else {
    http1::serve(client, peer, origin, &ctx, false).await?;
    Ok(())
  }
}

/// Split a `CONNECT` authority into host and port.
pub(crate) fn parse_host_port(authority: &str) -> Result<(String, u16)> {
  let invalid = || Error::parse(format!("invalid CONNECT target {:?}", authority));
  let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
    let (host, rest) = rest.split_once(']').ok_or_else(invalid)?;
    match rest.strip_prefix(':') {
      Some(port) => (host, Some(port)),
      None if rest.is_empty() => (host, None),
      None => return Err(invalid()),
    }
  } else {
    match authority.rsplit_once(':') {
      Some((host, port)) if !host.contains(':') => (host, Some(port)),
      Some(_) => return Err(invalid()),
      None => (authority, None),
    }
  };
  if host.is_empty() {
    return Err(invalid());
  }
  let port = match port {
    Some(port) => port
      .parse::<u16>()
      .ok()
      .filter(|p| *p != 0)
      .ok_or_else(invalid)?,
    None => Scheme::Https.default_port(),
  };
  Ok((host.to_string(), port))
}
