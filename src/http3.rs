//! HTTP/3 listener over QUIC
//!
//! Runs beside the TCP listener on the same address. Leaves come from the
//! same CA through [`LeafResolver`]; QUIC always carries SNI, so there is no
//! fallback host. Upstream traffic still goes over TCP.

use crate::body::check_body_size;
use crate::ca::CertificateAuthority;
use crate::errors::{Error, Result};
use crate::flow::{Flow, FlowState, Request};
use crate::handler::Origin;
use crate::headers::Headers;
use crate::http2::{check_declared_length, outgoing_response};
use crate::pool::{Protocol, Scheme};
use crate::server::ConnContext;
use crate::tls::{self, LeafResolver, ALPN_H3};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use h3::server::RequestStream;
use http::header::HOST;
use http::Version;
use quinn::crypto::rustls::QuicServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_rustls::rustls;

type H3Stream = RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>;

fn h3_error(e: impl std::fmt::Display) -> Error {
  Error::parse(format!("HTTP/3: {}", e))
}

/// Bind a QUIC endpoint answering ALPN `h3`.
pub(crate) fn bind(addr: SocketAddr, ca: Arc<CertificateAuthority>) -> Result<quinn::Endpoint> {
  let mut config = rustls::ServerConfig::builder_with_provider(tls::provider())
    .with_protocol_versions(&[&rustls::version::TLS13])?
    .with_no_client_auth()
    .with_cert_resolver(Arc::new(LeafResolver::new(ca)));
  config.alpn_protocols = vec![ALPN_H3.to_vec()];
  let quic = QuicServerConfig::try_from(config)
    .map_err(|e| Error::config(format!("http3: {}", e)))?;
  let endpoint = quinn::Endpoint::server(quinn::ServerConfig::with_crypto(Arc::new(quic)), addr)?;
  Ok(endpoint)
}

/// Accept QUIC connections until a shutdown signal arrives.
pub(crate) async fn run(
  endpoint: quinn::Endpoint,
  ctx: Arc<ConnContext>,
  mut shutdown: broadcast::Receiver<()>,
) {
  loop {
    tokio::select! {
      _ = shutdown.recv() => {
        tracing::info!("HTTP/3 listener stopping");
        endpoint.close(0u32.into(), b"shutdown");
        break;
      }
      incoming = endpoint.accept() => match incoming {
        Some(incoming) => {
          let ctx = ctx.clone();
          let peer = incoming.remote_address();
          tokio::spawn(async move {
            if let Err(e) = handle_connection(incoming, ctx).await {
              tracing::warn!(client = %peer, "QUIC connection closed: {}", e);
            }
          });
        }
        None => break,
      }
    }
  }
}

async fn handle_connection(incoming: quinn::Incoming, ctx: Arc<ConnContext>) -> Result<()> {
  let peer = incoming.remote_address();
  let connecting = incoming
    .accept()
    .map_err(|e| Error::handshake(format!("QUIC from {}: {}", peer, e)))?;
  let connection = tokio::time::timeout(ctx.accept_timeout, connecting)
    .await
    .map_err(|_| Error::handshake(format!("QUIC handshake with {} timed out", peer)))?
    .map_err(|e| Error::handshake(format!("QUIC handshake with {}: {}", peer, e)))?;
  tracing::debug!(client = %peer, "QUIC connection established");

  let mut h3_conn: h3::server::Connection<h3_quinn::Connection, Bytes> =
    h3::server::Connection::new(h3_quinn::Connection::new(connection))
      .await
      .map_err(h3_error)?;

  loop {
    match h3_conn.accept().await {
      Ok(Some((request, stream))) => {
        let ctx = ctx.clone();
        tokio::spawn(async move {
          if let Err(e) = handle_request(request, stream, peer, ctx).await {
            tracing::debug!(client = %peer, "HTTP/3 stream failed: {}", e);
          }
        });
      }
      Ok(None) => break,
      Err(e) => {
        tracing::debug!(client = %peer, "HTTP/3 connection ended: {}", e);
        break;
      }
    }
  }
  Ok(())
}

/// Abort both directions of a request stream whose body is over the limit.
fn refuse(stream: &mut H3Stream) {
  stream.stop_sending(h3::error::Code::H3_REQUEST_REJECTED);
  stream.stop_stream(h3::error::Code::H3_REQUEST_REJECTED);
}

async fn handle_request(
  request: http::Request<()>,
  mut stream: H3Stream,
  peer: SocketAddr,
  ctx: Arc<ConnContext>,
) -> Result<()> {
  if let Err(e) = check_declared_length(request.headers()) {
    refuse(&mut stream);
    return Err(e);
  }
  let mut data = BytesMut::new();
  while let Some(chunk) = stream.recv_data().await.map_err(h3_error)? {
    if let Err(e) = check_body_size(data.len() + chunk.remaining()) {
      refuse(&mut stream);
      return Err(e);
    }
    data.put(chunk);
  }

  let (parts, ()) = request.into_parts();
  let uri = if parts.uri.authority().is_some() {
    parts.uri
  } else {
    let path = parts.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    Origin::direct(Scheme::Https)
      .complete(path, parts.headers.get(HOST).and_then(|v| v.to_str().ok()))?
  };
  let mut request = Request::new(parts.method, uri, Version::HTTP_3);
  *request.headers_mut() = Headers::from(&parts.headers);
  request.set_body(data.freeze());

  let mut flow = Flow::new(peer, request);
  flow.advance(FlowState::RequestReady)?;
  tracing::debug!(
    flow = %flow.id(),
    client = %peer,
    method = %flow.request().method(),
    uri = %flow.request().uri(),
    "h3 request"
  );
  ctx.handler.process(&mut flow, Protocol::Http2).await;

  let (response, body) = outgoing_response(&flow)?;
  let status = response.status();
  stream.send_response(response).await.map_err(h3_error)?;
  if let Some(body) = body {
    stream.send_data(body).await.map_err(h3_error)?;
  }
  stream.finish().await.map_err(h3_error)?;

  if flow.state() == FlowState::ResponseReady {
    tracing::debug!(flow = %flow.id(), status = status.as_u16(), "h3 response");
    flow.advance(FlowState::Flushed)?;
  }
  Ok(())
}
