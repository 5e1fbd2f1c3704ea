use crate::errors::{Error, Result};
use crate::pool::{Protocol, Scheme, Upstream};
use crate::socket::MaybeTlsStream;
use crate::tls::{self, ALPN_H2, ALPN_HTTP11};
use bytes::Bytes;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol as IpProtocol, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::TlsConnector;

/// ConnectorBuilder
#[derive(Clone)]
pub struct ConnectorBuilder {
  certs_verification: bool,
  connect_timeout: Duration,
  nodelay: bool,
  keepalive: bool,
  roots: Vec<CertificateDer<'static>>,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      certs_verification: true,
      connect_timeout: Duration::from_secs(10),
      nodelay: true,
      keepalive: true,
      roots: vec![],
    }
  }
}

impl ConnectorBuilder {
  /// Controls the use of certificate validation.
  ///
  /// Defaults to `true`.
  ///
  /// # Warning
  ///
  /// With validation off *any* certificate for *any* site is accepted,
  /// including expired ones.
  pub fn certs_verification(mut self, value: bool) -> ConnectorBuilder {
    self.certs_verification = value;
    self
  }
  /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
  ///
  /// Default is `true`.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// Sets value for the `SO_KEEPALIVE` option on this socket.
  ///
  /// Default is `true`.
  pub fn keepalive(mut self, value: bool) -> ConnectorBuilder {
    self.keepalive = value;
    self
  }
  /// Adds certificates to the set of roots trusted in addition to the
  /// platform store.
  pub fn root_certificates(mut self, value: Vec<CertificateDer<'static>>) -> ConnectorBuilder {
    self.roots = value;
    self
  }
  /// Timeout covering TCP connect and the TLS handshake.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Duration) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }

  /// Combine the configuration of this builder with a connector to create a `Connector`.
  pub fn build(&self) -> Result<Connector> {
    let insecure = !self.certs_verification;
    let h1 = tls::client_config(insecure, &self.roots, &[ALPN_HTTP11])?;
    let h2 = tls::client_config(insecure, &self.roots, &[ALPN_H2, ALPN_HTTP11])?;
    Ok(Connector {
      connect_timeout: self.connect_timeout,
      nodelay: self.nodelay,
      keepalive: self.keepalive,
      tls_http1: TlsConnector::from(Arc::new(h1)),
      tls_http2: TlsConnector::from(Arc::new(h2)),
    })
  }
}

/// Opens upstream connections.
#[derive(Clone)]
pub struct Connector {
  connect_timeout: Duration,
  nodelay: bool,
  keepalive: bool,
  tls_http1: TlsConnector,
  tls_http2: TlsConnector,
}

impl Connector {
  /// Connect to `host:port`, wrap in TLS for `https`, and set up HTTP/2 when
  /// ALPN picks it.
  ///
  /// The whole sequence runs under the connect timeout. Every failure is
  /// reported as [`Error::UpstreamUnavailable`].
  pub async fn connect(
    &self,
    scheme: Scheme,
    host: &str,
    port: u16,
    hint: Protocol,
  ) -> Result<(Upstream, Protocol)> {
    let attempt = self.connect_inner(scheme, host, port, hint);
    match tokio::time::timeout(self.connect_timeout, attempt).await {
      Ok(Ok(conn)) => Ok(conn),
      Ok(Err(e)) if e.is_upstream() => Err(e),
      Ok(Err(e)) => Err(Error::upstream(format!("{}:{}: {}", host, port, e))),
      Err(_) => Err(Error::upstream(format!(
        "{}:{}: connect timed out after {:?}",
        host, port, self.connect_timeout
      ))),
    }
  }

  async fn connect_inner(
    &self,
    scheme: Scheme,
    host: &str,
    port: u16,
    hint: Protocol,
  ) -> Result<(Upstream, Protocol)> {
    let tcp = self.connect_tcp(host, port).await?;
    let stream = match scheme {
      Scheme::Http => MaybeTlsStream::Tcp(tcp),
      Scheme::Https => {
        let connector = match hint {
          Protocol::Http2 => &self.tls_http2,
          Protocol::Http1 => &self.tls_http1,
        };
        let name = tls::server_name(host)?;
        let tls = connector
          .connect(name, tcp)
          .await
          .map_err(|e| Error::upstream(format!("TLS with {}:{} failed: {}", host, port, e)))?;
        MaybeTlsStream::Tls(Box::new(tls))
      }
    };
    if stream.alpn_protocol() == Some(ALPN_H2) {
      let (send, conn) = h2::client::handshake(stream)
        .await
        .map_err(|e| Error::upstream(format!("HTTP/2 handshake with {}: {}", host, e)))?;
      let host = host.to_string();
      tokio::spawn(async move {
        if let Err(e) = conn.await {
          tracing::debug!(host = %host, "upstream HTTP/2 connection ended: {}", e);
        }
      });
      return Ok((Upstream::Http2(send), Protocol::Http2));
    }
    Ok((Upstream::Http1(BufReader::new(stream)), Protocol::Http1))
  }

  async fn connect_tcp(&self, host: &str, port: u16) -> Result<TcpStream> {
    let addrs = tokio::net::lookup_host((host, port))
      .await
      .map_err(|e| Error::upstream(format!("resolve {}: {}", host, e)))?;
    let mut last_error = None;
    for addr in addrs {
      match self.connect_with_addr(addr).await {
        Ok(stream) => return Ok(stream),
        Err(e) => last_error = Some(e),
      }
    }
    Err(match last_error {
      Some(e) => Error::upstream(format!("connect {}:{}: {}", host, port, e)),
      None => Error::upstream(format!("{} resolved to no addresses", host)),
    })
  }

  /// Connect to a remote endpoint with addr
  async fn connect_with_addr(&self, addr: SocketAddr) -> Result<TcpStream> {
    let raw_socket = RawSocket::new(
      Domain::for_address(addr),
      Type::STREAM,
      Some(IpProtocol::TCP),
    )?;
    raw_socket.set_nonblocking(true)?;
    if self.keepalive {
      raw_socket.set_keepalive(true)?;
    }
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(true)?;
    }
    Ok(socket.connect(addr).await?)
  }
}

impl std::fmt::Debug for Connector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connector")
      .field("connect_timeout", &self.connect_timeout)
      .field("nodelay", &self.nodelay)
      .field("keepalive", &self.keepalive)
      .finish()
  }
}

/// Body type the upstream HTTP/2 client sends.
pub(crate) type H2Sender = h2::client::SendRequest<Bytes>;
