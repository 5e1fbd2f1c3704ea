//! Upstream connection pool
//!
//! Idle connections are parked per [`PoolKey`]. A checked-out
//! [`PooledConnection`] is owned by exactly one flow until it is released or
//! dropped, so a connection can never serve two flows at once.

use crate::connector::{Connector, H2Sender};
use crate::errors::Result;
use crate::socket::MaybeTlsStream;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::BufReader;

/// URI scheme of an upstream origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
  /// Plaintext
  Http,
  /// TLS
  Https,
}

impl Scheme {
  /// Port used when the target names none.
  pub fn default_port(self) -> u16 {
    match self {
      Scheme::Http => 80,
      Scheme::Https => 443,
    }
  }

  /// Lowercase scheme name.
  pub fn as_str(self) -> &'static str {
    match self {
      Scheme::Http => "http",
      Scheme::Https => "https",
    }
  }

  pub(crate) fn from_uri(uri: &http::Uri) -> Scheme {
    match uri.scheme_str() {
      Some(s) if s.eq_ignore_ascii_case("https") || s.eq_ignore_ascii_case("wss") => Scheme::Https,
      _ => Scheme::Http,
    }
  }
}

/// Application protocol spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
  /// HTTP/1.1
  Http1,
  /// HTTP/2
  Http2,
}

/// Identity of an upstream origin and the protocol spoken to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
  /// Scheme
  pub scheme: Scheme,
  /// Lowercased host
  pub host: String,
  /// Port
  pub port: u16,
  /// Negotiated protocol
  pub protocol: Protocol,
}

impl PoolKey {
  /// Build a key, lowercasing the host.
  pub fn new(scheme: Scheme, host: &str, port: u16, protocol: Protocol) -> Self {
    PoolKey {
      scheme,
      host: host.to_ascii_lowercase(),
      port,
      protocol,
    }
  }
}

impl fmt::Display for PoolKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}://{}:{} ({:?})",
      self.scheme.as_str(),
      self.host,
      self.port,
      self.protocol
    )
  }
}

/// A live upstream connection.
pub enum Upstream {
  /// HTTP/1.1 byte stream with its read buffer
  Http1(BufReader<MaybeTlsStream>),
  /// HTTP/2 request handle; the connection task runs separately
  Http2(H2Sender),
}

impl fmt::Debug for Upstream {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Upstream::Http1(_) => f.write_str("Upstream::Http1"),
      Upstream::Http2(_) => f.write_str("Upstream::Http2"),
    }
  }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A connection checked out of the pool.
#[derive(Debug)]
pub struct PooledConnection {
  id: u64,
  key: PoolKey,
  upstream: Upstream,
  reused: bool,
  reusable: bool,
}

impl PooledConnection {
  fn new(key: PoolKey, upstream: Upstream) -> Self {
    PooledConnection {
      id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
      key,
      upstream,
      reused: false,
      reusable: false,
    }
  }
  /// Process-unique id, stable across checkouts.
  pub fn id(&self) -> u64 {
    self.id
  }
  /// Key this connection is parked under.
  pub fn key(&self) -> &PoolKey {
    &self.key
  }
  /// The negotiated protocol.
  pub fn protocol(&self) -> Protocol {
    self.key.protocol
  }
  /// Whether this checkout came from the idle list.
  pub fn is_reused(&self) -> bool {
    self.reused
  }
  /// Mark whether the last exchange left the connection in a clean state.
  ///
  /// Only clean connections go back to the pool on release.
  pub fn set_reusable(&mut self, reusable: bool) {
    self.reusable = reusable;
  }
  pub(crate) fn upstream_mut(&mut self) -> &mut Upstream {
    &mut self.upstream
  }
  pub(crate) fn into_upstream(self) -> Upstream {
    self.upstream
  }
}

struct Idle {
  conn: PooledConnection,
  since: Instant,
}

/// Pool of idle upstream connections keyed by origin and protocol.
pub struct ConnectionPool {
  connector: Connector,
  idle: DashMap<PoolKey, Vec<Idle>>,
  idle_timeout: Duration,
}

impl ConnectionPool {
  /// Create an empty pool.
  pub fn new(connector: Connector, idle_timeout: Duration) -> Self {
    ConnectionPool {
      connector,
      idle: DashMap::new(),
      idle_timeout,
    }
  }

  /// Check out a connection to `scheme://host:port`.
  ///
  /// Idle connections are tried first. With an HTTP/2 hint an idle HTTP/1.1
  /// connection to the same origin is also acceptable. Otherwise a new
  /// connection is opened and ALPN decides its protocol.
  pub async fn obtain(
    &self,
    scheme: Scheme,
    host: &str,
    port: u16,
    hint: Protocol,
  ) -> Result<PooledConnection> {
    self.evict_idle();
    let mut candidates = vec![PoolKey::new(scheme, host, port, hint)];
    if hint == Protocol::Http2 {
      candidates.push(PoolKey::new(scheme, host, port, Protocol::Http1));
    }
    for key in &candidates {
      if let Some(mut conn) = self.take_idle(key) {
        conn.reused = true;
        conn.reusable = false;
        tracing::debug!(key = %key, id = conn.id, "reusing pooled connection");
        return Ok(conn);
      }
    }
    self.connect(scheme, host, port, hint).await
  }

  /// Open a new connection that did not come from the idle list.
  pub async fn connect(
    &self,
    scheme: Scheme,
    host: &str,
    port: u16,
    hint: Protocol,
  ) -> Result<PooledConnection> {
    let (upstream, protocol) = self.connector.connect(scheme, host, port, hint).await?;
    let conn = PooledConnection::new(PoolKey::new(scheme, host, port, protocol), upstream);
    tracing::debug!(key = %conn.key, id = conn.id, "opened upstream connection");
    Ok(conn)
  }

  /// Return a connection. Connections not marked reusable are closed.
  pub async fn release(&self, conn: PooledConnection) {
    if !conn.reusable {
      tracing::trace!(key = %conn.key, id = conn.id, "closing non-reusable connection");
      return;
    }
    if let Upstream::Http2(send) = &conn.upstream {
      let ready = tokio::time::timeout(Duration::from_secs(1), send.clone().ready()).await;
      if !matches!(ready, Ok(Ok(_))) {
        tracing::trace!(key = %conn.key, id = conn.id, "HTTP/2 connection no longer usable");
        return;
      }
    }
    self.idle.entry(conn.key.clone()).or_default().push(Idle {
      conn,
      since: Instant::now(),
    });
  }

  /// Close idle connections older than the idle timeout.
  pub fn evict_idle(&self) -> usize {
    let timeout = self.idle_timeout;
    let mut evicted = 0usize;
    self.idle.retain(|_, list| {
      let before = list.len();
      list.retain(|idle| idle.since.elapsed() < timeout);
      evicted += before - list.len();
      !list.is_empty()
    });
    if evicted > 0 {
      tracing::debug!(evicted, "evicted idle upstream connections");
    }
    evicted
  }

  /// Total idle connections across all keys.
  pub fn idle_count(&self) -> usize {
    self.idle.iter().map(|entry| entry.value().len()).sum()
  }

  /// The configured idle threshold.
  pub fn idle_timeout(&self) -> Duration {
    self.idle_timeout
  }

  fn take_idle(&self, key: &PoolKey) -> Option<PooledConnection> {
    let mut list = self.idle.get_mut(key)?;
    while let Some(idle) = list.pop() {
      if idle.since.elapsed() < self.idle_timeout {
        return Some(idle.conn);
      }
    }
    None
  }
}

impl fmt::Debug for ConnectionPool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConnectionPool")
      .field("idle", &self.idle_count())
      .field("idle_timeout", &self.idle_timeout)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn key_lowercases_host() {
    let a = PoolKey::new(Scheme::Https, "Example.COM", 443, Protocol::Http1);
    let b = PoolKey::new(Scheme::Https, "example.com", 443, Protocol::Http1);
    assert_eq!(a, b);
    assert_ne!(a, PoolKey::new(Scheme::Https, "example.com", 443, Protocol::Http2));
    assert_ne!(a, PoolKey::new(Scheme::Http, "example.com", 443, Protocol::Http1));
  }

  #[test]
  fn scheme_from_uri() {
    let uri: http::Uri = "https://a.test/".parse().unwrap();
    assert_eq!(Scheme::from_uri(&uri), Scheme::Https);
    let uri: http::Uri = "wss://a.test/".parse().unwrap();
    assert_eq!(Scheme::from_uri(&uri), Scheme::Https);
    let uri: http::Uri = "http://a.test/".parse().unwrap();
    assert_eq!(Scheme::from_uri(&uri).default_port(), 80);
  }
}
