//! Upstream pool checkout and reuse against a local listener

use devrelay::pool::{ConnectionPool, Protocol, Scheme};
use devrelay::ConnectorBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;

/// Accepts connections and keeps them open until the test ends.
async fn idle_origin() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    let mut held = Vec::new();
    while let Ok((stream, _)) = listener.accept().await {
      held.push(stream);
    }
  });
  addr
}

fn pool(idle_timeout: Duration) -> ConnectionPool {
  let connector = ConnectorBuilder::default()
    .connect_timeout(Duration::from_secs(5))
    .build()
    .unwrap();
  ConnectionPool::new(connector, idle_timeout)
}

#[tokio::test]
async fn test_concurrent_checkouts_are_distinct() {
  let addr = idle_origin().await;
  let pool = pool(Duration::from_secs(30));
  let host = addr.ip().to_string();

  let (a, b) = tokio::join!(
    pool.obtain(Scheme::Http, &host, addr.port(), Protocol::Http1),
    pool.obtain(Scheme::Http, &host, addr.port(), Protocol::Http1),
  );
  let (a, b) = (a.unwrap(), b.unwrap());
  assert_ne!(a.id(), b.id(), "two flows must never share a connection");
  assert!(!a.is_reused() && !b.is_reused());
  assert_eq!(a.protocol(), Protocol::Http1);
}

#[tokio::test]
async fn test_released_connection_is_reused() {
  let addr = idle_origin().await;
  let pool = pool(Duration::from_secs(30));
  let host = addr.ip().to_string();

  let mut first = pool
    .obtain(Scheme::Http, &host, addr.port(), Protocol::Http1)
    .await
    .unwrap();
  let id = first.id();
  first.set_reusable(true);
  pool.release(first).await;
  assert_eq!(pool.idle_count(), 1);

  let second = pool
    .obtain(Scheme::Http, &host, addr.port(), Protocol::Http1)
    .await
    .unwrap();
  assert_eq!(second.id(), id);
  assert!(second.is_reused());
  assert_eq!(pool.idle_count(), 0);

  // not marked reusable again, so it is closed instead of parked
  pool.release(second).await;
  assert_eq!(pool.idle_count(), 0);
}

#[tokio::test]
async fn test_http2_hint_accepts_idle_http1() {
  let addr = idle_origin().await;
  let pool = pool(Duration::from_secs(30));
  let host = addr.ip().to_string();

  let mut conn = pool
    .obtain(Scheme::Http, &host, addr.port(), Protocol::Http1)
    .await
    .unwrap();
  let id = conn.id();
  conn.set_reusable(true);
  pool.release(conn).await;

  let again = pool
    .obtain(Scheme::Http, &host, addr.port(), Protocol::Http2)
    .await
    .unwrap();
  assert_eq!(again.id(), id);
  assert_eq!(again.protocol(), Protocol::Http1);
}

#[tokio::test]
async fn test_idle_connections_expire() {
  let addr = idle_origin().await;
  let pool = pool(Duration::from_millis(50));
  let host = addr.ip().to_string();

  let mut conn = pool
    .obtain(Scheme::Http, &host, addr.port(), Protocol::Http1)
    .await
    .unwrap();
  let id = conn.id();
  conn.set_reusable(true);
  pool.release(conn).await;
  assert_eq!(pool.idle_count(), 1);

  tokio::time::sleep(Duration::from_millis(120)).await;
  assert_eq!(pool.evict_idle(), 1);
  assert_eq!(pool.idle_count(), 0);

  let fresh = pool
    .obtain(Scheme::Http, &host, addr.port(), Protocol::Http1)
    .await
    .unwrap();
  assert_ne!(fresh.id(), id);
  assert!(!fresh.is_reused());
}

#[tokio::test]
async fn test_refused_connection_is_upstream_error() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  drop(listener);

  let pool = pool(Duration::from_secs(30));
  let err = pool
    .obtain(Scheme::Http, "127.0.0.1", addr.port(), Protocol::Http1)
    .await
    .unwrap_err();
  assert!(err.is_upstream(), "got {:?}", err);
}
