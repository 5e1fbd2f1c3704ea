//! End-to-end flows through a running proxy

use bytes::Bytes;
use devrelay::{CertificateAuthority, DevRelay, ProxyConfig, ProxyHandle};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn temp_dir(name: &str) -> PathBuf {
  let dir = std::env::temp_dir().join(format!("devrelay-e2e-{}-{}", name, std::process::id()));
  if dir.exists() {
    std::fs::remove_dir_all(&dir).ok();
  }
  dir
}

/// Answer one request per connection.
///
/// `OPTIONS` gets a `405`; everything else a `200` carrying the security
/// headers the proxy is expected to strip.
async fn answer<S>(mut stream: S)
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut head = Vec::new();
  let mut buf = [0u8; 1024];
  while !head.windows(4).any(|w| w == b"\r\n\r\n") {
    match stream.read(&mut buf).await {
      Ok(0) | Err(_) => return,
      Ok(n) => head.extend_from_slice(&buf[..n]),
    }
  }
  let response: &[u8] = if head.starts_with(b"OPTIONS ") {
    b"HTTP/1.1 405 Method Not Allowed\r\nAllow: GET\r\nContent-Length: 12\r\nConnection: close\r\n\r\nnot allowed\n"
  } else {
    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Security-Policy: default-src 'self'\r\nContent-Security-Policy-Report-Only: script-src 'none'\r\nCross-Origin-Embedder-Policy: require-corp\r\nCross-Origin-Opener-Policy: same-origin\r\nX-Origin: yes\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok"
  };
  stream.write_all(response).await.ok();
  stream.shutdown().await.ok();
}

async fn plain_origin() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      tokio::spawn(answer(stream));
    }
  });
  addr
}

/// Server side TLS for `127.0.0.1`, signed by a CA the proxy does not know.
async fn origin_acceptor(certdir: &Path, alpn: &[&[u8]]) -> TlsAcceptor {
  let ca = CertificateAuthority::new(certdir).await.unwrap();
  let leaf = ca.issue_leaf("127.0.0.1").unwrap();
  let mut config = ServerConfig::builder_with_provider(Arc::new(
    rustls::crypto::ring::default_provider(),
  ))
  .with_safe_default_protocol_versions()
  .unwrap()
  .with_no_client_auth()
  .with_single_cert(leaf.chain().to_vec(), leaf.key().clone_key())
  .unwrap();
  config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
  TlsAcceptor::from(Arc::new(config))
}

/// A TLS origin speaking HTTP/1.1.
async fn tls_origin(certdir: &Path) -> SocketAddr {
  let acceptor = origin_acceptor(certdir, &[]).await;
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let acceptor = acceptor.clone();
      tokio::spawn(async move {
        if let Ok(tls) = acceptor.accept(stream).await {
          answer(tls).await;
        }
      });
    }
  });
  addr
}

/// A TLS origin speaking only HTTP/2.
///
/// Answers every stream with a `200`, a CSP header and the received body
/// length in `x-received`.
async fn h2_origin(certdir: &Path) -> SocketAddr {
  let acceptor = origin_acceptor(certdir, &[b"h2"]).await;
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let acceptor = acceptor.clone();
      tokio::spawn(async move {
        let Ok(tls) = acceptor.accept(stream).await else {
          return;
        };
        let Ok(mut connection) = h2::server::handshake(tls).await else {
          return;
        };
        while let Some(Ok((request, mut respond))) = connection.accept().await {
          tokio::spawn(async move {
            let mut body = request.into_body();
            let mut received = 0;
            while let Some(Ok(chunk)) = body.data().await {
              body.flow_control().release_capacity(chunk.len()).ok();
              received += chunk.len();
            }
            let response = http::Response::builder()
              .status(200)
              .header("content-security-policy", "default-src 'self'")
              .header("x-received", received)
              .body(())
              .unwrap();
            if let Ok(mut stream) = respond.send_response(response, false) {
              stream.send_data(Bytes::from_static(b"ok"), true).ok();
            }
          });
        }
      });
    }
  });
  addr
}

fn proxy_config(certdir: PathBuf) -> ProxyConfig {
  ProxyConfig {
    host: "127.0.0.1".to_string(),
    port: 0,
    certdir,
    ssl_insecure: true,
    response_timeout: Duration::from_secs(5),
    ..Default::default()
  }
}

async fn start_proxy(certdir: PathBuf) -> (ProxyHandle, Arc<CertificateAuthority>) {
  start_proxy_with(proxy_config(certdir)).await
}

async fn start_proxy_with(config: ProxyConfig) -> (ProxyHandle, Arc<CertificateAuthority>) {
  let relay = DevRelay::new(config).await.unwrap();
  let ca = relay.certificate_authority();
  (relay.listen().await.unwrap(), ca)
}

async fn exchange<S>(stream: &mut S, request: String) -> String
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  stream.write_all(request.as_bytes()).await.unwrap();
  let mut raw = Vec::new();
  tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut raw))
    .await
    .expect("proxy did not close the connection")
    .ok();
  String::from_utf8_lossy(&raw).into_owned()
}

async fn read_head<S>(stream: &mut S) -> String
where
  S: AsyncRead + Unpin,
{
  let mut head = Vec::new();
  while !head.windows(4).any(|w| w == b"\r\n\r\n") {
    let mut byte = [0u8; 1];
    assert_eq!(stream.read(&mut byte).await.unwrap(), 1, "closed inside head");
    head.push(byte[0]);
  }
  String::from_utf8_lossy(&head).to_ascii_lowercase()
}

/// Open a `CONNECT` tunnel to `origin` and run TLS against the proxy's leaf.
async fn connect_tls(
  proxy: SocketAddr,
  origin: SocketAddr,
  ca: &CertificateAuthority,
  alpn: &[&[u8]],
) -> TlsStream<TcpStream> {
  let mut tcp = TcpStream::connect(proxy).await.unwrap();
  tcp
    .write_all(format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", origin, origin).as_bytes())
    .await
    .unwrap();
  let established = read_head(&mut tcp).await;
  assert!(established.starts_with("http/1.1 200"), "{}", established);

  let mut roots = RootCertStore::empty();
  roots.add(ca.ca_cert_der().clone()).unwrap();
  let mut config = ClientConfig::builder_with_provider(Arc::new(
    rustls::crypto::ring::default_provider(),
  ))
  .with_safe_default_protocol_versions()
  .unwrap()
  .with_root_certificates(roots)
  .with_no_client_auth();
  config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
  let server_name = ServerName::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST).into());
  TlsConnector::from(Arc::new(config))
    .connect(server_name, tcp)
    .await
    .expect("leaf from the proxy CA must verify")
}

fn split(response: &str) -> (String, String) {
  let (head, body) = response.split_once("\r\n\r\n").expect("no header terminator");
  (head.to_ascii_lowercase(), body.to_string())
}

#[tokio::test]
async fn test_mutation_gets_cors_and_loses_csp() {
  let certdir = temp_dir("mutation");
  let origin = plain_origin().await;
  let (proxy, _) = start_proxy(certdir.clone()).await;

  let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
  let response = exchange(
    &mut client,
    format!(
      "DELETE http://{}/item/7 HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
      origin, origin
    ),
  )
  .await;
  let (head, body) = split(&response);

  assert!(head.starts_with("http/1.1 200"), "{}", head);
  assert_eq!(body, "ok");
  assert!(!head.contains("content-security-policy"));
  assert!(!head.contains("cross-origin-embedder-policy"));
  assert!(!head.contains("cross-origin-opener-policy"));
  assert!(head.contains("x-origin: yes"));
  for header in [
    "cross-origin-resource-policy: cross-origin",
    "access-control-allow-origin: *",
    "access-control-allow-methods: get, post, put, patch, delete, options, head",
    "access-control-allow-headers: *",
    "access-control-max-age: 86400",
    "access-control-expose-headers: *",
  ] {
    assert!(head.contains(header), "missing {:?} in {}", header, head);
  }

  proxy.shutdown().await;
  std::fs::remove_dir_all(&certdir).ok();
}

#[tokio::test]
async fn test_get_is_left_without_cors() {
  let certdir = temp_dir("get");
  let origin = plain_origin().await;
  let (proxy, _) = start_proxy(certdir.clone()).await;

  let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
  let response = exchange(
    &mut client,
    format!(
      "GET http://{}/ HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
      origin, origin
    ),
  )
  .await;
  let (head, body) = split(&response);

  assert!(head.starts_with("http/1.1 200"), "{}", head);
  assert_eq!(body, "ok");
  assert!(!head.contains("content-security-policy"));
  assert!(!head.contains("access-control-allow-origin"));
  assert!(!head.contains("cross-origin-resource-policy"));

  proxy.shutdown().await;
  std::fs::remove_dir_all(&certdir).ok();
}

#[tokio::test]
async fn test_rejected_preflight_becomes_204() {
  let certdir = temp_dir("preflight");
  let origin = plain_origin().await;
  let (proxy, _) = start_proxy(certdir.clone()).await;

  let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
  let response = exchange(
    &mut client,
    format!(
      "OPTIONS http://{}/api HTTP/1.1\r\nHost: {}\r\nOrigin: http://app.test\r\nAccess-Control-Request-Method: PUT\r\nConnection: close\r\n\r\n",
      origin, origin
    ),
  )
  .await;
  let (head, body) = split(&response);

  assert!(head.starts_with("http/1.1 204"), "{}", head);
  assert!(body.is_empty(), "204 must not carry a body: {:?}", body);
  assert!(head.contains("access-control-allow-origin: *"));
  assert!(head.contains("access-control-max-age: 86400"));
  assert!(!head.contains("content-length: 12"));

  proxy.shutdown().await;
  std::fs::remove_dir_all(&certdir).ok();
}

#[tokio::test]
async fn test_unreachable_origin_is_502() {
  let certdir = temp_dir("502");
  let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let dead = closed.local_addr().unwrap();
  drop(closed);
  let (proxy, _) = start_proxy(certdir.clone()).await;

  let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
  let response = exchange(
    &mut client,
    format!("PUT http://{}/ HTTP/1.1\r\nHost: {}\r\nContent-Length: 0\r\n\r\n", dead, dead),
  )
  .await;
  let (head, _) = split(&response);
  assert!(head.starts_with("http/1.1 502"), "{}", head);

  proxy.shutdown().await;
  std::fs::remove_dir_all(&certdir).ok();
}

#[tokio::test]
async fn test_malformed_request_is_400() {
  let certdir = temp_dir("400");
  let (proxy, _) = start_proxy(certdir.clone()).await;

  let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
  let response = exchange(&mut client, "NONSENSE\r\n\r\n".to_string()).await;
  assert!(response.starts_with("HTTP/1.1 400"), "{}", response);

  proxy.shutdown().await;
  std::fs::remove_dir_all(&certdir).ok();
}

#[tokio::test]
async fn test_connect_intercepts_tls() {
  let certdir = temp_dir("connect");
  let origin_certdir = temp_dir("connect-origin");
  let origin = tls_origin(&origin_certdir).await;
  let (proxy, ca) = start_proxy(certdir.clone()).await;

  let mut tls = connect_tls(proxy.local_addr(), origin, &ca, &[]).await;

  let response = exchange(
    &mut tls,
    format!(
      "POST /submit HTTP/1.1\r\nHost: {}\r\nContent-Length: 3\r\nConnection: close\r\n\r\nabc",
      origin
    ),
  )
  .await;
  let (head, body) = split(&response);
  assert!(head.starts_with("http/1.1 200"), "{}", head);
  assert_eq!(body, "ok");
  assert!(!head.contains("content-security-policy"));
  assert!(head.contains("access-control-allow-origin: *"));
  assert!(head.contains("cross-origin-resource-policy: cross-origin"));
  assert!(ca.cached_leaves() >= 1);

  proxy.shutdown().await;
  std::fs::remove_dir_all(&certdir).ok();
  std::fs::remove_dir_all(&origin_certdir).ok();
}

#[tokio::test]
async fn test_h2_client_through_intercepted_tls() {
  let certdir = temp_dir("h2");
  let origin_certdir = temp_dir("h2-origin");
  let origin = h2_origin(&origin_certdir).await;
  let (proxy, ca) = start_proxy(certdir.clone()).await;

  let tls = connect_tls(proxy.local_addr(), origin, &ca, &[b"h2"]).await;
  assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"h2"[..]));
  let (send, connection) = h2::client::handshake(tls).await.unwrap();
  tokio::spawn(async move {
    connection.await.ok();
  });

  let mut send = send.ready().await.unwrap();
  let request = http::Request::builder()
    .method("POST")
    .uri(format!("https://{}/submit", origin))
    .body(())
    .unwrap();
  let (pending, mut stream) = send.send_request(request, false).unwrap();
  stream.send_data(Bytes::from_static(b"abc"), true).unwrap();
  let response = tokio::time::timeout(Duration::from_secs(10), pending)
    .await
    .expect("no h2 response")
    .unwrap();

  assert_eq!(response.status(), 200);
  let headers = response.headers();
  assert!(!headers.contains_key("content-security-policy"));
  assert_eq!(headers["access-control-allow-origin"], "*");
  assert_eq!(headers["cross-origin-resource-policy"], "cross-origin");
  assert_eq!(headers["x-received"], "3", "request body must reach the origin over h2");

  let mut body = response.into_body();
  let mut data = Vec::new();
  while let Some(chunk) = body.data().await {
    let chunk = chunk.unwrap();
    body.flow_control().release_capacity(chunk.len()).ok();
    data.extend_from_slice(&chunk);
  }
  assert_eq!(data, b"ok");

  proxy.shutdown().await;
  std::fs::remove_dir_all(&certdir).ok();
  std::fs::remove_dir_all(&origin_certdir).ok();
}

#[tokio::test]
async fn test_h2_stream_over_body_limit_is_refused() {
  let certdir = temp_dir("h2-limit");
  let origin_certdir = temp_dir("h2-limit-origin");
  let origin = h2_origin(&origin_certdir).await;
  let (proxy, ca) = start_proxy(certdir.clone()).await;

  let tls = connect_tls(proxy.local_addr(), origin, &ca, &[b"h2"]).await;
  let (send, connection) = h2::client::handshake(tls).await.unwrap();
  tokio::spawn(async move {
    connection.await.ok();
  });

  let mut send = send.ready().await.unwrap();
  let request = http::Request::builder()
    .method("PUT")
    .uri(format!("https://{}/upload", origin))
    .header("content-length", "1099511627776")
    .body(())
    .unwrap();
  let (pending, _stream) = send.send_request(request, false).unwrap();
  let err = tokio::time::timeout(Duration::from_secs(10), pending)
    .await
    .expect("stream was neither answered nor reset")
    .unwrap_err();
  assert_eq!(err.reason(), Some(h2::Reason::REFUSED_STREAM), "{:?}", err);

  proxy.shutdown().await;
  std::fs::remove_dir_all(&certdir).ok();
  std::fs::remove_dir_all(&origin_certdir).ok();
}

#[tokio::test]
async fn test_websocket_upgrade_relays_both_ways() {
  let certdir = temp_dir("websocket");
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin = listener.local_addr().unwrap();
  tokio::spawn(async move {
    let (mut stream, _) = listener.accept().await.unwrap();
    let head = read_head(&mut stream).await;
    assert!(head.contains("upgrade: websocket"), "{}", head);
    stream
      .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
      .await
      .unwrap();
    let mut ping = [0u8; 4];
    stream.read_exact(&mut ping).await.unwrap();
    assert_eq!(&ping, b"ping");
    stream.write_all(b"pong").await.unwrap();
  });
  let (proxy, _) = start_proxy(certdir.clone()).await;

  let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
  client
    .write_all(
      format!(
        "GET http://{}/socket HTTP/1.1\r\nHost: {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        origin, origin
      )
      .as_bytes(),
    )
    .await
    .unwrap();
  let head = read_head(&mut client).await;
  assert!(head.starts_with("http/1.1 101"), "{}", head);
  assert!(head.contains("upgrade: websocket"));

  client.write_all(b"ping").await.unwrap();
  let mut pong = [0u8; 4];
  tokio::time::timeout(Duration::from_secs(10), client.read_exact(&mut pong))
    .await
    .expect("no bytes relayed back")
    .unwrap();
  assert_eq!(&pong, b"pong");

  proxy.shutdown().await;
  std::fs::remove_dir_all(&certdir).ok();
}

#[tokio::test]
async fn test_stalled_origin_is_502() {
  let certdir = temp_dir("stall");
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((mut stream, _)) = listener.accept().await {
      tokio::spawn(async move {
        read_head(&mut stream).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
      });
    }
  });
  let (proxy, _) = start_proxy_with(ProxyConfig {
    response_timeout: Duration::from_secs(1),
    ..proxy_config(certdir.clone())
  })
  .await;

  let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
  let response = exchange(
    &mut client,
    format!(
      "POST http://{}/slow HTTP/1.1\r\nHost: {}\r\nContent-Length: 0\r\n\r\n",
      origin, origin
    ),
  )
  .await;
  let (head, body) = split(&response);
  assert!(head.starts_with("http/1.1 502"), "{}", head);
  assert!(body.contains("no response within"), "{}", body);

  proxy.shutdown().await;
  std::fs::remove_dir_all(&certdir).ok();
}

#[tokio::test]
async fn test_oversized_content_length_is_400() {
  let certdir = temp_dir("oversized");
  let origin = plain_origin().await;
  let (proxy, _) = start_proxy(certdir.clone()).await;

  let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
  let response = exchange(
    &mut client,
    format!(
      "POST http://{}/ HTTP/1.1\r\nHost: {}\r\nContent-Length: 1099511627776\r\n\r\n",
      origin, origin
    ),
  )
  .await;
  let (head, body) = split(&response);
  assert!(head.starts_with("http/1.1 400"), "{}", head);
  assert!(body.contains("limit"), "{}", body);

  // the proxy is still serving
  let mut next = TcpStream::connect(proxy.local_addr()).await.unwrap();
  let response = exchange(
    &mut next,
    format!(
      "GET http://{}/ HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
      origin, origin
    ),
  )
  .await;
  assert!(response.starts_with("HTTP/1.1 200"), "{}", response);

  proxy.shutdown().await;
  std::fs::remove_dir_all(&certdir).ok();
}

#[tokio::test]
async fn test_shutdown_stops_listener() {
  let certdir = temp_dir("shutdown");
  let (proxy, _) = start_proxy(certdir.clone()).await;
  let addr = proxy.local_addr();
  proxy.shutdown().await;

  tokio::time::sleep(Duration::from_millis(50)).await;
  assert!(TcpStream::connect(addr).await.is_err());
  std::fs::remove_dir_all(&certdir).ok();
}
