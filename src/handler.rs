//! Drives a flow from a parsed request to a response.

use crate::errors::{Error, Result};
use crate::flow::{Flow, FlowState, Response};
use crate::hooks::HookPipeline;
use crate::pool::{ConnectionPool, PooledConnection, Protocol, Scheme, Upstream};
use crate::socket::MaybeTlsStream;
use crate::{http1, http2};
use http::{StatusCode, Uri};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;

/// Where origin-form request targets point.
///
/// A plain proxy connection has no fixed origin and relies on `Host`; a
/// tunnel always points at its `CONNECT` target.
#[derive(Debug, Clone)]
pub(crate) struct Origin {
  scheme: Scheme,
  authority: Option<String>,
}

impl Origin {
  pub(crate) fn plain() -> Self {
    Origin::direct(Scheme::Http)
  }

  /// No fixed authority; targets resolve through `Host`.
  pub(crate) fn direct(scheme: Scheme) -> Self {
    Origin {
      scheme,
      authority: None,
    }
  }

  pub(crate) fn tunnel(scheme: Scheme, host: &str, port: u16) -> Self {
    let host = if host.contains(':') && !host.starts_with('[') {
      format!("[{}]", host)
    } else {
      host.to_string()
    };
    let authority = if port == scheme.default_port() {
      host
    } else {
      format!("{}:{}", host, port)
    };
    Origin {
      scheme,
      authority: Some(authority),
    }
  }

  /// Turn a request target into an absolute URI.
  pub(crate) fn complete(&self, target: &str, host_header: Option<&str>) -> Result<Uri> {
    if target.contains("://") {
      let uri: Uri = target.parse()?;
      if uri.authority().is_none() {
        return Err(Error::parse(format!("request target {} has no host", target)));
      }
      return Ok(uri);
    }
    if !target.starts_with('/') && target != "*" {
      return Err(Error::parse(format!("unsupported request target {}", target)));
    }
    let authority = self
      .authority
      .as_deref()
      .or(host_header.map(str::trim))
      .filter(|a| !a.is_empty())
      .ok_or_else(|| Error::parse("origin-form request without Host"))?;
    let path = if target == "*" { "/" } else { target };
    Ok(format!("{}://{}{}", self.scheme.as_str(), authority, path).parse()?)
  }
}

/// Status sent to the client for a flow that ended in an error.
pub(crate) fn error_status(error: &Error) -> StatusCode {
  match error {
    Error::Parse(_) => StatusCode::BAD_REQUEST,
    _ => StatusCode::BAD_GATEWAY,
  }
}

/// Scheme, host and port a request should be sent to.
fn target(uri: &Uri) -> Result<(Scheme, String, u16)> {
  let scheme = Scheme::from_uri(uri);
  let host = uri
    .host()
    .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
    .filter(|h| !h.is_empty())
    .ok_or_else(|| Error::parse(format!("request URI {} has no host", uri)))?;
  let port = uri.port_u16().unwrap_or(scheme.default_port());
  Ok((scheme, host.to_string(), port))
}

/// Runs hooks and the upstream exchange for each flow.
#[derive(Clone, Debug)]
pub(crate) struct FlowHandler {
  hooks: Arc<HookPipeline>,
  pool: Arc<ConnectionPool>,
  response_timeout: Duration,
}

impl FlowHandler {
  pub(crate) fn new(
    hooks: Arc<HookPipeline>,
    pool: Arc<ConnectionPool>,
    response_timeout: Duration,
  ) -> Self {
    FlowHandler {
      hooks,
      pool,
      response_timeout,
    }
  }

  /// Take a flow in `RequestReady` to `ResponseReady` or `Errored`.
  pub(crate) async fn process(&self, flow: &mut Flow, hint: Protocol) {
    if let Err(e) = self.drive(flow, hint).await {
      self.fail(flow, e);
    }
  }

  async fn drive(&self, flow: &mut Flow, hint: Protocol) -> Result<()> {
    self.hooks.run_request(flow);
    if flow.has_response() {
      tracing::debug!(flow = %flow.id(), "request answered by a hook");
      return self.respond(flow);
    }
    let (scheme, host, port) = target(flow.request().uri())?;
    flow.advance(FlowState::AwaitingUpstream)?;
    let response = self
      .exchange(flow, scheme, &host, port, hint)
      .await
      .map_err(|e| match e {
        e @ Error::UpstreamUnavailable(_) => e,
        e => Error::upstream(format!("{}:{}: {}", host, port, e)),
      })?;
    flow.put_response(response);
    self.respond(flow)
  }

  fn respond(&self, flow: &mut Flow) -> Result<()> {
    flow.advance(FlowState::ResponseReady)?;
    self.hooks.run_response(flow);
    Ok(())
  }

  fn fail(&self, flow: &mut Flow, error: Error) {
    tracing::info!(flow = %flow.id(), uri = %flow.request().uri(), "flow failed: {}", error);
    if let Err(e) = flow.fail(error) {
      tracing::warn!(flow = %flow.id(), "{}", e);
      return;
    }
    self.hooks.run_error(flow);
    self.hooks.run_response(flow);
  }

  async fn exchange(
    &self,
    flow: &mut Flow,
    scheme: Scheme,
    host: &str,
    port: u16,
    hint: Protocol,
  ) -> Result<Response> {
    let mut conn = self.pool.obtain(scheme, host, port, hint).await?;
    let response = match self.round_trip(&mut conn, flow).await {
      Err(e)
        if conn.is_reused()
          && conn.protocol() == Protocol::Http1
          && e.is_closed_before_data() =>
      {
        tracing::debug!(flow = %flow.id(), key = %conn.key(), "pooled connection went stale, retrying");
        conn = self.pool.connect(scheme, host, port, hint).await?;
        self.round_trip(&mut conn, flow).await?
      }
      other => other?,
    };
    self.pool.release(conn).await;
    Ok(response)
  }

  async fn round_trip(&self, conn: &mut PooledConnection, flow: &mut Flow) -> Result<Response> {
    let receive_timeout = self.response_timeout;
    match conn.upstream_mut() {
      Upstream::Http1(stream) => {
        http1::write_request(stream, flow.request()).await?;
        self.receiving(flow)?;
        let method = flow.request().method().clone();
        let (response, reusable) =
          tokio::time::timeout(receive_timeout, http1::read_response(stream, &method))
            .await
            .map_err(|_| timed_out(receive_timeout))??;
        conn.set_reusable(reusable);
        Ok(response)
      }
      Upstream::Http2(send) => {
        let pending = http2::send_request(send, flow.request()).await?;
        self.receiving(flow)?;
        let response = tokio::time::timeout(receive_timeout, http2::receive_response(pending))
          .await
          .map_err(|_| timed_out(receive_timeout))??;
        conn.set_reusable(true);
        Ok(response)
      }
    }
  }

  fn receiving(&self, flow: &mut Flow) -> Result<()> {
    if flow.state() == FlowState::AwaitingUpstream {
      flow.advance(FlowState::ReceivingResponse)?;
    }
    Ok(())
  }

  /// Like [`process`](Self::process) for a WebSocket handshake.
  ///
  /// The handshake travels over a dedicated HTTP/1.1 connection that never
  /// enters the pool. When the origin answers `101` that connection is
  /// returned for relaying.
  pub(crate) async fn process_upgrade(
    &self,
    flow: &mut Flow,
  ) -> Option<BufReader<MaybeTlsStream>> {
    match self.drive_upgrade(flow).await {
      Ok(upstream) => upstream,
      Err(e) => {
        self.fail(flow, e);
        None
      }
    }
  }

  async fn drive_upgrade(&self, flow: &mut Flow) -> Result<Option<BufReader<MaybeTlsStream>>> {
    self.hooks.run_request(flow);
    if flow.has_response() {
      self.respond(flow)?;
      return Ok(None);
    }
    let (scheme, host, port) = target(flow.request().uri())?;
    flow.advance(FlowState::AwaitingUpstream)?;
    let mut conn = self
      .pool
      .connect(scheme, &host, port, Protocol::Http1)
      .await?;
    let response = self
      .round_trip(&mut conn, flow)
      .await
      .map_err(|e| Error::upstream(format!("{}:{}: {}", host, port, e)))?;
    let switching = response.status() == StatusCode::SWITCHING_PROTOCOLS;
    flow.put_response(response);
    self.respond(flow)?;
    let switched = flow
      .response()
      .is_some_and(|r| r.status() == StatusCode::SWITCHING_PROTOCOLS);
    match conn.into_upstream() {
      Upstream::Http1(stream) if switching && switched => Ok(Some(stream)),
      _ => Ok(None),
    }
  }
}

fn timed_out(after: Duration) -> Error {
  Error::upstream(format!("no response within {:?}", after))
}
