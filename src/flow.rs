//! A single intercepted exchange
//!
//! A [`Flow`] carries one request and, once upstream replies or a hook
//! short-circuits, one response. The connection drivers move it through
//! [`FlowState`]; hooks only ever see `&mut Flow` and cannot change its state.

use crate::body::Body;
use crate::errors::{Error, Result};
use crate::headers::Headers;
use http::{Extensions, Method, StatusCode, Uri, Version};
use std::fmt;
use std::net::SocketAddr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Where a flow is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowState {
  /// The request head or body is still being read.
  ReceivingRequest,
  /// The request is parsed; request hooks may run.
  RequestReady,
  /// The request is on its way to the origin.
  AwaitingUpstream,
  /// The origin answered; the response is being read.
  ReceivingResponse,
  /// The response is complete; response hooks may run.
  ResponseReady,
  /// A protocol upgrade succeeded; bytes are relayed verbatim.
  Relaying,
  /// The response has been written to the client.
  Flushed,
  /// The flow failed. See [`Flow::error`].
  Errored,
}

impl FlowState {
  /// `Flushed` and `Errored` end a flow.
  pub fn is_terminal(self) -> bool {
    matches!(self, FlowState::Flushed | FlowState::Errored)
  }

  fn can_advance_to(self, next: FlowState) -> bool {
    use FlowState::*;
    if next == Errored {
      return !self.is_terminal();
    }
    matches!(
      (self, next),
      (ReceivingRequest, RequestReady)
        | (RequestReady, AwaitingUpstream)
        | (RequestReady, ResponseReady)
        | (AwaitingUpstream, ReceivingResponse)
        | (ReceivingResponse, ResponseReady)
        | (ResponseReady, Flushed)
        | (ResponseReady, Relaying)
        | (Relaying, Flushed)
    )
  }
}

impl fmt::Display for FlowState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(self, f)
  }
}

/// The client side of a flow.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
  method: Method,
  uri: Uri,
  version: Version,
  headers: Headers,
  body: Body,
}

impl Request {
  /// Build a request with empty headers and body.
  pub fn new(method: Method, uri: Uri, version: Version) -> Self {
    Request {
      method,
      uri,
      version,
      headers: Headers::new(),
      body: Body::empty(),
    }
  }
  /// The request method.
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// Mutable access to the method.
  pub fn method_mut(&mut self) -> &mut Method {
    &mut self.method
  }
  /// The request target.
  ///
  /// Origin-form targets are completed with the scheme and authority of the
  /// connection they arrived on, so this is always absolute.
  pub fn uri(&self) -> &Uri {
    &self.uri
  }
  /// Mutable access to the target.
  pub fn uri_mut(&mut self) -> &mut Uri {
    &mut self.uri
  }
  /// The protocol version the client spoke.
  pub fn version(&self) -> Version {
    self.version
  }
  /// The request headers.
  pub fn headers(&self) -> &Headers {
    &self.headers
  }
  /// Mutable access to the request headers.
  pub fn headers_mut(&mut self) -> &mut Headers {
    &mut self.headers
  }
  /// The buffered request body.
  pub fn body(&self) -> &Body {
    &self.body
  }
  /// Mutable access to the request body.
  pub fn body_mut(&mut self) -> &mut Body {
    &mut self.body
  }
  /// Replace the request body.
  pub fn set_body(&mut self, body: impl Into<Body>) {
    self.body = body.into();
  }
  /// Origin host taken from the target.
  pub fn host(&self) -> Option<&str> {
    self.uri.host()
  }
  /// Whether this is a WebSocket opening handshake.
  pub fn is_websocket_upgrade(&self) -> bool {
    self.headers.has_token("connection", "upgrade") && self.headers.has_token("upgrade", "websocket")
  }
}

/// The origin side of a flow, or a response a hook made up.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
  status: StatusCode,
  reason: Option<String>,
  version: Version,
  headers: Headers,
  body: Body,
}

impl Response {
  /// Build a response with empty headers and body.
  pub fn new(status: StatusCode, version: Version) -> Self {
    Response {
      status,
      reason: None,
      version,
      headers: Headers::new(),
      body: Body::empty(),
    }
  }
  /// The status code.
  pub fn status(&self) -> StatusCode {
    self.status
  }
  /// Change the status code. The reason phrase falls back to the canonical one.
  pub fn set_status(&mut self, status: StatusCode) {
    self.status = status;
    self.reason = None;
  }
  /// Reason phrase sent on HTTP/1.1.
  pub fn reason(&self) -> &str {
    match &self.reason {
      Some(reason) => reason,
      None => self.status.canonical_reason().unwrap_or("Unknown"),
    }
  }
  /// Override the reason phrase.
  pub fn set_reason(&mut self, reason: impl Into<String>) {
    self.reason = Some(reason.into());
  }
  /// The protocol version of the response.
  pub fn version(&self) -> Version {
    self.version
  }
  /// The response headers.
  pub fn headers(&self) -> &Headers {
    &self.headers
  }
  /// Mutable access to the response headers.
  pub fn headers_mut(&mut self) -> &mut Headers {
    &mut self.headers
  }
  /// The buffered response body.
  pub fn body(&self) -> &Body {
    &self.body
  }
  /// Mutable access to the response body.
  pub fn body_mut(&mut self) -> &mut Body {
    &mut self.body
  }
  /// Replace the response body.
  pub fn set_body(&mut self, body: impl Into<Body>) {
    self.body = body.into();
  }
}

/// Wall-clock marks recorded as the flow advances.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timestamps {
  /// When the first request byte was accepted.
  pub request_start: OffsetDateTime,
  /// When the request was fully parsed.
  pub request_end: Option<OffsetDateTime>,
  /// When the request was handed to the origin.
  pub upstream_start: Option<OffsetDateTime>,
  /// When the response head arrived.
  pub response_start: Option<OffsetDateTime>,
  /// When the response was complete.
  pub response_end: Option<OffsetDateTime>,
  /// When the flow reached a terminal state.
  pub finished: Option<OffsetDateTime>,
}

/// One request/response exchange moving through the proxy.
pub struct Flow {
  id: Uuid,
  client_addr: SocketAddr,
  request: Request,
  response: Option<Response>,
  state: FlowState,
  error: Option<Error>,
  metadata: Extensions,
  timestamps: Timestamps,
}

/// A copy of everything a hook may touch, used to undo a failing hook.
pub(crate) struct Snapshot {
  request: Request,
  response: Option<Response>,
  metadata: Extensions,
}

impl Flow {
  /// Start a flow for a request that is still being received.
  pub fn new(client_addr: SocketAddr, request: Request) -> Self {
    Flow {
      id: Uuid::new_v4(),
      client_addr,
      request,
      response: None,
      state: FlowState::ReceivingRequest,
      error: None,
      metadata: Extensions::new(),
      timestamps: Timestamps {
        request_start: OffsetDateTime::now_utc(),
        request_end: None,
        upstream_start: None,
        response_start: None,
        response_end: None,
        finished: None,
      },
    }
  }

  /// Unique id of this flow.
  pub fn id(&self) -> Uuid {
    self.id
  }
  /// Address of the client that sent the request.
  pub fn client_addr(&self) -> SocketAddr {
    self.client_addr
  }
  /// Current state.
  pub fn state(&self) -> FlowState {
    self.state
  }
  /// The request.
  pub fn request(&self) -> &Request {
    &self.request
  }
  /// Mutable access to the request.
  pub fn request_mut(&mut self) -> &mut Request {
    &mut self.request
  }
  /// The response, if upstream replied or a hook supplied one.
  pub fn response(&self) -> Option<&Response> {
    self.response.as_ref()
  }
  /// Mutable access to the response.
  ///
  /// Returns `None` when there is no response, and also once the response has
  /// been written to the client.
  pub fn response_mut(&mut self) -> Option<&mut Response> {
    if self.is_written() {
      return None;
    }
    self.response.as_mut()
  }
  /// Supply a response.
  ///
  /// Called from a request hook, this short-circuits the flow: no upstream
  /// connection is made.
  pub fn set_response(&mut self, response: Response) -> Result<()> {
    if self.is_written() || self.state.is_terminal() {
      return Err(Error::InvalidState(format!(
        "cannot set a response on a flow in state {}",
        self.state
      )));
    }
    self.response = Some(response);
    Ok(())
  }
  /// The error that ended this flow, if any.
  pub fn error(&self) -> Option<&Error> {
    self.error.as_ref()
  }
  /// Typed scratch space shared by the hooks of this flow.
  pub fn metadata(&self) -> &Extensions {
    &self.metadata
  }
  /// Mutable access to the metadata map.
  pub fn metadata_mut(&mut self) -> &mut Extensions {
    &mut self.metadata
  }
  /// Timing marks.
  pub fn timestamps(&self) -> &Timestamps {
    &self.timestamps
  }

  /// Move to `next`, rejecting transitions the state machine forbids.
  pub(crate) fn advance(&mut self, next: FlowState) -> Result<()> {
    if !self.state.can_advance_to(next) {
      return Err(Error::InvalidState(format!("{} -> {}", self.state, next)));
    }
    let now = OffsetDateTime::now_utc();
    match next {
      FlowState::RequestReady => self.timestamps.request_end = Some(now),
      FlowState::AwaitingUpstream => self.timestamps.upstream_start = Some(now),
      FlowState::ReceivingResponse => self.timestamps.response_start = Some(now),
      FlowState::ResponseReady => self.timestamps.response_end = Some(now),
      FlowState::Flushed | FlowState::Errored => self.timestamps.finished = Some(now),
      FlowState::ReceivingRequest | FlowState::Relaying => {}
    }
    tracing::trace!(flow = %self.id, from = %self.state, to = %next, "flow transition");
    self.state = next;
    Ok(())
  }

  /// Record `error` and move to `Errored`.
  pub(crate) fn fail(&mut self, error: Error) -> Result<()> {
    self.advance(FlowState::Errored)?;
    self.error = Some(error);
    Ok(())
  }

  /// Whether a hook short-circuited the request.
  pub(crate) fn has_response(&self) -> bool {
    self.response.is_some()
  }

  pub(crate) fn put_response(&mut self, response: Response) {
    self.response = Some(response);
  }

  pub(crate) fn snapshot(&self) -> Snapshot {
    Snapshot {
      request: self.request.clone(),
      response: self.response.clone(),
      metadata: self.metadata.clone(),
    }
  }

  pub(crate) fn restore(&mut self, snapshot: Snapshot) {
    self.request = snapshot.request;
    self.response = snapshot.response;
    self.metadata = snapshot.metadata;
  }

  fn is_written(&self) -> bool {
    matches!(self.state, FlowState::Flushed | FlowState::Relaying)
  }
}

impl fmt::Debug for Flow {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Flow")
      .field("id", &self.id)
      .field("client_addr", &self.client_addr)
      .field("state", &self.state)
      .field("request", &self.request)
      .field("response", &self.response)
      .field("error", &self.error)
      .finish()
  }
}
