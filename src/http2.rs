//! HTTP/2 on both legs
//!
//! Intercepted clients that negotiate `h2` are served here, one task per
//! stream. The upstream half sends flows over a pooled `h2` connection.

use crate::body::check_body_size;
use crate::connector::H2Sender;
use crate::errors::{Error, Result};
use crate::flow::{Flow, FlowState, Request, Response};
use crate::handler::{error_status, Origin};
use crate::headers::Headers;
use crate::http1::{has_no_body, synthetic_response};
use crate::pool::Protocol;
use crate::server::ConnContext;
use bytes::{Bytes, BytesMut};
use h2::client::ResponseFuture;
use h2::server::SendResponse;
use h2::{RecvStream, SendStream};
use http::header::{CONTENT_LENGTH, HOST};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Version};
use std::future::poll_fn;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Headers that only make sense on an HTTP/1 connection.
const CONNECTION_HEADERS: [&str; 5] = [
  "connection",
  "keep-alive",
  "proxy-connection",
  "transfer-encoding",
  "upgrade",
];

pub(crate) fn strip_connection_headers(headers: &mut HeaderMap) {
  for name in CONNECTION_HEADERS {
    headers.remove(name);
  }
  let te_trailers = headers
    .get(http::header::TE)
    .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"trailers"));
  if !te_trailers {
    headers.remove(http::header::TE);
  }
}

/// Read a whole body, handing flow-control capacity back as data arrives.
pub(crate) async fn read_body(mut body: RecvStream) -> Result<Bytes> {
  let mut data = BytesMut::new();
  while let Some(chunk) = body.data().await {
    let chunk = chunk?;
    body.flow_control().release_capacity(chunk.len())?;
    check_body_size(data.len() + chunk.len())?;
    data.extend_from_slice(&chunk);
  }
  Ok(data.freeze())
}

/// Reject a message whose `content-length` is already over the body limit.
pub(crate) fn check_declared_length(headers: &HeaderMap) -> Result<()> {
  let declared = headers
    .get(CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.trim().parse::<u64>().ok());
  match declared {
    Some(len) => check_body_size(usize::try_from(len).unwrap_or(usize::MAX)),
    None => Ok(()),
  }
}

/// Send `data` as the end of a stream, respecting the peer's window.
pub(crate) async fn send_body(stream: &mut SendStream<Bytes>, mut data: Bytes) -> Result<()> {
  while !data.is_empty() {
    stream.reserve_capacity(data.len());
    match poll_fn(|cx| stream.poll_capacity(cx)).await {
      Some(Ok(0)) => continue,
      Some(Ok(n)) => {
        let chunk = data.split_to(n.min(data.len()));
        stream.send_data(chunk, data.is_empty())?;
      }
      Some(Err(e)) => return Err(e.into()),
      None => return Err(Error::parse("HTTP/2 stream closed while sending body")),
    }
  }
  Ok(())
}

/// Start a request on an upstream HTTP/2 connection.
pub(crate) async fn send_request(send: &mut H2Sender, request: &Request) -> Result<ResponseFuture> {
  let mut ready = send.clone().ready().await?;
  let mut headers = request.headers().to_header_map()?;
  strip_connection_headers(&mut headers);
  headers.remove(HOST);
  headers.remove(CONTENT_LENGTH);
  let body = request.body().clone().into_bytes();
  if !body.is_empty() {
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
  }

  let mut outgoing = http::Request::new(());
  *outgoing.method_mut() = request.method().clone();
  *outgoing.uri_mut() = request.uri().clone();
  *outgoing.version_mut() = Version::HTTP_2;
  *outgoing.headers_mut() = headers;

  let end_of_stream = body.is_empty();
  let (response, mut stream) = ready.send_request(outgoing, end_of_stream)?;
  if !end_of_stream {
    send_body(&mut stream, body).await?;
  }
  Ok(response)
}

/// Wait for the response to a request started with [`send_request`].
pub(crate) async fn receive_response(pending: ResponseFuture) -> Result<Response> {
  let (parts, body) = pending.await?.into_parts();
  check_declared_length(&parts.headers)?;
  let data = read_body(body).await?;
  let mut response = Response::new(parts.status, Version::HTTP_2);
  *response.headers_mut() = Headers::from(&parts.headers);
  response.set_body(data);
  Ok(response)
}

/// Serve an intercepted HTTP/2 client connection.
pub(crate) async fn serve<S>(
  stream: S,
  peer: SocketAddr,
  origin: Origin,
  ctx: Arc<ConnContext>,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut connection = tokio::time::timeout(ctx.accept_timeout, h2::server::handshake(stream))
    .await
    .map_err(|_| Error::handshake("HTTP/2 preface timed out"))??;

  while let Some(next) = connection.accept().await {
    let (request, respond) = match next {
      Ok(stream) => stream,
      Err(e) => {
        tracing::debug!(client = %peer, "HTTP/2 connection ended: {}", e);
        break;
      }
    };
    let origin = origin.clone();
    let ctx = ctx.clone();
    tokio::spawn(async move {
      if let Err(e) = handle_stream(request, respond, peer, origin, ctx).await {
        tracing::debug!(client = %peer, "HTTP/2 stream failed: {}", e);
      }
    });
  }
  Ok(())
}

async fn handle_stream(
  request: http::Request<RecvStream>,
  mut respond: SendResponse<Bytes>,
  peer: SocketAddr,
  origin: Origin,
  ctx: Arc<ConnContext>,
) -> Result<()> {
  let (parts, body) = request.into_parts();
  let data = match check_declared_length(&parts.headers) {
    Ok(()) => read_body(body).await,
    Err(e) => Err(e),
  };
  let data = match data {
    Ok(data) => data,
    Err(e) => {
      if matches!(e, Error::Parse(_)) {
        respond.send_reset(h2::Reason::REFUSED_STREAM);
      }
      return Err(e);
    }
  };
  let uri = if parts.uri.authority().is_some() {
    parts.uri
  } else {
    let path = parts.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    origin.complete(path, parts.headers.get(HOST).and_then(|v| v.to_str().ok()))?
  };
  let mut request = Request::new(parts.method, uri, Version::HTTP_2);
  *request.headers_mut() = Headers::from(&parts.headers);
  request.set_body(data);

  let mut flow = Flow::new(peer, request);
  flow.advance(FlowState::RequestReady)?;
  tracing::debug!(
    flow = %flow.id(),
    client = %peer,
    method = %flow.request().method(),
    uri = %flow.request().uri(),
    "h2 request"
  );

  tokio::select! {
    _ = ctx.handler.process(&mut flow, Protocol::Http2) => {}
    reason = poll_fn(|cx| respond.poll_reset(cx)) => {
      tracing::debug!(flow = %flow.id(), ?reason, "client reset stream, upstream exchange dropped");
      return Ok(());
    }
  }

  send_flow_response(&mut respond, &mut flow).await
}

/// Response head and body for a finished flow, framed for HTTP/2 and HTTP/3.
///
/// The body is `None` when the stream ends with the headers.
pub(crate) fn outgoing_response(flow: &Flow) -> Result<(http::Response<()>, Option<Bytes>)> {
  let is_head = flow.request().method() == Method::HEAD;
  let (status, mut headers, body) = match (flow.state(), flow.response()) {
    (FlowState::ResponseReady, Some(r)) => (
      r.status(),
      r.headers().to_header_map()?,
      r.body().clone().into_bytes(),
    ),
    _ => {
      let (status, message) = match flow.error() {
        Some(e) => (error_status(e), e.to_string()),
        None => (StatusCode::BAD_GATEWAY, "no response".to_string()),
      };
      let r = synthetic_response(status, &message)?;
      (status, r.headers().to_header_map()?, r.body().clone().into_bytes())
    }
  };

  strip_connection_headers(&mut headers);
  let no_body = has_no_body(status);
  if no_body {
    headers.remove(CONTENT_LENGTH);
  } else if !is_head {
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
  }

  let mut response = http::Response::new(());
  *response.status_mut() = status;
  *response.headers_mut() = headers;
  let body = (!no_body && !is_head && !body.is_empty()).then_some(body);
  Ok((response, body))
}

async fn send_flow_response(respond: &mut SendResponse<Bytes>, flow: &mut Flow) -> Result<()> {
  let (response, body) = outgoing_response(flow)?;
  let status = response.status();
  let mut stream = respond.send_response(response, body.is_none())?;
  if let Some(body) = body {
    send_body(&mut stream, body).await?;
  }

  if flow.state() == FlowState::ResponseReady {
    tracing::debug!(flow = %flow.id(), status = status.as_u16(), "h2 response");
    flow.advance(FlowState::Flushed)?;
  }
  Ok(())
}
