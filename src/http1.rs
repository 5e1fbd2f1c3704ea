//! HTTP/1.1 codec and client connection driver
//!
//! Bodies are always buffered in full. When a message is written back out its
//! framing is recomputed from the bytes actually present, so hooks can change
//! a body without worrying about `Content-Length`.

use crate::body::{check_body_size, MAX_BODY_SIZE};
use crate::errors::{new_io_error, Error, Result};
use crate::flow::{Flow, FlowState, Request, Response};
use crate::handler::{error_status, Origin};
use crate::headers::Headers;
use crate::pool::Protocol;
use crate::server::ConnContext;
use crate::websocket;
use crate::{CR_LF, SPACE};
use bytes::Bytes;
use http::{Method, StatusCode, Uri, Version};
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::io::{
  AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

/// Upper bound for a request or status line plus headers.
pub(crate) const MAX_HEAD_SIZE: usize = 64 * 1024;

/// A parsed client request, or a `CONNECT` asking for a tunnel.
#[derive(Debug)]
pub(crate) enum Incoming {
  /// An ordinary request with its body.
  Request(Request),
  /// `CONNECT host:port`
  Connect(String),
}

/// How a client connection ended.
pub(crate) enum Served<S> {
  /// The connection is finished.
  Closed,
  /// The client asked for a tunnel; the stream is handed back untouched.
  Connect {
    /// `host:port` from the request line
    authority: String,
    /// The client connection
    stream: S,
  },
}

/// Read one line, spending from `budget`.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>, budget: &mut usize) -> Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  let n = (&mut *reader)
    .take(*budget as u64)
    .read_until(b'\n', buf)
    .await?;
  if n > 0 && !buf.ends_with(b"\n") {
    if n >= *budget {
      return Err(Error::parse("message head too large"));
    }
    return Err(new_io_error(
      ErrorKind::UnexpectedEof,
      "connection closed mid-line",
    ));
  }
  *budget -= n;
  Ok(n)
}

fn is_blank(line: &[u8]) -> bool {
  line == CR_LF || line == b"\n"
}

fn parse_version(raw: &[u8]) -> Result<Version> {
  match raw {
    b"HTTP/1.1" => Ok(Version::HTTP_11),
    b"HTTP/1.0" => Ok(Version::HTTP_10),
    _ => Err(Error::parse(format!(
      "unsupported HTTP version {:?}",
      String::from_utf8_lossy(raw)
    ))),
  }
}

async fn read_headers<R>(reader: &mut R, budget: &mut usize) -> Result<Headers>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = Headers::new();
  let mut line = Vec::new();
  loop {
    line.clear();
    if read_line(reader, &mut line, budget).await? == 0 {
      return Err(new_io_error(
        ErrorKind::UnexpectedEof,
        "connection closed inside headers",
      ));
    }
    if is_blank(&line) {
      return Ok(headers);
    }
    if line[0] == b' ' || line[0] == b'\t' {
      return Err(Error::parse("obsolete header line folding"));
    }
    headers.append_line(&line)?;
  }
}

/// Read the next request from a client.
///
/// Returns `Ok(None)` on a clean EOF between requests. Origin-form targets
/// are completed against `origin`.
pub(crate) async fn read_request<R>(reader: &mut R, origin: &Origin) -> Result<Option<Incoming>>
where
  R: AsyncBufRead + Unpin,
{
  let mut budget = MAX_HEAD_SIZE;
  let mut line = Vec::new();
  loop {
    line.clear();
    if read_line(reader, &mut line, &mut budget).await? == 0 {
      return Ok(None);
    }
    // Stray CRLFs between pipelined requests are allowed.
    if !is_blank(&line) {
      break;
    }
  }
  let trimmed = line.strip_suffix(b"\n").unwrap_or(&line);
  let trimmed = trimmed.strip_suffix(b"\r").unwrap_or(trimmed);
  let parts: Vec<&[u8]> = trimmed.split(|b| *b == b' ').collect();
  let [method, target, version] = parts.as_slice() else {
    return Err(Error::parse("malformed request line"));
  };
  let method = Method::from_bytes(method).map_err(|e| Error::parse(e.to_string()))?;
  let target =
    std::str::from_utf8(target).map_err(|_| Error::parse("request target is not UTF-8"))?;
  let version = parse_version(version)?;
  let headers = read_headers(reader, &mut budget).await?;

  if method == Method::CONNECT {
    return Ok(Some(Incoming::Connect(target.to_string())));
  }

  let uri = origin.complete(target, headers.get_str("host"))?;
  let body = read_body(reader, &headers).await?;
  let mut request = Request::new(method, uri, version);
  *request.headers_mut() = headers;
  request.set_body(body);
  Ok(Some(Incoming::Request(request)))
}

/// Body of a request: chunked, fixed length, or none.
async fn read_body<R>(reader: &mut R, headers: &Headers) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  if headers.contains("transfer-encoding") {
    if !headers.has_token("transfer-encoding", "chunked") {
      return Err(Error::parse("unsupported transfer-encoding"));
    }
    return read_chunked_body(reader).await;
  }
  match content_length(headers)? {
    Some(len) => read_exact_body(reader, len).await,
    None => Ok(Bytes::new()),
  }
}

fn content_length(headers: &Headers) -> Result<Option<usize>> {
  let mut length = None;
  for value in headers.get_all("content-length") {
    let parsed = value
      .to_str()
      .ok()
      .and_then(|v| v.trim().parse::<usize>().ok())
      .ok_or_else(|| Error::parse("invalid content-length"))?;
    if length.is_some_and(|l| l != parsed) {
      return Err(Error::parse("conflicting content-length values"));
    }
    length = Some(parsed);
  }
  Ok(length)
}

async fn read_exact_body<R>(reader: &mut R, len: usize) -> Result<Bytes>
where
  R: AsyncRead + Unpin,
{
  check_body_size(len)?;
  let mut body = Vec::new();
  append_exact(reader, &mut body, len).await?;
  Ok(body.into())
}

/// Append exactly `len` bytes to `body`, growing it as data arrives.
async fn append_exact<R>(reader: &mut R, body: &mut Vec<u8>, len: usize) -> Result<()>
where
  R: AsyncRead + Unpin,
{
  let read = (&mut *reader).take(len as u64).read_to_end(body).await?;
  if read < len {
    return Err(new_io_error(
      ErrorKind::UnexpectedEof,
      "connection closed inside body",
    ));
  }
  Ok(())
}

/// Read until EOF for a response without framing.
async fn read_until_close<R>(reader: &mut R) -> Result<Bytes>
where
  R: AsyncRead + Unpin,
{
  let mut body = Vec::new();
  let limit = MAX_BODY_SIZE as u64 + 1;
  (&mut *reader).take(limit).read_to_end(&mut body).await?;
  check_body_size(body.len())?;
  Ok(body.into())
}

async fn read_chunked_body<R>(reader: &mut R) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  let mut body: Vec<u8> = Vec::new();
  let mut line = Vec::new();
  loop {
    line.clear();
    let mut budget = MAX_HEAD_SIZE;
    if read_line(reader, &mut line, &mut budget).await? == 0 {
      return Err(new_io_error(
        ErrorKind::UnexpectedEof,
        "connection closed inside chunked body",
      ));
    }
    let size = std::str::from_utf8(&line)
      .ok()
      .map(|s| s.split(';').next().unwrap_or("").trim())
      .and_then(|s| usize::from_str_radix(s, 16).ok())
      .ok_or_else(|| Error::parse("invalid chunk size"))?;
    if size == 0 {
      // Trailers are read and dropped.
      loop {
        line.clear();
        let n = read_line(reader, &mut line, &mut budget).await?;
        if n == 0 || is_blank(&line) {
          return Ok(body.into());
        }
      }
    }
    let total = body
      .len()
      .checked_add(size)
      .ok_or_else(|| Error::parse("chunk size overflows"))?;
    check_body_size(total)?;
    append_exact(reader, &mut body, size).await?;
    line.clear();
    read_line(reader, &mut line, &mut budget).await?;
    if !is_blank(&line) {
      return Err(Error::parse("missing CRLF after chunk"));
    }
  }
}

/// Write a request to an origin in origin-form.
pub(crate) async fn write_request<W>(writer: &mut W, request: &Request) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let target = request
    .uri()
    .path_and_query()
    .map(|p| p.as_str())
    .unwrap_or("/");
  let mut headers = request.headers().clone();
  headers.remove("proxy-connection");
  if !headers.contains("host") {
    if let Some(authority) = request.uri().authority() {
      headers.set("Host", authority.as_str())?;
    }
  }
  let had_framing = headers.contains("content-length") || headers.contains("transfer-encoding");
  headers.remove("transfer-encoding");
  if had_framing || !request.body().is_empty() {
    headers.set("Content-Length", request.body().len().to_string())?;
  }

  let mut buf = Vec::with_capacity(256 + request.body().len());
  buf.extend(request.method().as_str().as_bytes());
  buf.extend(SPACE);
  buf.extend(target.as_bytes());
  buf.extend(b" HTTP/1.1");
  buf.extend(CR_LF);
  headers.write_to(&mut buf);
  buf.extend(CR_LF);
  buf.extend(request.body().iter());
  writer.write_all(&buf).await?;
  writer.flush().await?;
  Ok(())
}

/// Read a response from an origin.
///
/// Interim `1xx` responses other than `101` are skipped. The returned flag
/// says whether the connection may carry another request.
pub(crate) async fn read_response<R>(reader: &mut R, method: &Method) -> Result<(Response, bool)>
where
  R: AsyncBufRead + Unpin,
{
  loop {
    let mut budget = MAX_HEAD_SIZE;
    let mut line = Vec::new();
    if read_line(reader, &mut line, &mut budget).await? == 0 {
      return Err(new_io_error(
        ErrorKind::UnexpectedEof,
        "connection closed before response",
      ));
    }
    let (version, status, reason) = parse_status_line(&line)?;
    let headers = read_headers(reader, &mut budget).await?;

    if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
      continue;
    }

    let no_body = method == Method::HEAD
      || status.is_informational()
      || status == StatusCode::NO_CONTENT
      || status == StatusCode::NOT_MODIFIED;
    let (body, framed) = if no_body {
      (Bytes::new(), true)
    } else if headers.has_token("transfer-encoding", "chunked") {
      (read_chunked_body(reader).await?, true)
    } else if let Some(len) = content_length(&headers)? {
      (read_exact_body(reader, len).await?, true)
    } else {
      (read_until_close(reader).await?, false)
    };

    let keep_alive = match version {
      Version::HTTP_11 => !headers.has_token("connection", "close"),
      _ => headers.has_token("connection", "keep-alive"),
    };
    let reusable = framed && keep_alive && status != StatusCode::SWITCHING_PROTOCOLS;

    let mut response = Response::new(status, version);
    if Some(reason.as_str()) != status.canonical_reason() {
      response.set_reason(reason);
    }
    *response.headers_mut() = headers;
    response.set_body(body);
    return Ok((response, reusable));
  }
}

fn parse_status_line(line: &[u8]) -> Result<(Version, StatusCode, String)> {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  let line = line.strip_suffix(b"\r").unwrap_or(line);
  let mut parts = line.splitn(3, |b| *b == b' ');
  let version = parse_version(parts.next().unwrap_or_default())?;
  let status = parts
    .next()
    .filter(|s| s.len() == 3)
    .and_then(|s| StatusCode::from_bytes(s).ok())
    .ok_or_else(|| Error::parse("invalid status code"))?;
  let reason = String::from_utf8_lossy(parts.next().unwrap_or_default()).into_owned();
  Ok((version, status, reason))
}

pub(crate) fn has_no_body(status: StatusCode) -> bool {
  status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
}

/// Serialize a response for a client, fixing up its framing.
///
/// `1xx`, `204` and `304` lose their length headers. `HEAD` keeps its headers
/// but sends no body. A response marked chunked is re-chunked for HTTP/1.1
/// clients; everything else gets a `Content-Length` matching the body.
pub(crate) fn encode_response(
  response: &Response,
  method: &Method,
  client: Version,
) -> Result<Vec<u8>> {
  let mut headers = response.headers().clone();
  let body: &[u8] = response.body();
  let mut payload: Vec<u8> = Vec::new();

  if has_no_body(response.status()) {
    headers.remove("content-length");
    headers.remove("transfer-encoding");
  } else if client == Version::HTTP_11 && headers.has_token("transfer-encoding", "chunked") {
    headers.remove("content-length");
    headers.set("Transfer-Encoding", "chunked")?;
    if method != Method::HEAD {
      if !body.is_empty() {
        payload.extend(format!("{:x}", body.len()).as_bytes());
        payload.extend(CR_LF);
        payload.extend(body);
        payload.extend(CR_LF);
      }
      payload.extend(b"0\r\n\r\n");
    }
  } else if method != Method::HEAD {
    headers.remove("transfer-encoding");
    headers.set("Content-Length", body.len().to_string())?;
    payload.extend(body);
  }

  let mut buf = Vec::with_capacity(256 + payload.len());
  buf.extend(b"HTTP/1.1 ");
  buf.extend(response.status().as_str().as_bytes());
  buf.extend(SPACE);
  buf.extend(response.reason().as_bytes());
  buf.extend(CR_LF);
  headers.write_to(&mut buf);
  buf.extend(CR_LF);
  buf.extend(payload);
  Ok(buf)
}

/// A plain-text response the proxy makes up itself.
pub(crate) fn synthetic_response(status: StatusCode, message: &str) -> Result<Response> {
  let mut response = Response::new(status, Version::HTTP_11);
  let headers = response.headers_mut();
  headers.set("Content-Type", "text/plain; charset=utf-8")?;
  headers.set("Connection", "close")?;
  response.set_body(format!("devrelay: {}\n", message));
  Ok(response)
}

fn encode_error(
  status: StatusCode,
  message: &str,
  method: &Method,
  client: Version,
) -> Result<Vec<u8>> {
  encode_response(&synthetic_response(status, message)?, method, client)
}

/// Whether the client connection can serve another request.
pub(crate) fn keep_alive(request: &Request, response: Option<&Response>) -> bool {
  let headers = request.headers();
  let client_wants = match request.version() {
    Version::HTTP_11 => !headers.has_token("connection", "close"),
    _ => headers.has_token("connection", "keep-alive"),
  };
  let origin_allows = response.is_none_or(|r| !r.headers().has_token("connection", "close"));
  client_wants && origin_allows
}

/// Resolves once the client has closed its side of the connection.
///
/// Pipelined bytes are left in the buffer and the future never resolves.
pub(crate) async fn client_gone<R>(reader: &mut R)
where
  R: AsyncBufRead + Unpin,
{
  match reader.fill_buf().await {
    Ok(buf) if !buf.is_empty() => std::future::pending::<()>().await,
    _ => {}
  }
}

/// Serve HTTP/1.1 requests on a client connection until it closes.
///
/// With `allow_connect` a `CONNECT` request ends the loop and returns the
/// stream for tunnelling. Otherwise `CONNECT` is refused.
pub(crate) async fn serve<S>(
  stream: S,
  peer: SocketAddr,
  origin: Origin,
  ctx: &ConnContext,
  allow_connect: bool,
) -> Result<Served<S>>
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  let (read_half, mut writer) = tokio::io::split(stream);
  let mut reader = BufReader::new(read_half);

  loop {
    let incoming =
      match tokio::time::timeout(ctx.accept_timeout, read_request(&mut reader, &origin)).await {
        Err(_) => {
          tracing::debug!(client = %peer, "idle timeout, closing");
          return Ok(Served::Closed);
        }
        Ok(Ok(None)) => return Ok(Served::Closed),
        Ok(Err(e)) if e.is_closed_before_data() => return Ok(Served::Closed),
        Ok(Err(e)) => {
          let status = error_status(&e);
          let bytes = encode_error(status, &e.to_string(), &Method::GET, Version::HTTP_11)?;
          writer.write_all(&bytes).await?;
          writer.flush().await?;
          return Err(e);
        }
        Ok(Ok(Some(incoming))) => incoming,
      };

    let request = match incoming {
      Incoming::Request(request) => request,
      Incoming::Connect(authority) if allow_connect && reader.buffer().is_empty() => {
        let stream = reader.into_inner().unsplit(writer);
        return Ok(Served::Connect { authority, stream });
      }
      Incoming::Connect(authority) => {
        let bytes = encode_error(
          StatusCode::BAD_REQUEST,
          "CONNECT is not accepted on this connection",
          &Method::CONNECT,
          Version::HTTP_11,
        )?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        return Err(Error::parse(format!("unexpected CONNECT {}", authority)));
      }
    };

    let mut flow = Flow::new(peer, request);
    flow.advance(FlowState::RequestReady)?;
    tracing::debug!(
      flow = %flow.id(),
      client = %peer,
      method = %flow.request().method(),
      uri = %flow.request().uri(),
      "request"
    );

    if flow.request().is_websocket_upgrade() {
      let upstream = tokio::select! {
        upstream = ctx.handler.process_upgrade(&mut flow) => upstream,
        _ = client_gone(&mut reader) => {
          tracing::debug!(flow = %flow.id(), "client left during WebSocket handshake");
          return Ok(Served::Closed);
        }
      };
      let keep = write_flow_response(&mut writer, &mut flow).await?;
      if let Some(upstream) = upstream {
        flow.advance(FlowState::Relaying)?;
        let leftover = Bytes::copy_from_slice(reader.buffer());
        let client = reader.into_inner().unsplit(writer);
        websocket::relay(&flow, client, leftover, upstream).await;
        flow.advance(FlowState::Flushed)?;
        return Ok(Served::Closed);
      }
      if !keep {
        return Ok(Served::Closed);
      }
      continue;
    }

    tokio::select! {
      _ = ctx.handler.process(&mut flow, Protocol::Http1) => {}
      _ = client_gone(&mut reader) => {
        tracing::debug!(flow = %flow.id(), client = %peer, "client disconnected, upstream exchange dropped");
        return Ok(Served::Closed);
      }
    }

    if !write_flow_response(&mut writer, &mut flow).await? {
      return Ok(Served::Closed);
    }
  }
}

/// Write the flow's response, or a synthetic error, and report keep-alive.
async fn write_flow_response<W>(writer: &mut W, flow: &mut Flow) -> Result<bool>
where
  W: AsyncWrite + Unpin,
{
  let method = flow.request().method().clone();
  let client_version = flow.request().version();
  let (bytes, keep) = match (flow.state(), flow.response()) {
    (FlowState::ResponseReady, Some(response)) => (
      encode_response(response, &method, client_version)?,
      keep_alive(flow.request(), Some(response)),
    ),
    _ => {
      let (status, message) = match flow.error() {
        Some(e) => (error_status(e), e.to_string()),
        None => (StatusCode::BAD_GATEWAY, "no response".to_string()),
      };
      (encode_error(status, &message, &method, client_version)?, false)
    }
  };
  writer.write_all(&bytes).await?;
  writer.flush().await?;
  if flow.state() == FlowState::ResponseReady {
    if let Some(response) = flow.response() {
      tracing::debug!(flow = %flow.id(), status = response.status().as_u16(), "response");
    }
    if !flow.response().is_some_and(|r| r.status() == StatusCode::SWITCHING_PROTOCOLS) {
      flow.advance(FlowState::Flushed)?;
    }
  }
  Ok(keep)
}
