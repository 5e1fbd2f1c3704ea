//! proxy error
use std::io::ErrorKind;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `devrelay::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The Errors that may occur while relaying traffic through `devrelay`.
#[derive(ThisError, Debug)]
pub enum Error {
  /// The root CA could not be loaded/generated, or a leaf could not be signed
  #[error("certificate issuance failed: {0}")]
  CertIssuance(String),
  /// A client TLS handshake was malformed or could not be completed
  #[error("handshake failed: {0}")]
  Handshake(String),
  /// Malformed HTTP on either leg
  #[error("parse error: {0}")]
  Parse(String),
  /// Connect, timeout or TLS verification failure talking to the origin
  #[error("upstream unavailable: {0}")]
  UpstreamUnavailable(String),
  /// A hook failed while mutating a flow
  #[error("hook {hook} failed: {message}")]
  Hook {
    /// Name of the failing hook
    hook: &'static str,
    /// What went wrong
    message: String,
  },
  /// Invalid configuration value or file
  #[error("config error: {0}")]
  Config(String),
  /// A flow was asked to make a transition its state machine forbids
  #[error("invalid flow state: {0}")]
  InvalidState(String),
  /// tls Error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
}

impl Error {
  /// Create a certificate issuance error and log it
  pub fn cert_issuance(msg: impl Into<String>) -> Self {
    let error = Error::CertIssuance(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a handshake error and log it
  pub fn handshake(msg: impl Into<String>) -> Self {
    let error = Error::Handshake(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a parse error and log it
  pub fn parse(msg: impl Into<String>) -> Self {
    let error = Error::Parse(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create an upstream error and log it
  pub fn upstream(msg: impl Into<String>) -> Self {
    let error = Error::UpstreamUnavailable(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create a hook error
  pub fn hook(hook: &'static str, msg: impl Into<String>) -> Self {
    Error::Hook {
      hook,
      message: msg.into(),
    }
  }

  /// Create a config error
  pub fn config(msg: impl Into<String>) -> Self {
    Error::Config(msg.into())
  }

  /// Whether this error means the origin could not be reached or did not answer.
  pub fn is_upstream(&self) -> bool {
    matches!(self, Error::UpstreamUnavailable(_))
  }

  /// Whether this error is the peer going away before a single byte was read.
  pub(crate) fn is_closed_before_data(&self) -> bool {
    match self {
      Error::IO(e) => matches!(
        e.kind(),
        ErrorKind::UnexpectedEof
          | ErrorKind::ConnectionReset
          | ErrorKind::ConnectionAborted
          | ErrorKind::BrokenPipe
      ),
      _ => false,
    }
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderName> for Error {
  fn from(value: http::header::InvalidHeaderName) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Parse(value.to_string())
  }
}

impl From<h2::Error> for Error {
  fn from(value: h2::Error) -> Self {
    if value.is_io() {
      match value.into_io() {
        Some(io) => Error::IO(io),
        None => Error::Parse("HTTP/2 I/O error".to_string()),
      }
    } else {
      Error::Parse(format!("HTTP/2: {}", value))
    }
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn closed_before_data_matches_eof_like_kinds() {
    assert!(new_io_error(ErrorKind::UnexpectedEof, "eof").is_closed_before_data());
    assert!(new_io_error(ErrorKind::ConnectionReset, "rst").is_closed_before_data());
    assert!(!new_io_error(ErrorKind::TimedOut, "slow").is_closed_before_data());
    assert!(!Error::parse("bad").is_closed_before_data());
  }

  #[test]
  fn hook_error_names_hook() {
    let e = Error::hook("csp", "boom");
    assert_eq!(e.to_string(), "hook csp failed: boom");
  }
}
