use std::fmt;
use std::ops::{Deref, DerefMut};

use crate::errors::{Error, Result};
use bytes::Bytes;

/// Largest body buffered for a single message, in either direction.
pub(crate) const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Fail once a body has grown, or claims it will grow, past [`MAX_BODY_SIZE`].
pub(crate) fn check_body_size(len: usize) -> Result<()> {
  if len > MAX_BODY_SIZE {
    return Err(Error::parse(format!(
      "body of {} bytes exceeds the {} byte limit",
      len, MAX_BODY_SIZE
    )));
  }
  Ok(())
}

/// A fully buffered message body.
///
/// Both legs of a flow are read to completion before hooks run, so a body is
/// always a single contiguous `Bytes`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Body {
  inner: Bytes,
}

impl Body {
  /// An empty body.
  pub fn empty() -> Self {
    Self::default()
  }

  /// Drop the content, leaving an empty body.
  pub fn clear(&mut self) {
    self.inner = Bytes::new();
  }

  /// Consume the body and return the underlying bytes.
  pub fn into_bytes(self) -> Bytes {
    self.inner
  }
}

impl Deref for Body {
  type Target = Bytes;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl DerefMut for Body {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.inner
  }
}

impl From<Bytes> for Body {
  #[inline]
  fn from(b: Bytes) -> Body {
    Body { inner: b }
  }
}

impl From<String> for Body {
  #[inline]
  fn from(s: String) -> Body {
    s.into_bytes().into()
  }
}

impl From<&'static str> for Body {
  #[inline]
  fn from(s: &'static str) -> Body {
    s.as_bytes().into()
  }
}

impl From<&'static [u8]> for Body {
  #[inline]
  fn from(s: &'static [u8]) -> Body {
    Body {
      inner: Bytes::from_static(s),
    }
  }
}

impl From<Vec<u8>> for Body {
  #[inline]
  fn from(v: Vec<u8>) -> Body {
    Body { inner: v.into() }
  }
}

impl fmt::Debug for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(&self.inner) {
      Ok(s) => fmt::Debug::fmt(s, f),
      Err(_err) => write!(f, "<{} bytes>", self.inner.len()),
    }
  }
}
