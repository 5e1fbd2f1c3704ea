//! Ordered, case-insensitive header multimap
//!
//! `http::HeaderMap` lowercases names, which would rewrite every header that
//! passes through the proxy. [`Headers`] keeps the spelling the peer used while
//! still matching names case-insensitively.

use crate::errors::{Error, Result};
use crate::{COLON_SPACE, CR_LF};
use http::{HeaderMap, HeaderName, HeaderValue};
use std::fmt;

/// An ordered collection of `(name, value)` pairs.
///
/// Lookups, insertions and deletions ignore ASCII case on the name. Repeated
/// names are kept in insertion order. A name never appears twice with two
/// different spellings: appending reuses the spelling already present.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Headers {
  entries: Vec<(String, HeaderValue)>,
}

impl Headers {
  /// Create an empty header map.
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of `(name, value)` pairs.
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// Returns true if there are no headers.
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Whether at least one value exists for `name`.
  pub fn contains(&self, name: &str) -> bool {
    self.position(name).is_some()
  }

  /// The first value for `name`.
  pub fn get(&self, name: &str) -> Option<&HeaderValue> {
    self
      .entries
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v)
  }

  /// The first value for `name` as text, if it is visible ASCII.
  pub fn get_str(&self, name: &str) -> Option<&str> {
    self.get(name).and_then(|v| v.to_str().ok())
  }

  /// All values for `name`, in insertion order.
  pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a HeaderValue> + 'a {
    self
      .entries
      .iter()
      .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v)
  }

  /// Append a value, keeping existing values for the same name.
  pub fn append<V>(&mut self, name: &str, value: V) -> Result<()>
  where
    V: TryInto<HeaderValue>,
    V::Error: Into<http::Error>,
  {
    let value = value.try_into().map_err(Into::into)?;
    let name = match self.position(name) {
      Some(index) => self.entries[index].0.clone(),
      None => validated_name(name)?,
    };
    self.entries.push((name, value));
    Ok(())
  }

  /// Set `name` to a single value.
  ///
  /// The first existing entry is overwritten in place and any later entries for
  /// the same name are dropped. Absent names are appended with the given
  /// spelling.
  pub fn set<V>(&mut self, name: &str, value: V) -> Result<()>
  where
    V: TryInto<HeaderValue>,
    V::Error: Into<http::Error>,
  {
    let value = value.try_into().map_err(Into::into)?;
    match self.position(name) {
      Some(index) => {
        self.entries[index].1 = value;
        let mut seen = 0usize;
        self.entries.retain(|(k, _)| {
          if k.eq_ignore_ascii_case(name) {
            seen += 1;
            seen == 1
          } else {
            true
          }
        });
      }
      None => {
        let name = validated_name(name)?;
        self.entries.push((name, value));
      }
    }
    Ok(())
  }

  /// Remove every value for `name`, returning how many were removed.
  pub fn remove(&mut self, name: &str) -> usize {
    let before = self.entries.len();
    self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    before - self.entries.len()
  }

  /// Iterate over `(name, value)` pairs in order, with the original spelling.
  pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
    self.entries.iter().map(|(k, v)| (k.as_str(), v))
  }

  /// Whether a comma separated header contains `token`, ignoring case.
  pub fn has_token(&self, name: &str, token: &str) -> bool {
    self.get_all(name).any(|v| {
      v.to_str()
        .map(|s| s.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
        .unwrap_or(false)
    })
  }

  /// Parse one `Name: value` line, with or without its trailing CRLF.
  pub(crate) fn append_line(&mut self, line: &[u8]) -> Result<()> {
    let line = line.strip_suffix(CR_LF).unwrap_or(line);
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let colon = line
      .iter()
      .position(|b| *b == b':')
      .ok_or_else(|| Error::parse("header line without colon"))?;
    let name = std::str::from_utf8(&line[..colon])
      .map_err(|_| Error::parse("header name is not valid UTF-8"))?;
    if name.is_empty() || name.ends_with([' ', '\t']) {
      return Err(Error::parse(format!("invalid header name {:?}", name)));
    }
    let value = trim_ows(&line[colon + 1..]);
    let value = HeaderValue::from_bytes(value).map_err(|e| Error::parse(e.to_string()))?;
    self
      .append(name, value)
      .map_err(|e| Error::parse(format!("invalid header name {:?}: {}", name, e)))
  }

  /// Serialize as HTTP/1 header lines, each ending in CRLF.
  pub(crate) fn write_to(&self, buf: &mut Vec<u8>) {
    for (k, v) in &self.entries {
      buf.extend(k.as_bytes());
      buf.extend(COLON_SPACE);
      buf.extend(v.as_bytes());
      buf.extend(CR_LF);
    }
  }

  /// Convert to an `http::HeaderMap`, lowercasing names.
  pub fn to_header_map(&self) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(self.entries.len());
    for (k, v) in &self.entries {
      map.append(HeaderName::from_bytes(k.as_bytes())?, v.clone());
    }
    Ok(map)
  }

  fn position(&self, name: &str) -> Option<usize> {
    self
      .entries
      .iter()
      .position(|(k, _)| k.eq_ignore_ascii_case(name))
  }
}

impl From<&HeaderMap> for Headers {
  fn from(map: &HeaderMap) -> Self {
    let entries = map
      .iter()
      .map(|(k, v)| (k.as_str().to_string(), v.clone()))
      .collect();
    Headers { entries }
  }
}

impl fmt::Debug for Headers {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_map().entries(self.iter()).finish()
  }
}

fn validated_name(name: &str) -> Result<String> {
  // HeaderName enforces the token grammar; we keep the caller's casing.
  HeaderName::from_bytes(name.as_bytes())?;
  Ok(name.to_string())
}

fn trim_ows(mut value: &[u8]) -> &[u8] {
  while let [b' ' | b'\t', rest @ ..] = value {
    value = rest;
  }
  while let [rest @ .., b' ' | b'\t'] = value {
    value = rest;
  }
  value
}
