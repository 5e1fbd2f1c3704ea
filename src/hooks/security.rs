use super::{Hook, Interest};
use crate::errors::Result;
use crate::flow::Flow;

/// Deletes a fixed set of response headers.
///
/// Used for the CSP, COEP and COOP families, each of which has an enforcing
/// header and a `-report-only` twin.
#[derive(Debug, Clone)]
pub struct StripHeaders {
  name: &'static str,
  headers: &'static [&'static str],
}

impl StripHeaders {
  /// Content-Security-Policy and its report-only variant.
  pub fn csp() -> Self {
    StripHeaders {
      name: "csp",
      headers: &[
        "content-security-policy",
        "content-security-policy-report-only",
      ],
    }
  }

  /// Cross-Origin-Embedder-Policy and its report-only variant.
  pub fn coep() -> Self {
    StripHeaders {
      name: "coep",
      headers: &[
        "cross-origin-embedder-policy",
        "cross-origin-embedder-policy-report-only",
      ],
    }
  }

  /// Cross-Origin-Opener-Policy and its report-only variant.
  pub fn coop() -> Self {
    StripHeaders {
      name: "coop",
      headers: &[
        "cross-origin-opener-policy",
        "cross-origin-opener-policy-report-only",
      ],
    }
  }
}

impl Hook for StripHeaders {
  fn name(&self) -> &'static str {
    self.name
  }

  fn interest(&self) -> Interest {
    Interest::RESPONSE
  }

  fn response(&self, flow: &mut Flow) -> Result<()> {
    let flow_id = flow.id();
    let Some(response) = flow.response_mut() else {
      return Ok(());
    };
    for header in self.headers {
      let removed = response.headers_mut().remove(header);
      if removed > 0 {
        tracing::debug!(flow = %flow_id, hook = self.name, header, removed, "stripped");
      }
    }
    Ok(())
  }
}
