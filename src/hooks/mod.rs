//! Ordered, mutating hooks run over every flow
//!
//! A [`Hook`] declares which extension points it cares about through
//! [`Interest`]. The [`HookPipeline`] calls interested hooks in registration
//! order. A hook that returns an error or panics has its changes undone and
//! the pipeline moves on to the next hook.

mod cors;
mod security;

pub use cors::{CorpInsert, CorsInsert, CorsPreflight};
pub use security::StripHeaders;

use crate::errors::{Error, Result};
use crate::flow::Flow;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Configuration names of the default hooks, in registration order.
pub const DEFAULT_HOOK_NAMES: [&str; 6] = ["csp", "coep", "coop", "corp", "cors", "cors-preflight"];

/// An extension point in a flow's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
  /// The request is parsed and has not been forwarded.
  Request,
  /// The response is complete and has not been written.
  Response,
  /// The flow failed.
  Error,
}

/// The set of [`HookPoint`]s a hook takes part in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
  request: bool,
  response: bool,
  error: bool,
}

impl Interest {
  /// Only the request point.
  pub const REQUEST: Interest = Interest {
    request: true,
    response: false,
    error: false,
  };
  /// Only the response point.
  pub const RESPONSE: Interest = Interest {
    request: false,
    response: true,
    error: false,
  };
  /// Only the error point.
  pub const ERROR: Interest = Interest {
    request: false,
    response: false,
    error: true,
  };

  /// Union of two interests.
  pub const fn and(self, other: Interest) -> Interest {
    Interest {
      request: self.request || other.request,
      response: self.response || other.response,
      error: self.error || other.error,
    }
  }

  /// Whether `point` is part of this interest.
  pub fn contains(&self, point: HookPoint) -> bool {
    match point {
      HookPoint::Request => self.request,
      HookPoint::Response => self.response,
      HookPoint::Error => self.error,
    }
  }
}

/// A named stage that inspects and mutates flows.
///
/// Hooks run synchronously on the connection's task and must not block or
/// perform I/O. Only the points listed in [`Hook::interest`] are called.
pub trait Hook: Send + Sync {
  /// Name used in logs and in `disabled_hooks`.
  fn name(&self) -> &'static str;

  /// The points this hook wants to be called at.
  fn interest(&self) -> Interest;

  /// Called once the request is parsed.
  fn request(&self, _flow: &mut Flow) -> Result<()> {
    Ok(())
  }

  /// Called once the response is complete. The response may be absent.
  fn response(&self, _flow: &mut Flow) -> Result<()> {
    Ok(())
  }

  /// Called when the flow failed.
  fn error(&self, _flow: &mut Flow) -> Result<()> {
    Ok(())
  }
}

/// The default hook list, in order, skipping names in `disabled`.
///
/// Names are compared case-insensitively. Unknown names are ignored here; the
/// config layer rejects them earlier.
pub fn default_hooks<S: AsRef<str>>(disabled: &[S]) -> Vec<Arc<dyn Hook>> {
  let is_disabled = |name: &str| disabled.iter().any(|d| d.as_ref().eq_ignore_ascii_case(name));
  let all: [Arc<dyn Hook>; 6] = [
    Arc::new(StripHeaders::csp()),
    Arc::new(StripHeaders::coep()),
    Arc::new(StripHeaders::coop()),
    Arc::new(CorpInsert),
    Arc::new(CorsInsert),
    Arc::new(CorsPreflight),
  ];
  all
    .into_iter()
    .filter(|hook| !is_disabled(hook.name()))
    .collect()
}

/// Ordered list of hooks.
#[derive(Clone, Default)]
pub struct HookPipeline {
  hooks: Vec<Arc<dyn Hook>>,
}

impl HookPipeline {
  /// An empty pipeline.
  pub fn new() -> Self {
    Self::default()
  }

  /// The six default hooks minus the disabled ones.
  pub fn with_defaults<S: AsRef<str>>(disabled: &[S]) -> Self {
    HookPipeline {
      hooks: default_hooks(disabled),
    }
  }

  /// Append a hook after those already registered.
  pub fn register(&mut self, hook: Arc<dyn Hook>) {
    self.hooks.push(hook);
  }

  /// Names of the registered hooks, in order.
  pub fn names(&self) -> Vec<&'static str> {
    self.hooks.iter().map(|h| h.name()).collect()
  }

  /// Number of registered hooks.
  pub fn len(&self) -> usize {
    self.hooks.len()
  }

  /// Returns true if no hooks are registered.
  pub fn is_empty(&self) -> bool {
    self.hooks.is_empty()
  }

  /// Run the request point.
  pub fn run_request(&self, flow: &mut Flow) {
    self.run(HookPoint::Request, flow)
  }

  /// Run the response point.
  pub fn run_response(&self, flow: &mut Flow) {
    self.run(HookPoint::Response, flow)
  }

  /// Run the error point.
  pub fn run_error(&self, flow: &mut Flow) {
    self.run(HookPoint::Error, flow)
  }

  fn run(&self, point: HookPoint, flow: &mut Flow) {
    for hook in &self.hooks {
      if !hook.interest().contains(point) {
        continue;
      }
      let snapshot = flow.snapshot();
      let outcome = catch_unwind(AssertUnwindSafe(|| match point {
        HookPoint::Request => hook.request(flow),
        HookPoint::Response => hook.response(flow),
        HookPoint::Error => hook.error(flow),
      }));
      let failure = match outcome {
        Ok(Ok(())) => continue,
        Ok(Err(e)) => e,
        Err(panic) => Error::hook(hook.name(), panic_message(panic.as_ref())),
      };
      tracing::warn!(
        flow = %flow.id(),
        hook = hook.name(),
        point = ?point,
        "hook failed, changes rolled back: {}",
        failure
      );
      flow.restore(snapshot);
    }
  }
}

impl std::fmt::Debug for HookPipeline {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_list().entries(self.names()).finish()
  }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.clone()
  } else {
    "panicked".to_string()
  }
}

/// Methods whose successful responses get CORS and CORP headers.
pub(crate) fn is_mutation(method: &http::Method) -> bool {
  matches!(
    *method,
    http::Method::POST | http::Method::PUT | http::Method::PATCH | http::Method::DELETE
  )
}
