use super::{is_mutation, Hook, Interest};
use crate::errors::Result;
use crate::flow::{Flow, Response};
use http::{Method, StatusCode};

const ALLOW_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS, HEAD";

/// The permissive header set shared by [`CorsInsert`] and [`CorsPreflight`].
const CORS_HEADERS: [(&str, &str); 5] = [
  ("Access-Control-Allow-Origin", "*"),
  ("Access-Control-Allow-Methods", ALLOW_METHODS),
  ("Access-Control-Allow-Headers", "*"),
  ("Access-Control-Max-Age", "86400"),
  ("Access-Control-Expose-Headers", "*"),
];

fn set_cors_headers(response: &mut Response) -> Result<()> {
  for (name, value) in CORS_HEADERS {
    response.headers_mut().set(name, value)?;
  }
  Ok(())
}

/// A mutation request whose response is informational or successful.
fn successful_mutation(flow: &mut Flow) -> Option<&mut Response> {
  if !is_mutation(flow.request().method()) {
    return None;
  }
  flow
    .response_mut()
    .filter(|r| (100..300).contains(&r.status().as_u16()))
}

/// Sets `Cross-Origin-Resource-Policy: cross-origin` on successful mutations.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorpInsert;

impl Hook for CorpInsert {
  fn name(&self) -> &'static str {
    "corp"
  }

  fn interest(&self) -> Interest {
    Interest::RESPONSE
  }

  fn response(&self, flow: &mut Flow) -> Result<()> {
    if let Some(response) = successful_mutation(flow) {
      response
        .headers_mut()
        .set("Cross-Origin-Resource-Policy", "cross-origin")?;
    }
    Ok(())
  }
}

/// Adds permissive CORS headers to successful mutations.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorsInsert;

impl Hook for CorsInsert {
  fn name(&self) -> &'static str {
    "cors"
  }

  fn interest(&self) -> Interest {
    Interest::RESPONSE
  }

  fn response(&self, flow: &mut Flow) -> Result<()> {
    match successful_mutation(flow) {
      Some(response) => set_cors_headers(response),
      None => Ok(()),
    }
  }
}

/// Turns a `405` answer to `OPTIONS` into an empty `204` with CORS headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorsPreflight;

impl Hook for CorsPreflight {
  fn name(&self) -> &'static str {
    "cors-preflight"
  }

  fn interest(&self) -> Interest {
    Interest::RESPONSE
  }

  fn response(&self, flow: &mut Flow) -> Result<()> {
    if flow.request().method() != Method::OPTIONS {
      return Ok(());
    }
    let flow_id = flow.id();
    let Some(response) = flow.response_mut() else {
      return Ok(());
    };
    if response.status() != StatusCode::METHOD_NOT_ALLOWED {
      return Ok(());
    }
    response.set_status(StatusCode::NO_CONTENT);
    response.set_reason("No Content");
    response.body_mut().clear();
    set_cors_headers(response)?;
    tracing::debug!(flow = %flow_id, "rewrote 405 preflight to 204");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::hooks::tests::flow_with_response;

  fn header<'a>(flow: &'a Flow, name: &str) -> Option<&'a str> {
    flow.response().unwrap().headers().get_str(name)
  }

  #[test]
  fn mutations_with_success_get_corp_and_cors() {
    for method in [Method::POST, Method::PUT, Method::PATCH, Method::DELETE] {
      for status in [StatusCode::CONTINUE, StatusCode::OK, StatusCode::NO_CONTENT] {
        let mut flow = flow_with_response(method.clone(), status);
        CorpInsert.response(&mut flow).unwrap();
        CorsInsert.response(&mut flow).unwrap();
        assert_eq!(header(&flow, "cross-origin-resource-policy"), Some("cross-origin"));
        for (name, value) in CORS_HEADERS {
          assert_eq!(header(&flow, name), Some(value), "{} {}", method, status);
        }
      }
    }
  }

  #[test]
  fn other_methods_and_statuses_are_untouched() {
    let cases = [
      (Method::GET, StatusCode::OK),
      (Method::HEAD, StatusCode::OK),
      (Method::OPTIONS, StatusCode::OK),
      (Method::POST, StatusCode::MOVED_PERMANENTLY),
      (Method::DELETE, StatusCode::NOT_FOUND),
      (Method::PUT, StatusCode::INTERNAL_SERVER_ERROR),
    ];
    for (method, status) in cases {
      let mut flow = flow_with_response(method, status);
      let before = flow.response().unwrap().clone();
      CorpInsert.response(&mut flow).unwrap();
      CorsInsert.response(&mut flow).unwrap();
      assert_eq!(flow.response().unwrap(), &before);
    }
  }

  #[test]
  fn existing_header_is_replaced_not_duplicated() {
    let mut flow = flow_with_response(Method::POST, StatusCode::CREATED);
    flow
      .response_mut()
      .unwrap()
      .headers_mut()
      .append("access-control-allow-origin", "https://app.example")
      .unwrap();
    CorsInsert.response(&mut flow).unwrap();
    let headers = flow.response().unwrap().headers();
    let values: Vec<_> = headers.get_all("Access-Control-Allow-Origin").collect();
    assert_eq!(values, ["*"]);
  }

  #[test]
  fn preflight_405_becomes_204() {
    let mut flow = flow_with_response(Method::OPTIONS, StatusCode::METHOD_NOT_ALLOWED);
    flow
      .response_mut()
      .unwrap()
      .set_body("Method Not Allowed");
    CorsPreflight.response(&mut flow).unwrap();
    let response = flow.response().unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(response.reason(), "No Content");
    assert!(response.body().is_empty());
    assert_eq!(response.headers().get_str("x-keep"), Some("1"));
    for (name, value) in CORS_HEADERS {
      assert_eq!(response.headers().get_str(name), Some(value));
    }
  }

  #[test]
  fn preflight_ignores_other_cases() {
    for (method, status) in [
      (Method::OPTIONS, StatusCode::OK),
      (Method::GET, StatusCode::METHOD_NOT_ALLOWED),
    ] {
      let mut flow = flow_with_response(method, status);
      CorsPreflight.response(&mut flow).unwrap();
      assert_eq!(flow.response().unwrap().status(), status);
      assert!(!flow
        .response()
        .unwrap()
        .headers()
        .contains("access-control-allow-origin"));
    }
  }
}
