#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # devrelay
//!
//! An intercepting HTTP(S) proxy for local development. It removes the
//! security headers that get in the way of cross-origin testing and adds
//! permissive CORS headers to the responses that need them.
//!
//! - Explicit proxy (`CONNECT`) and direct TLS, with leaf certificates issued
//!   on the fly from a local root CA
//! - HTTP/1.1, HTTP/2 and optionally HTTP/3 towards clients; WebSocket
//!   upgrades are relayed untouched
//! - Pooled upstream connections, HTTP/2 when the origin offers it
//! - An ordered pipeline of [`Hook`]s that can inspect and rewrite every flow
//!
//! ## Running a proxy
//!
//! ```no_run
//! # async fn run() -> devrelay::Result<()> {
//! let config = devrelay::ProxyConfig {
//!   port: 8080,
//!   ..Default::default()
//! };
//! let relay = devrelay::DevRelay::new(config).await?;
//! println!(
//!   "trust {} in your browser",
//!   relay.certificate_authority().ca_cert_path().display()
//! );
//! let handle = relay.listen().await?;
//! tokio::signal::ctrl_c().await?;
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Default hooks
//!
//! | name             | effect                                                       |
//! |------------------|--------------------------------------------------------------|
//! | `csp`            | strips `Content-Security-Policy` and its report-only variant |
//! | `coep`           | strips `Cross-Origin-Embedder-Policy` and its variant        |
//! | `coop`           | strips `Cross-Origin-Opener-Policy` and its variant          |
//! | `corp`           | sets `Cross-Origin-Resource-Policy: cross-origin`            |
//! | `cors`           | sets the `Access-Control-Allow-*` headers                    |
//! | `cors-preflight` | turns a `405` answer to `OPTIONS` into `204`                 |
//!
//! `corp` and `cors` only touch successful `POST`, `PUT`, `PATCH` and
//! `DELETE` responses. Any hook can be disabled by name through
//! [`ProxyConfig::disabled_hooks`].
//!
//! ## Custom hooks
//!
//! ```
//! use devrelay::{Flow, Hook, HookPipeline, Interest, Result};
//!
//! struct Tag;
//!
//! impl Hook for Tag {
//!   fn name(&self) -> &'static str {
//!     "tag"
//!   }
//!   fn interest(&self) -> Interest {
//!     Interest::RESPONSE
//!   }
//!   fn response(&self, flow: &mut Flow) -> Result<()> {
//!     if let Some(response) = flow.response_mut() {
//!       response.headers_mut().set("X-Relayed", "1")?;
//!     }
//!     Ok(())
//!   }
//! }
//!
//! let mut pipeline = HookPipeline::with_defaults::<&str>(&[]);
//! pipeline.register(std::sync::Arc::new(Tag));
//! assert_eq!(pipeline.len(), 7);
//! ```

mod body;
/// Root CA and leaf certificate issuance
pub mod ca;
/// Configuration loading and merging
pub mod config;
mod connector;
mod errors;
mod flow;
mod handler;
mod headers;
/// Flow hooks and the default header rewrites
pub mod hooks;
mod http1;
mod http2;
mod http3;
/// Upstream connection pool
pub mod pool;
mod proxy;
mod server;
mod socket;
mod tls;
mod websocket;

pub use body::Body;
pub use ca::CertificateAuthority;
pub use config::{ConfigLoader, Overrides, ProxyConfig};
pub use connector::{Connector, ConnectorBuilder};
pub use errors::{Error, Result};
pub use flow::{Flow, FlowState, Request, Response, Timestamps};
pub use headers::Headers;
pub use hooks::{Hook, HookPipeline, HookPoint, Interest};
pub use proxy::{DevRelay, ProxyHandle};
pub use socket::MaybeTlsStream;
pub use tls::LeafResolver;

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
