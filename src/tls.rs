//! TLS configuration for both legs of a connection
//!
use crate::ca::CertificateAuthority;
use crate::errors::{Error, Result};
use std::fmt;
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::{
  client::danger::HandshakeSignatureValid, client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier, DigitallySignedStruct, Error as TLSError, RootCertStore,
  SignatureScheme,
};

/// ALPN ids offered to clients on intercepted TLS.
pub(crate) const ALPN_H2: &[u8] = b"h2";
pub(crate) const ALPN_HTTP11: &[u8] = b"http/1.1";
pub(crate) const ALPN_H3: &[u8] = b"h3";

pub(crate) fn provider() -> Arc<CryptoProvider> {
  Arc::new(rustls::crypto::ring::default_provider())
}

/// Issues leaf certificates from the CA during the handshake.
///
/// The SNI names the certificate. When the client sends none, the fallback
/// host (the `CONNECT` target) is used instead; without either the handshake
/// fails.
pub struct LeafResolver {
  ca: Arc<CertificateAuthority>,
  fallback_host: Option<String>,
}

impl LeafResolver {
  /// Resolve from SNI only.
  pub fn new(ca: Arc<CertificateAuthority>) -> Self {
    LeafResolver {
      ca,
      fallback_host: None,
    }
  }

  /// Resolve from SNI, falling back to `host`.
  pub fn with_fallback(ca: Arc<CertificateAuthority>, host: impl Into<String>) -> Self {
    LeafResolver {
      ca,
      fallback_host: Some(host.into()),
    }
  }
}

impl fmt::Debug for LeafResolver {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LeafResolver")
      .field("fallback_host", &self.fallback_host)
      .finish()
  }
}

impl ResolvesServerCert for LeafResolver {
  fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
    let host = client_hello
      .server_name()
      .map(str::to_string)
      .or_else(|| self.fallback_host.clone())?;
    match self.ca.issue_leaf(&host) {
      Ok(leaf) => Some(leaf.certified_key()),
      Err(e) => {
        tracing::warn!(host = %host, "no certificate for handshake: {}", e);
        None
      }
    }
  }
}

/// Server config for an intercepted client connection.
pub(crate) fn server_config(
  resolver: Arc<dyn ResolvesServerCert>,
  alpn: &[&[u8]],
) -> Result<rustls::ServerConfig> {
  let mut config = rustls::ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_cert_resolver(resolver);
  config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
  Ok(config)
}

/// Client config for upstream connections.
///
/// Verification uses the native trust store plus `extra_roots`, unless
/// `insecure` is set, in which case any certificate is accepted.
pub(crate) fn client_config(
  insecure: bool,
  extra_roots: &[CertificateDer<'static>],
  alpn: &[&[u8]],
) -> Result<rustls::ClientConfig> {
  let builder = rustls::ClientConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()?;
  let mut config = if insecure {
    builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth()
  } else {
    builder
      .with_root_certificates(root_store(extra_roots)?)
      .with_no_client_auth()
  };
  config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
  Ok(config)
}

fn root_store(extra_roots: &[CertificateDer<'static>]) -> Result<RootCertStore> {
  let mut roots = RootCertStore::empty();
  let native = rustls_native_certs::load_native_certs();
  for e in &native.errors {
    tracing::debug!("skipping native root: {}", e);
  }
  let (added, ignored) = roots.add_parsable_certificates(native.certs);
  tracing::debug!(added, ignored, "loaded native trust roots");
  for cert in extra_roots {
    roots
      .add(cert.clone())
      .map_err(|e| Error::config(format!("extra root certificate: {}", e)))?;
  }
  Ok(roots)
}

/// Parse a server name for SNI.
pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>> {
  ServerName::try_from(host.to_owned())
    .map_err(|e| Error::upstream(format!("invalid server name {}: {}", host, e)))
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}
