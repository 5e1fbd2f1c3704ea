//! Certificate Authority (CA) management
//!
//! The root key pair lives on disk next to the configuration. Leaf
//! certificates are signed on demand for every intercepted hostname and kept
//! in memory only.
//!

use crate::errors::{Error, Result};
use moka::sync::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls::crypto::ring::sign::any_supported_type;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::sign::CertifiedKey;

/// File name of the root certificate inside the certificate directory
pub const CA_CERT_FILE: &str = "devrelay-ca.pem";
/// File name of the root private key inside the certificate directory
pub const CA_KEY_FILE: &str = "devrelay-ca-key.pem";

/// Leaf validity period in seconds (1 year)
const TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Cache time-to-live in seconds (6 months)
const CACHE_TTL: u64 = (TTL_SECS / 2) as u64;
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;
/// Root validity in days
const ROOT_TTL_DAYS: i64 = 3650;
const CACHE_CAPACITY: u64 = 1000;

/// A signed leaf certificate and everything needed to serve it.
pub struct LeafCert {
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
  certified: Arc<CertifiedKey>,
  not_after: OffsetDateTime,
}

impl LeafCert {
  /// `[leaf, root]`
  pub fn chain(&self) -> &[CertificateDer<'static>] {
    &self.chain
  }
  /// The leaf private key (PKCS#8).
  pub fn key(&self) -> &PrivateKeyDer<'static> {
    &self.key
  }
  /// The chain and key, ready for a rustls certificate resolver.
  pub fn certified_key(&self) -> Arc<CertifiedKey> {
    self.certified.clone()
  }
  /// End of the validity window.
  pub fn not_after(&self) -> OffsetDateTime {
    self.not_after
  }
}

impl std::fmt::Debug for LeafCert {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LeafCert")
      .field("chain_len", &self.chain.len())
      .field("not_after", &self.not_after)
      .finish()
  }
}

/// Root CA plus an in-memory cache of issued leaves.
pub struct CertificateAuthority {
  /// Root CA issuer
  issuer: Issuer<'static, KeyPair>,
  /// Root CA certificate in DER format
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
  /// Storage path for the root material
  storage_path: PathBuf,
  leaves: Cache<String, Arc<LeafCert>>,
}

impl std::fmt::Debug for CertificateAuthority {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CertificateAuthority")
      .field("storage_path", &self.storage_path)
      .field("cached_leaves", &self.leaves.entry_count())
      .finish()
  }
}

impl CertificateAuthority {
  /// Load the root from `storage_path`, generating it on first use.
  ///
  /// Both files must be present or both absent. A lone certificate or key is
  /// an error rather than something to overwrite.
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();
    fs::create_dir_all(&storage_path)
      .await
      .map_err(|e| Error::cert_issuance(format!("create {}: {}", storage_path.display(), e)))?;

    let cert_path = storage_path.join(CA_CERT_FILE);
    let key_path = storage_path.join(CA_KEY_FILE);

    let (issuer, ca_cert_der, ca_cert_pem) = match (cert_path.exists(), key_path.exists()) {
      (true, true) => Self::load_ca(&cert_path, &key_path).await?,
      (false, false) => Self::generate_ca(&cert_path, &key_path).await?,
      (true, false) | (false, true) => {
        return Err(Error::cert_issuance(format!(
          "only one of {} and {} exists in {}; remove it or restore the other",
          CA_CERT_FILE,
          CA_KEY_FILE,
          storage_path.display()
        )))
      }
    };

    let leaves = Cache::builder()
      .max_capacity(CACHE_CAPACITY)
      .time_to_live(std::time::Duration::from_secs(CACHE_TTL))
      .build();

    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem,
      storage_path,
      leaves,
    })
  }

  /// Load existing CA certificate and key
  async fn load_ca(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>, String)> {
    let cert_pem = fs::read_to_string(cert_path)
      .await
      .map_err(|e| Error::cert_issuance(format!("read {}: {}", cert_path.display(), e)))?;
    let key_pem = fs::read_to_string(key_path)
      .await
      .map_err(|e| Error::cert_issuance(format!("read {}: {}", key_path.display(), e)))?;

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::cert_issuance(format!("failed to parse CA key: {}", e)))?;

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::cert_issuance(format!("failed to load CA cert: {}", e)))?;

    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::cert_issuance("no certificate found in CA PEM"))?
      .map_err(|e| Error::cert_issuance(format!("failed to parse CA PEM: {}", e)))?;

    tracing::info!(path = %cert_path.display(), "loaded root CA");
    Ok((issuer, cert_der, cert_pem))
  }

  /// Generate a new CA certificate and key
  async fn generate_ca(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>, String)> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "devrelay Root CA");
    dn.push(DnType::OrganizationName, "devrelay");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
      KeyUsagePurpose::DigitalSignature,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(ROOT_TTL_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::cert_issuance(format!("failed to generate key pair: {}", e)))?;

    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::cert_issuance(format!("failed to generate CA: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    persist_root(cert_path, &cert_pem, key_path, &key_pem)
      .await
      .map_err(|e| Error::cert_issuance(format!("failed to store CA: {}", e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::cert_issuance(format!("failed to create issuer: {}", e)))?;

    tracing::info!(path = %cert_path.display(), "generated new root CA");
    Ok((issuer, cert_der, cert_pem))
  }

  /// Return the leaf for `hostname`, signing one if none is cached.
  ///
  /// Concurrent calls for the same host share a single signing operation.
  pub fn issue_leaf(&self, hostname: &str) -> Result<Arc<LeafCert>> {
    let host = normalize_host(hostname);
    if host.is_empty() {
      return Err(Error::cert_issuance("empty hostname"));
    }
    self
      .leaves
      .try_get_with(host.clone(), || self.sign_leaf(&host).map(Arc::new))
      .map_err(|e| Error::CertIssuance(e.to_string()))
  }

  /// Sign a fresh leaf for an already normalized host.
  fn sign_leaf(&self, domain: &str) -> Result<LeafCert> {
    let mut params = CertificateParams::default();

    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, domain);
    params.distinguished_name = dn;

    // IP literals get an IP SAN; some clients only check dNSName, so the
    // textual form goes in as well when rcgen accepts it.
    params.subject_alt_names = if let Ok(ip) = domain.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = domain.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(domain.try_into().map_err(|_| {
        Error::cert_issuance(format!("invalid domain name: {}", domain))
      })?)]
    };
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(TTL_SECS);
    let not_after = params.not_after;

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::cert_issuance(format!("failed to generate key pair: {}", e)))?;

    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::cert_issuance(format!("failed to sign leaf for {}: {}", domain, e)))?;

    let chain = vec![
      CertificateDer::from(cert.der().to_vec()),
      self.ca_cert_der.clone(),
    ];
    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::cert_issuance("failed to serialize leaf key"))?;
    let signing_key = any_supported_type(&key)
      .map_err(|e| Error::cert_issuance(format!("unsupported leaf key: {}", e)))?;
    let certified = Arc::new(CertifiedKey::new(chain.clone(), signing_key));

    tracing::debug!(host = domain, "issued leaf certificate");
    Ok(LeafCert {
      chain,
      key,
      certified,
      not_after,
    })
  }

  /// Get CA certificate in PEM format for client installation
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Root certificate in DER form.
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  /// Get CA certificate path
  pub fn ca_cert_path(&self) -> PathBuf {
    self.storage_path.join(CA_CERT_FILE)
  }

  /// Number of cached leaves.
  pub fn cached_leaves(&self) -> u64 {
    self.leaves.run_pending_tasks();
    self.leaves.entry_count()
  }
}

/// Sibling path a root file is written to before it is renamed into place.
pub fn staging_path(path: &Path) -> PathBuf {
  let mut name = path.as_os_str().to_owned();
  name.push(".tmp");
  PathBuf::from(name)
}

async fn write_pem(path: &Path, pem: &str, private: bool) -> std::io::Result<()> {
  fs::remove_file(path).await.ok();
  let mut options = fs::OpenOptions::new();
  options.write(true).create_new(true);
  #[cfg(unix)]
  options.mode(if private { 0o600 } else { 0o644 });
  let mut file = options.open(path).await?;
  file.write_all(pem.as_bytes()).await?;
  file.sync_all().await
}

/// Write the root pair so that either both files appear or neither does.
///
/// The key is renamed into place first; a failed certificate rename removes
/// it again.
async fn persist_root(
  cert_path: &Path,
  cert_pem: &str,
  key_path: &Path,
  key_pem: &str,
) -> std::io::Result<()> {
  let cert_tmp = staging_path(cert_path);
  let key_tmp = staging_path(key_path);
  let written = async {
    write_pem(&cert_tmp, cert_pem, false).await?;
    write_pem(&key_tmp, key_pem, true).await?;
    fs::rename(&key_tmp, key_path).await?;
    if let Err(e) = fs::rename(&cert_tmp, cert_path).await {
      fs::remove_file(key_path).await.ok();
      return Err(e);
    }
    Ok(())
  }
  .await;
  if written.is_err() {
    fs::remove_file(&cert_tmp).await.ok();
    fs::remove_file(&key_tmp).await.ok();
  }
  written
}

/// Lowercase, drop a trailing dot and IPv6 brackets.
pub(crate) fn normalize_host(host: &str) -> String {
  let host = host.trim();
  let host = host
    .strip_prefix('[')
    .and_then(|h| h.strip_suffix(']'))
    .unwrap_or(host);
  host.trim_end_matches('.').to_ascii_lowercase()
}
