//! Root CA persistence and leaf issuance

use devrelay::ca::{staging_path, CA_CERT_FILE, CA_KEY_FILE};
use devrelay::{CertificateAuthority, Error};
use std::path::PathBuf;
use std::sync::Arc;
use x509_parser::prelude::*;

fn temp_dir(name: &str) -> PathBuf {
  let dir = std::env::temp_dir().join(format!("devrelay-ca-{}-{}", name, std::process::id()));
  if dir.exists() {
    std::fs::remove_dir_all(&dir).ok();
  }
  dir
}

#[tokio::test]
async fn test_root_created_and_reloaded() {
  let dir = temp_dir("reload");

  let first = CertificateAuthority::new(&dir).await.unwrap();
  assert!(dir.join(CA_CERT_FILE).exists(), "CA certificate file not created");
  assert!(dir.join(CA_KEY_FILE).exists(), "CA key file not created");
  assert!(first.ca_cert_pem().contains("BEGIN CERTIFICATE"));

  let second = CertificateAuthority::new(&dir).await.unwrap();
  assert_eq!(
    first.ca_cert_der().as_ref(),
    second.ca_cert_der().as_ref(),
    "reload must not regenerate the root"
  );

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_lone_certificate_is_an_error() {
  let dir = temp_dir("lone");
  CertificateAuthority::new(&dir).await.unwrap();
  std::fs::remove_file(dir.join(CA_KEY_FILE)).unwrap();

  let err = CertificateAuthority::new(&dir).await.unwrap_err();
  assert!(matches!(err, Error::CertIssuance(_)), "got {:?}", err);
  assert!(
    !dir.join(CA_KEY_FILE).exists(),
    "a missing key must not be regenerated"
  );

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_failed_key_write_leaves_no_root_behind() {
  let dir = temp_dir("partial");
  let key_staging = staging_path(&dir.join(CA_KEY_FILE));
  std::fs::create_dir_all(&key_staging).unwrap();

  let err = CertificateAuthority::new(&dir).await.unwrap_err();
  assert!(matches!(err, Error::CertIssuance(_)), "got {:?}", err);
  assert!(!dir.join(CA_CERT_FILE).exists(), "certificate written without its key");
  assert!(!dir.join(CA_KEY_FILE).exists());
  assert!(!staging_path(&dir.join(CA_CERT_FILE)).exists());

  // the next start is not blocked by leftovers
  std::fs::remove_dir(&key_staging).unwrap();
  let ca = CertificateAuthority::new(&dir).await.unwrap();
  assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));
  assert!(dir.join(CA_KEY_FILE).exists());

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_leaf_is_cached_per_host() {
  let dir = temp_dir("cache");
  let ca = CertificateAuthority::new(&dir).await.unwrap();

  let a = ca.issue_leaf("api.example.com").unwrap();
  let b = ca.issue_leaf("API.example.com.").unwrap();
  assert!(Arc::ptr_eq(&a, &b), "same host must reuse the cached leaf");
  assert_eq!(a.chain()[0].as_ref(), b.chain()[0].as_ref());

  let other = ca.issue_leaf("www.example.com").unwrap();
  assert_ne!(a.chain()[0].as_ref(), other.chain()[0].as_ref());
  assert_eq!(ca.cached_leaves(), 2);

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_leaf_names_host_and_chains_to_root() {
  let dir = temp_dir("san");
  let ca = CertificateAuthority::new(&dir).await.unwrap();
  let leaf = ca.issue_leaf("shop.example.org").unwrap();

  assert_eq!(leaf.chain().len(), 2, "expected leaf + root");
  assert_eq!(leaf.chain()[1].as_ref(), ca.ca_cert_der().as_ref());

  let (_, cert) = X509Certificate::from_der(leaf.chain()[0].as_ref()).unwrap();
  let (_, root) = X509Certificate::from_der(ca.ca_cert_der().as_ref()).unwrap();
  assert_eq!(cert.issuer(), root.subject());
  assert!(!cert.is_ca());

  let san = cert
    .subject_alternative_name()
    .unwrap()
    .expect("leaf must carry a SAN extension");
  let dns: Vec<_> = san
    .value
    .general_names
    .iter()
    .filter_map(|name| match name {
      GeneralName::DNSName(dns) => Some(*dns),
      _ => None,
    })
    .collect();
  assert_eq!(dns, vec!["shop.example.org"]);

  cert
    .verify_signature(Some(root.public_key()))
    .expect("leaf must be signed by the root");

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_ip_literal_gets_ip_san() {
  let dir = temp_dir("ip");
  let ca = CertificateAuthority::new(&dir).await.unwrap();
  let leaf = ca.issue_leaf("127.0.0.1").unwrap();

  let (_, cert) = X509Certificate::from_der(leaf.chain()[0].as_ref()).unwrap();
  let san = cert.subject_alternative_name().unwrap().unwrap();
  assert!(san
    .value
    .general_names
    .iter()
    .any(|name| matches!(name, GeneralName::IPAddress(ip) if *ip == [127, 0, 0, 1])));

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_empty_host_is_rejected() {
  let dir = temp_dir("empty");
  let ca = CertificateAuthority::new(&dir).await.unwrap();
  assert!(ca.issue_leaf("").is_err());
  assert!(ca.issue_leaf("[]").is_err());
  std::fs::remove_dir_all(&dir).ok();
}
