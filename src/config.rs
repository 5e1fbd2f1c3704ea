//! Proxy configuration
//!
//! Settings come from three layers: built-in defaults, a TOML file under the
//! certificate directory, and command-line overrides. Later layers win.
//! The file is created on first run and any keys it lacks are filled in with
//! defaults and written back, so it always documents every setting.

use crate::errors::{Error, Result};
use crate::hooks::DEFAULT_HOOK_NAMES;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_rustls::rustls::pki_types::CertificateDer;

/// File name of the configuration file inside the certificate directory.
pub const CONFIG_FILE: &str = "devrelay.toml";

/// Resolved settings for one proxy instance.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
  /// Address to bind
  pub host: String,
  /// Port to bind; files and the command line accept `1..=65535`
  pub port: u16,
  /// Where the root CA lives
  pub certdir: PathBuf,
  /// Hooks to leave out of the default pipeline
  pub disabled_hooks: Vec<String>,
  /// Also listen for HTTP/3 on UDP
  pub http3: bool,
  /// Accept any upstream certificate
  pub ssl_insecure: bool,
  /// Wait for a client's first request, TLS handshake included
  pub accept_timeout: Duration,
  /// Upstream TCP connect plus TLS handshake
  pub connect_timeout: Duration,
  /// Upstream response head and body
  pub response_timeout: Duration,
  /// How long a pooled connection may sit unused
  pub idle_timeout: Duration,
  /// Roots trusted for upstream TLS on top of the platform store
  pub extra_roots: Vec<CertificateDer<'static>>,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    ProxyConfig {
      host: "127.0.0.1".to_string(),
      port: 8080,
      certdir: default_certdir(),
      disabled_hooks: Vec::new(),
      http3: false,
      ssl_insecure: false,
      accept_timeout: Duration::from_secs(30),
      connect_timeout: Duration::from_secs(10),
      response_timeout: Duration::from_secs(60),
      idle_timeout: Duration::from_secs(90),
      extra_roots: Vec::new(),
    }
  }
}

impl ProxyConfig {
  /// Check values that can be set programmatically without going through the
  /// loader. Port `0` is allowed here and binds an ephemeral port.
  pub fn validate(&self) -> Result<()> {
    if self.host.trim().is_empty() {
      return Err(Error::config("host: must not be empty"));
    }
    validate_hook_names(&self.disabled_hooks)?;
    for (key, value) in [
      ("accept_timeout_secs", self.accept_timeout),
      ("connect_timeout_secs", self.connect_timeout),
      ("response_timeout_secs", self.response_timeout),
      ("idle_timeout_secs", self.idle_timeout),
    ] {
      if value.is_zero() {
        return Err(Error::config(format!("{}: must be greater than zero", key)));
      }
    }
    Ok(())
  }

  /// Path of the configuration file for this certificate directory.
  pub fn config_path(&self) -> PathBuf {
    self.certdir.join(CONFIG_FILE)
  }
}

/// `~/.devrelay`, or `.devrelay` when no home directory is known.
pub fn default_certdir() -> PathBuf {
  directories::BaseDirs::new()
    .map(|dirs| dirs.home_dir().join(".devrelay"))
    .unwrap_or_else(|| PathBuf::from(".devrelay"))
}

fn expand_home(path: PathBuf) -> PathBuf {
  let Ok(rest) = path.strip_prefix("~") else {
    return path;
  };
  match directories::BaseDirs::new() {
    Some(dirs) => dirs.home_dir().join(rest),
    None => path,
  }
}

/// Hook names from the file: a TOML array or one comma separated string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HookList {
  /// `["csp", "coep"]`
  List(Vec<String>),
  /// `"csp,coep"`
  Csv(String),
}

impl HookList {
  /// Flatten to individual names, splitting on commas.
  pub fn names(&self) -> Vec<String> {
    let raw: Vec<&str> = match self {
      HookList::List(list) => list.iter().map(String::as_str).collect(),
      HookList::Csv(csv) => vec![csv.as_str()],
    };
    split_names(raw)
  }
}

fn split_names<'a>(raw: impl IntoIterator<Item = &'a str>) -> Vec<String> {
  raw
    .into_iter()
    .flat_map(|entry| entry.split(','))
    .map(str::trim)
    .filter(|name| !name.is_empty())
    .map(str::to_string)
    .collect()
}

/// Lowercase hook names and reject any the default pipeline does not have.
pub fn validate_hook_names<S: AsRef<str>>(names: &[S]) -> Result<Vec<String>> {
  let mut out = Vec::with_capacity(names.len());
  for name in names {
    let name = name.as_ref().trim().to_ascii_lowercase();
    if !DEFAULT_HOOK_NAMES.contains(&name.as_str()) {
      return Err(Error::config(format!(
        "disabled_hooks: unknown hook {:?}, expected one of {}",
        name,
        DEFAULT_HOOK_NAMES.join(", ")
      )));
    }
    if !out.contains(&name) {
      out.push(name);
    }
  }
  Ok(out)
}

/// On-disk form of the configuration. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
  /// Address to bind
  #[serde(skip_serializing_if = "Option::is_none")]
  pub host: Option<String>,
  /// Port to bind; wide enough to report out-of-range values
  #[serde(skip_serializing_if = "Option::is_none")]
  pub port: Option<i64>,
  /// Certificate directory
  #[serde(skip_serializing_if = "Option::is_none")]
  pub certdir: Option<PathBuf>,
  /// Hooks to disable
  #[serde(skip_serializing_if = "Option::is_none")]
  pub disabled_hooks: Option<HookList>,
  /// Enable HTTP/3
  #[serde(skip_serializing_if = "Option::is_none")]
  pub http3: Option<bool>,
  /// Skip upstream certificate verification
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ssl_insecure: Option<bool>,
  /// Seconds
  #[serde(skip_serializing_if = "Option::is_none")]
  pub accept_timeout_secs: Option<u64>,
  /// Seconds
  #[serde(skip_serializing_if = "Option::is_none")]
  pub connect_timeout_secs: Option<u64>,
  /// Seconds
  #[serde(skip_serializing_if = "Option::is_none")]
  pub response_timeout_secs: Option<u64>,
  /// Seconds
  #[serde(skip_serializing_if = "Option::is_none")]
  pub idle_timeout_secs: Option<u64>,
}

impl FileConfig {
  /// Every key set to its default.
  pub fn defaults() -> Self {
    let d = ProxyConfig::default();
    FileConfig {
      host: Some(d.host),
      port: Some(i64::from(d.port)),
      certdir: Some(d.certdir),
      disabled_hooks: Some(HookList::List(Vec::new())),
      http3: Some(d.http3),
      ssl_insecure: Some(d.ssl_insecure),
      accept_timeout_secs: Some(d.accept_timeout.as_secs()),
      connect_timeout_secs: Some(d.connect_timeout.as_secs()),
      response_timeout_secs: Some(d.response_timeout.as_secs()),
      idle_timeout_secs: Some(d.idle_timeout.as_secs()),
    }
  }

  fn fill_missing(self, defaults: FileConfig) -> Self {
    FileConfig {
      host: self.host.or(defaults.host),
      port: self.port.or(defaults.port),
      certdir: self.certdir.or(defaults.certdir),
      disabled_hooks: self.disabled_hooks.or(defaults.disabled_hooks),
      http3: self.http3.or(defaults.http3),
      ssl_insecure: self.ssl_insecure.or(defaults.ssl_insecure),
      accept_timeout_secs: self.accept_timeout_secs.or(defaults.accept_timeout_secs),
      connect_timeout_secs: self.connect_timeout_secs.or(defaults.connect_timeout_secs),
      response_timeout_secs: self.response_timeout_secs.or(defaults.response_timeout_secs),
      idle_timeout_secs: self.idle_timeout_secs.or(defaults.idle_timeout_secs),
    }
  }
}

/// Values given on the command line. `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct Overrides {
  /// `--host`
  pub host: Option<String>,
  /// `--port`
  pub port: Option<u16>,
  /// `--certdir`
  pub certdir: Option<PathBuf>,
  /// `--config`
  pub config: Option<PathBuf>,
  /// `--disable-hook`, possibly repeated or comma separated
  pub disabled_hooks: Option<Vec<String>>,
  /// `--http3`
  pub http3: Option<bool>,
  /// `--ssl-insecure`
  pub ssl_insecure: Option<bool>,
}

/// Reads, completes and merges the configuration file.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
  path: PathBuf,
}

impl ConfigLoader {
  /// Use the file at `path`.
  pub fn new(path: impl Into<PathBuf>) -> Self {
    ConfigLoader { path: path.into() }
  }

  /// `--config` when given, otherwise `devrelay.toml` in the certificate
  /// directory named on the command line or the default one.
  pub fn for_overrides(overrides: &Overrides) -> Self {
    let path = match &overrides.config {
      Some(path) => path.clone(),
      None => overrides
        .certdir
        .clone()
        .unwrap_or_else(default_certdir)
        .join(CONFIG_FILE),
    };
    ConfigLoader::new(path)
  }

  /// The file this loader reads and writes.
  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Read the file, creating it or filling in missing keys as needed.
  pub fn load_file(&self) -> Result<FileConfig> {
    let defaults = FileConfig::defaults();
    if !self.path.exists() {
      self.write(&defaults)?;
      tracing::info!(path = %self.path.display(), "wrote default configuration");
      return Ok(defaults);
    }
    let text = std::fs::read_to_string(&self.path)
      .map_err(|e| Error::config(format!("{}: {}", self.path.display(), e)))?;
    let file: FileConfig = toml::from_str(&text)
      .map_err(|e| Error::config(format!("{}: {}", self.path.display(), e)))?;
    let complete = file.clone().fill_missing(defaults);
    if complete != file {
      self.write(&complete)?;
      tracing::info!(path = %self.path.display(), "added missing keys to configuration");
    }
    Ok(complete)
  }

  /// Load the file and merge it with `overrides` and the defaults.
  pub fn load(&self, overrides: &Overrides) -> Result<ProxyConfig> {
    let file = self.load_file()?;
    resolve(&file, overrides)
  }

  fn write(&self, file: &FileConfig) -> Result<()> {
    if let Some(parent) = self.path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| Error::config(format!("{}: {}", parent.display(), e)))?;
    }
    let text = toml::to_string_pretty(file)
      .map_err(|e| Error::config(format!("serialize configuration: {}", e)))?;
    std::fs::write(&self.path, text)
      .map_err(|e| Error::config(format!("{}: {}", self.path.display(), e)))
  }
}

/// Merge command line over file over defaults.
pub fn resolve(file: &FileConfig, cli: &Overrides) -> Result<ProxyConfig> {
  let defaults = ProxyConfig::default();

  let port = match cli.port {
    Some(port) => i64::from(port),
    None => file.port.unwrap_or(i64::from(defaults.port)),
  };
  let port = u16::try_from(port)
    .ok()
    .filter(|p| *p != 0)
    .ok_or_else(|| Error::config(format!("port: {} is outside 1..=65535", port)))?;

  let disabled = match &cli.disabled_hooks {
    Some(names) => split_names(names.iter().map(String::as_str)),
    None => file
      .disabled_hooks
      .as_ref()
      .map(HookList::names)
      .unwrap_or_default(),
  };

  let timeout = |key: &str, value: Option<u64>, default: Duration| -> Result<Duration> {
    match value {
      Some(0) => Err(Error::config(format!("{}: must be greater than zero", key))),
      Some(secs) => Ok(Duration::from_secs(secs)),
      None => Ok(default),
    }
  };

  let config = ProxyConfig {
    host: cli
      .host
      .clone()
      .or_else(|| file.host.clone())
      .unwrap_or(defaults.host),
    port,
    certdir: cli
      .certdir
      .clone()
      .or_else(|| file.certdir.clone())
      .map(expand_home)
      .unwrap_or(defaults.certdir),
    disabled_hooks: validate_hook_names(&disabled)?,
    http3: cli.http3.or(file.http3).unwrap_or(defaults.http3),
    ssl_insecure: cli
      .ssl_insecure
      .or(file.ssl_insecure)
      .unwrap_or(defaults.ssl_insecure),
    accept_timeout: timeout(
      "accept_timeout_secs",
      file.accept_timeout_secs,
      defaults.accept_timeout,
    )?,
    connect_timeout: timeout(
      "connect_timeout_secs",
      file.connect_timeout_secs,
      defaults.connect_timeout,
    )?,
    response_timeout: timeout(
      "response_timeout_secs",
      file.response_timeout_secs,
      defaults.response_timeout,
    )?,
    idle_timeout: timeout(
      "idle_timeout_secs",
      file.idle_timeout_secs,
      defaults.idle_timeout,
    )?,
    extra_roots: Vec::new(),
  };
  config.validate()?;
  Ok(config)
}
