//! Proxy assembly and lifecycle
//!
//! [`DevRelay`] owns the pieces a running proxy needs: the root CA, the hook
//! pipeline and the configuration. [`DevRelay::listen`] binds the listeners
//! and returns a [`ProxyHandle`] that stops them again.

use crate::ca::CertificateAuthority;
use crate::config::ProxyConfig;
use crate::connector::ConnectorBuilder;
use crate::errors::{Error, Result};
use crate::handler::FlowHandler;
use crate::hooks::HookPipeline;
use crate::http3;
use crate::pool::ConnectionPool;
use crate::server::{self, ConnContext};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Broadcasts a single stop signal to every long-running task.
#[derive(Debug, Clone)]
pub(crate) struct Shutdown {
  tx: broadcast::Sender<()>,
}

impl Shutdown {
  pub(crate) fn new() -> Self {
    let (tx, _) = broadcast::channel(1);
    Shutdown { tx }
  }

  pub(crate) fn subscribe(&self) -> broadcast::Receiver<()> {
    self.tx.subscribe()
  }

  pub(crate) fn trigger(&self) {
    let _ = self.tx.send(());
  }
}

/// A configured, not yet listening, proxy.
///
/// ```no_run
/// # async fn run() -> devrelay::Result<()> {
/// let relay = devrelay::DevRelay::new(devrelay::ProxyConfig::default()).await?;
/// let handle = relay.listen().await?;
/// println!("listening on {}", handle.local_addr());
/// handle.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct DevRelay {
  config: ProxyConfig,
  ca: Arc<CertificateAuthority>,
  hooks: HookPipeline,
}

impl DevRelay {
  /// Validate `config`, load or create the root CA and build the default
  /// hook pipeline without the disabled hooks.
  pub async fn new(config: ProxyConfig) -> Result<Self> {
    config.validate()?;
    let ca = Arc::new(CertificateAuthority::new(&config.certdir).await?);
    let hooks = HookPipeline::with_defaults(&config.disabled_hooks);
    tracing::info!(hooks = ?hooks.names(), "hook pipeline ready");
    Ok(DevRelay { config, ca, hooks })
  }

  /// The pipeline every flow will run through. Hooks registered here run
  /// after the default ones.
  pub fn hooks_mut(&mut self) -> &mut HookPipeline {
    &mut self.hooks
  }

  /// The root CA clients need to trust.
  pub fn certificate_authority(&self) -> Arc<CertificateAuthority> {
    self.ca.clone()
  }

  /// The configuration this proxy was built with.
  pub fn config(&self) -> &ProxyConfig {
    &self.config
  }

  /// Bind the listeners and start serving.
  pub async fn listen(self) -> Result<ProxyHandle> {
    let DevRelay { config, ca, hooks } = self;
    let listener = TcpListener::bind((config.host.as_str(), config.port))
      .await
      .map_err(|e| Error::config(format!("bind {}:{}: {}", config.host, config.port, e)))?;
    let local_addr = listener.local_addr()?;

    let connector = ConnectorBuilder::default()
      .certs_verification(!config.ssl_insecure)
      .connect_timeout(config.connect_timeout)
      .root_certificates(config.extra_roots.clone())
      .build()?;
    let pool = Arc::new(ConnectionPool::new(connector, config.idle_timeout));
    let handler = FlowHandler::new(Arc::new(hooks), pool.clone(), config.response_timeout);
    let ctx = Arc::new(ConnContext {
      ca: ca.clone(),
      handler,
      accept_timeout: config.accept_timeout,
    });

    let shutdown = Shutdown::new();
    let mut tasks = vec![
      tokio::spawn(server::run(listener, ctx.clone(), shutdown.subscribe())),
      tokio::spawn(reap_idle(pool, shutdown.subscribe())),
    ];
    if config.http3 {
      let endpoint = http3::bind(local_addr, ca)?;
      tasks.push(tokio::spawn(http3::run(endpoint, ctx, shutdown.subscribe())));
    }
    if config.ssl_insecure {
      tracing::warn!("upstream certificate verification is disabled");
    }
    tracing::info!(addr = %local_addr, http3 = config.http3, "proxy listening");

    Ok(ProxyHandle {
      local_addr,
      shutdown,
      tasks,
    })
  }
}

async fn reap_idle(pool: Arc<ConnectionPool>, mut shutdown: broadcast::Receiver<()>) {
  let period = (pool.idle_timeout() / 2).max(Duration::from_secs(1));
  let mut interval = tokio::time::interval(period);
  loop {
    tokio::select! {
      _ = shutdown.recv() => break,
      _ = interval.tick() => {
        pool.evict_idle();
      }
    }
  }
}

/// A running proxy.
#[derive(Debug)]
pub struct ProxyHandle {
  local_addr: SocketAddr,
  shutdown: Shutdown,
  tasks: Vec<JoinHandle<()>>,
}

impl ProxyHandle {
  /// Address the TCP listener is bound to. With port `0` this holds the
  /// port the OS picked.
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Stop accepting connections and wait for the listeners to exit.
  ///
  /// Connections already accepted finish on their own.
  pub async fn shutdown(self) {
    self.shutdown.trigger();
    for task in self.tasks {
      let _ = task.await;
    }
    tracing::info!(addr = %self.local_addr, "proxy stopped");
  }
}
