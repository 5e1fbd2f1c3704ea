//! `devrelay` command line entry point.

use clap::Parser;
use devrelay::{ConfigLoader, DevRelay, Overrides};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "devrelay")]
#[command(version, about = "Intercepting proxy that strips CSP/COEP/COOP and adds permissive CORS", long_about = None)]
struct Cli {
  /// Host address to bind to
  #[arg(long)]
  host: Option<String>,

  /// Port to listen on
  #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
  port: Option<u16>,

  /// Certificate directory, also holding devrelay.toml
  #[arg(long)]
  certdir: Option<PathBuf>,

  /// Configuration file (default: <certdir>/devrelay.toml)
  #[arg(long)]
  config: Option<PathBuf>,

  /// Hook to disable; repeat or separate names with commas (e.g. csp,coep)
  #[arg(long = "disable-hook", value_name = "NAME", value_delimiter = ',')]
  disable_hook: Vec<String>,

  /// Also serve HTTP/3 over UDP on the same address
  #[arg(long)]
  http3: bool,

  /// Do not verify upstream TLS certificates
  #[arg(long)]
  ssl_insecure: bool,
}

impl Cli {
  fn overrides(self) -> Overrides {
    Overrides {
      host: self.host,
      port: self.port,
      certdir: self.certdir,
      config: self.config,
      disabled_hooks: (!self.disable_hook.is_empty()).then_some(self.disable_hook),
      http3: self.http3.then_some(true),
      ssl_insecure: self.ssl_insecure.then_some(true),
    }
  }
}

#[tokio::main]
async fn main() -> ExitCode {
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "devrelay=info".into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let overrides = Cli::parse().overrides();
  match run(overrides).await {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      tracing::error!("{}", e);
      eprintln!("devrelay: {}", e);
      ExitCode::from(1)
    }
  }
}

async fn run(overrides: Overrides) -> devrelay::Result<()> {
  let loader = ConfigLoader::for_overrides(&overrides);
  let config = loader.load(&overrides)?;
  tracing::info!(path = %loader.path().display(), "configuration loaded");

  let relay = DevRelay::new(config).await?;
  let certdir = relay.config().certdir.clone();
  let ca_path = relay.certificate_authority().ca_cert_path();
  let handle = relay.listen().await?;

  println!("devrelay listening on http://{}", handle.local_addr());
  println!("certificate directory: {}", certdir.display());
  println!("trust {} to intercept HTTPS", ca_path.display());

  tokio::signal::ctrl_c().await?;
  tracing::info!("interrupt received, shutting down");
  handle.shutdown().await;
  Ok(())
}
