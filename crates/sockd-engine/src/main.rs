/// sockd – main entry point.
///
/// A SOCKS4/4A proxy server: accepts client connections, applies the rule
/// firewall from `socks.conf`, and relays traffic for CONNECT and BIND
/// requests. Each session runs in its own task so no failure can reach a
/// concurrent session.

use anyhow::Result;
use clap::error::ErrorKind;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use sockd_core::audit::Audit;
use sockd_core::config::Settings;
use sockd_core::session::{Session, SessionError};
use sockd_core::stats::GlobalStats;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "sockd", about = "SOCKS4/4A proxy server with a rule firewall")]
struct Cli {
    /// TCP port to listen on
    #[arg(value_name = "PORT")]
    port: u16,

    /// Address to bind the listener to
    #[arg(long, default_value = "0.0.0.0")]
    listen_host: String,

    /// Firewall rule file, re-read for every session
    #[arg(long, default_value = "./socks.conf")]
    firewall: PathBuf,

    /// Append per-session JSON records to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Seconds allowed for the request and resolve phases
    #[arg(long, default_value_t = 30)]
    handshake_timeout: u64,

    /// Seconds allowed for the outbound connect
    #[arg(long, default_value_t = 30)]
    connect_timeout: u64,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = err.print();
            return Ok(());
        }
        Err(err) => {
            let _ = err.print();
            std::process::exit(1);
        }
    };

    // Diagnostics go to stderr; stdout carries the per-session audit blocks.
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = Arc::new(Settings {
        listen_host: cli.listen_host,
        listen_port: cli.port,
        firewall_path: cli.firewall,
        log_path: cli.log_file,
        handshake_timeout_secs: cli.handshake_timeout,
        connect_timeout_secs: cli.connect_timeout,
    });

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(run_server(settings))
}

// ---------------------------------------------------------------------------
// Accept loop
// ---------------------------------------------------------------------------

async fn run_server(settings: Arc<Settings>) -> Result<()> {
    let listener = TcpListener::bind((settings.listen_host.as_str(), settings.listen_port)).await?;
    info!("sockd listening on {}", listener.local_addr()?);

    let stats = GlobalStats::new();
    let audit = Arc::new(Audit::new(settings.log_path.as_deref())?);

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let session = Session::new(
                    stream,
                    peer,
                    settings.clone(),
                    stats.clone(),
                    audit.clone(),
                );
                tokio::spawn(async move {
                    if let Err(err) = session.run().await {
                        match err {
                            SessionError::Decode(_)
                            | SessionError::Request(_)
                            | SessionError::Rejected
                            | SessionError::PeerMismatch { .. } => {
                                debug!("session from {} closed: {}", peer, err);
                            }
                            _ => warn!("session from {} failed: {}", peer, err),
                        }
                    }
                });
            }
            Err(e) => {
                error!("accept error: {}", e);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
