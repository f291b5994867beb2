//! fbhub daemon entry point.
//!
//! ```text
//! fbhub-daemon                   Run in the foreground
//! fbhub-daemon --config <path>   Load a custom config TOML
//! fbhub-daemon --socket <path>   Override the socket path
//! fbhub-daemon --gen-config      Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fbhub_daemon::config::DaemonConfig;
use fbhub_daemon::service::FramebufferDaemon;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "fbhub-daemon", about = "Framebuffer distribution daemon")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "fbhub.toml")]
    config: PathBuf,

    /// Unix socket path, overriding the config file.
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&DaemonConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let (mut config, source) = DaemonConfig::read(&cli.config);
    if let Some(socket) = cli.socket {
        config.transport.socket_path = socket;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("fbhub-daemon v{}", env!("CARGO_PKG_VERSION"));
    source.log(&cli.config);
    info!("socket: {}", config.transport.socket_path.display());
    info!("screen: {}", config.dimensions());

    let daemon = FramebufferDaemon::new(config);
    let stop = daemon.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, invalidating the service");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    daemon.run().await?;

    Ok(())
}
