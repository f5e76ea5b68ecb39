//! tcp-echo-server: a TCP echo service
//!
//! Every byte a client sends is written back on the same connection.
//!
//! Features:
//! - Unframed byte-stream echo with partial-write handling
//! - Optional `alive\n` announcement on every connection
//! - Graceful shutdown of the listener and all connections on Ctrl-C
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocols;
mod server;

use config::{Config, ConfigError, MAX_VERBOSITY};
use server::Server;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(ConfigError::Args(e)) => {
            let _ = e.print();
            // --help and --version are not failures
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config);

    if config.verbosity > MAX_VERBOSITY {
        warn!(
            verbosity = config.verbosity,
            "got invalid verbosity count. using max (trace level)"
        );
    }

    info!(
        listen = %config.listen_addr(),
        announce_alive = config.announce_alive,
        announce_interval_secs = config.announce_interval.as_secs(),
        read_deadline_ms = config.read_deadline.as_millis() as u64,
        buffer_size = config.buffer_size,
        "Starting tcp-echo-server"
    );

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_interrupt(cancel.clone()));

    match Server::new(config).run(cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server exited with error");
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging. `-q` disables output even when `RUST_LOG` is set.
fn init_logging(config: &Config) {
    let filter = if config.log_level == "off" {
        EnvFilter::new("off")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Trigger cancellation on the first Ctrl-C. Shutdown itself is left to
/// the server so the process exits only after it has drained.
async fn cancel_on_interrupt(cancel: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("interrupt received. exiting.");
            cancel.cancel();
        }
        Err(e) => error!(error = %e, "failed to listen for interrupt"),
    }
}
