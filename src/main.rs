//! hello-ring: a minimal completion-queue HTTP responder
//!
//! Every connection gets the same fixed HTTP/1.1 200 response and is then
//! closed. All I/O runs on one thread driven by a kernel completion queue:
//! - io_uring on Linux
//! - mio readiness polling with emulated completions elsewhere
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod error;
mod response;
mod runtime;
mod signal;
mod socket;

use config::Config;
use signal::Shutdown;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        backend = ?config.backend,
        queue_depth = config.queue_depth,
        backlog = config.backlog,
        "Starting hello-ring server"
    );

    let shutdown = Shutdown::install_signal_handlers().map_err(error::ServerError::Io)?;
    let listener = socket::listening_socket(config.addr()?, config.backlog)
        .map_err(error::ServerError::from)?;

    info!(addr = %listener.local_addr()?, "Listening");

    let stats = runtime::run(&config, &listener, &shutdown)?;

    info!(
        accepted = stats.accepted,
        responses = stats.responses,
        partial_writes = stats.partial_writes,
        queue_full = stats.queue_full,
        leaked = stats.leaked_contexts,
        "Server stopped"
    );

    Ok(())
}
