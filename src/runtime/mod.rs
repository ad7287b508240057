//! Completion-queue runtime.
//!
//! Platform-specific queue implementations:
//! - Linux: io_uring for native completion-based I/O
//! - Linux and macOS: mio, emulating completions over epoll/kqueue
//!
//! Both sit behind the `CompletionQueue` trait and are driven by the same
//! single-threaded `EventLoop`.

mod context;
mod event_loop;
mod queue;

#[cfg(target_os = "linux")]
mod uring;

#[cfg(any(target_os = "linux", target_os = "macos"))]
mod mio;

use event_loop::{EventLoop, LoopStats};

use crate::config::{Backend, Config};
use crate::error::{Result, ServerError};
use crate::response;
use crate::signal::Shutdown;
use bytes::Bytes;
use std::net::TcpListener;
use std::os::unix::io::AsRawFd;
use std::time::Duration;
use tracing::info;

/// Longest a single wait blocks before the loop re-checks for shutdown.
const TICK: Duration = Duration::from_millis(100);

/// Serve the fixed response on `listener` until `shutdown` is requested.
pub fn run(config: &Config, listener: &TcpListener, shutdown: &Shutdown) -> Result<LoopStats> {
    let response = response::hello();

    info!(
        backend = ?config.backend,
        queue_depth = config.queue_depth,
        idle_timeout_ms = config.idle_timeout.map(|d| d.as_millis() as u64),
        response_bytes = response.len(),
        "Starting event loop"
    );

    match config.backend {
        Backend::Uring => run_uring(config, listener, response, shutdown),
        Backend::Mio => run_mio(config, listener, response, shutdown),
    }
}

#[cfg(target_os = "linux")]
fn run_uring(
    config: &Config,
    listener: &TcpListener,
    response: Bytes,
    shutdown: &Shutdown,
) -> Result<LoopStats> {
    let queue = uring::UringQueue::new(config.queue_depth, TICK, config.idle_timeout)
        .map_err(ServerError::QueueInit)?;
    Ok(EventLoop::new(queue, listener.as_raw_fd(), response)
        .with_drain_timeout(config.drain_timeout)
        .run(shutdown))
}

#[cfg(not(target_os = "linux"))]
fn run_uring(
    _config: &Config,
    _listener: &TcpListener,
    _response: Bytes,
    _shutdown: &Shutdown,
) -> Result<LoopStats> {
    Err(ServerError::Unsupported("io_uring"))
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn run_mio(
    config: &Config,
    listener: &TcpListener,
    response: Bytes,
    shutdown: &Shutdown,
) -> Result<LoopStats> {
    let queue = mio::MioQueue::new(
        listener,
        config.queue_depth as usize,
        TICK,
        config.idle_timeout,
    )
    .map_err(ServerError::QueueInit)?;
    Ok(EventLoop::new(queue, listener.as_raw_fd(), response)
        .with_drain_timeout(config.drain_timeout)
        .run(shutdown))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn run_mio(
    _config: &Config,
    _listener: &TcpListener,
    _response: Bytes,
    _shutdown: &Shutdown,
) -> Result<LoopStats> {
    Err(ServerError::Unsupported("mio backend"))
}
