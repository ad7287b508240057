//! Listening socket bootstrap.

use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener};

/// Why the listening socket could not be set up.
#[derive(Debug)]
pub enum BootstrapError {
    /// Creating or configuring the socket failed.
    Socket(io::Error),
    /// The address could not be claimed.
    Bind(SocketAddr, io::Error),
    /// The socket refused to enter the listening state.
    Listen(SocketAddr, io::Error),
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapError::Socket(e) => write!(f, "Failed to create socket: {}", e),
            BootstrapError::Bind(addr, e) => write!(f, "Failed to bind {}: {}", addr, e),
            BootstrapError::Listen(addr, e) => write!(f, "Failed to listen on {}: {}", addr, e),
        }
    }
}

impl std::error::Error for BootstrapError {}

/// Create a TCP listener bound to `addr`.
///
/// `SO_REUSEADDR` is set so the server can be restarted immediately. The
/// socket is left non-blocking: the io_uring backend does not care, and the
/// mio backend requires it.
pub fn listening_socket(addr: SocketAddr, backlog: i32) -> Result<TcpListener, BootstrapError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(BootstrapError::Socket)?;

    socket
        .set_reuse_address(true)
        .map_err(BootstrapError::Socket)?;
    socket.set_nonblocking(true).map_err(BootstrapError::Socket)?;

    socket
        .bind(&addr.into())
        .map_err(|e| BootstrapError::Bind(addr, e))?;
    socket
        .listen(backlog)
        .map_err(|e| BootstrapError::Listen(addr, e))?;

    Ok(socket.into())
}
