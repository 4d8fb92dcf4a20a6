//! Socket construction and the non-blocking/keepalive policy
//!
//! Every socket the proxy owns is non-blocking, and every TCP socket has
//! SO_KEEPALIVE enabled so connections to dead peers eventually time out.
//! On Apple platforms SO_NOSIGPIPE is set per socket as well; the
//! process-wide SIGPIPE ignore in [`ignore_sigpipe`] covers the rest.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};

use nix::sys::signal::{signal, SigHandler, Signal};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::debug;

/// Listen backlog for the proxy socket.
pub const LISTEN_BACKLOG: i32 = 5;

/// Apply the per-socket policy: non-blocking, SO_KEEPALIVE, and
/// SO_NOSIGPIPE where the platform has it.
///
/// # Errors
///
/// Returns the underlying `io::Error` if any option cannot be set.
pub fn apply_socket_policy(sock: SockRef<'_>) -> io::Result<()> {
    sock.set_nonblocking(true)?;
    sock.set_keepalive(true)?;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    sock.set_nosigpipe(true)?;
    Ok(())
}

/// Build the IPv4 listening socket: SO_REUSEADDR, bound to all local
/// addresses on `port`, socket policy applied, backlog 5.
///
/// # Errors
///
/// Returns the underlying `io::Error` on socket, bind, or listen failure.
pub fn bind_listener(port: u16) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    apply_socket_policy(SockRef::from(&socket))?;
    socket.listen(LISTEN_BACKLOG)?;

    debug!("listener bound to {addr}");
    Ok(socket.into())
}

/// Open a target socket of the right family and begin a non-blocking
/// connect. EINPROGRESS means the connect proceeds asynchronously; its
/// completion is observed as write readiness on the returned stream.
///
/// # Errors
///
/// Returns the underlying `io::Error` on socket creation failure or an
/// immediately failing connect.
pub fn begin_connect(target: SocketAddr) -> io::Result<TcpStream> {
    let socket = Socket::new(
        Domain::for_address(target),
        Type::STREAM,
        Some(Protocol::TCP),
    )?;
    apply_socket_policy(SockRef::from(&socket))?;

    match socket.connect(&target.into()) {
        Ok(()) => {}
        Err(ref e) if connect_in_progress(e) => {}
        Err(e) => return Err(e),
    }
    Ok(socket.into())
}

fn connect_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS)
        || err.kind() == io::ErrorKind::WouldBlock
        || err.kind() == io::ErrorKind::Interrupted
}

/// Ignore SIGPIPE process-wide so a write to a half-closed socket surfaces
/// as EPIPE instead of killing the process. One-shot process initialisation.
pub fn ignore_sigpipe() {
    // Safety: SIG_IGN carries no handler code, so there are no reentrancy
    // concerns; this runs once before the event loop starts.
    if let Err(e) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
        debug!("failed to ignore SIGPIPE: {e}");
    }
}
