//! TCP accept loop.
//!
//! Single-threaded-cooperative at the session level: one client is
//! served at a time, then the loop goes back to `accept`. SIGINT flips a
//! lock-free `Running` flag; the loop notices it either between sessions
//! or when `accept` fails because the listener was interrupted.

use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{AllKorrectError, Result};
use crate::fs::Namespace;
use crate::session;

const BACKLOG: i32 = 5;
const SESSION_IO_TIMEOUT: Duration = Duration::from_secs(5);

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_signo: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

/// Installs the SIGINT handler. Auto-resets to the default disposition
/// after first delivery (`SA_RESETHAND`).
pub fn install_signal_handler() -> Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    let action = SigAction::new(
        SigHandler::Handler(handle_sigint),
        SaFlags::SA_RESETHAND,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGINT, &action) }
        .map_err(|e| AllKorrectError::FatalConfig(format!("cannot register SIGINT handler: {e}")))?;
    log::info!("registered SIGINT handler");
    Ok(())
}

/// Binds `port` and serves clients one at a time until SIGINT.
///
/// Accepts through raw `libc::accept` rather than
/// `TcpListener::accept` — the standard library retries a blocking
/// `accept` internally on `EINTR`, so a `SIGINT` delivered while this
/// loop is parked in `accept` would otherwise never surface and the
/// loop would never get a chance to recheck `RUNNING`.
pub fn run(port: u16, namespace: Namespace) -> Result<()> {
    log::info!("starting up daemon");
    let listener = bind_listener(port)?;
    log::info!("listening on port {port}");
    let listener_fd = listener.as_raw_fd();

    while RUNNING.load(Ordering::SeqCst) {
        log::info!("waiting for the next client");
        let fd = unsafe { libc::accept(listener_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if fd < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            if !RUNNING.load(Ordering::SeqCst) {
                break;
            }
            log::error!("accept failure: {err}");
            continue;
        }

        let stream = unsafe { TcpStream::from_raw_fd(fd) };
        let addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        log::info!("client connected from {addr}");
        if let Err(e) = serve_one(stream, &namespace) {
            log::error!("{e}");
        }
    }

    log::info!("server socket closed");
    Ok(())
}

/// Hand-rolled socket/bind/listen so the listen backlog is pinned at
/// [`BACKLOG`] — `std::net::TcpListener::bind` leaves the backlog to the
/// platform default, which the protocol's concurrency model does not
/// want to depend on.
fn bind_listener(port: u16) -> Result<TcpListener> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(AllKorrectError::FatalConfig(format!(
                "cannot create server socket: {}",
                std::io::Error::last_os_error()
            )));
        }

        let reuse: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &reuse as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );

        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();
        addr.sin_port = port.to_be();

        let bind_ret = libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        if bind_ret < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(AllKorrectError::FatalConfig(format!(
                "cannot bind port {port}: {err}"
            )));
        }

        if libc::listen(fd, BACKLOG) < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(AllKorrectError::FatalConfig(format!(
                "cannot listen: {err}"
            )));
        }

        Ok(TcpListener::from_raw_fd(fd))
    }
}

fn serve_one(mut stream: TcpStream, namespace: &Namespace) -> Result<()> {
    stream
        .set_read_timeout(Some(SESSION_IO_TIMEOUT))
        .map_err(|e| AllKorrectError::TransportFault(format!("cannot set read timeout: {e}")))?;
    stream
        .set_write_timeout(Some(SESSION_IO_TIMEOUT))
        .map_err(|e| AllKorrectError::TransportFault(format!("cannot set write timeout: {e}")))?;

    let result = session::run(&mut stream, namespace);
    log::info!("client socket closed");
    result
}
