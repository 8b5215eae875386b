use std::fs;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use crossbeam_channel::Sender;
use mio::net::TcpListener;
use mio::{Events, PollOpt, Ready, Token};
use slog::{debug, error, warn, Logger};
use socket2::{Domain, Protocol, Socket, Type};

use super::sub_reactor::{Intake, SubReactor};
use crate::iomux::IoMux;

const LISTENER: Token = Token(0);

// Linux stores the backlog in a u16; larger somaxconn values would wrap.
const MAX_BACKLOG: usize = 65535;

/// Build the listening socket by hand: close-on-exec, non-blocking,
/// address-reusable, bound and listening with the kernel's somaxconn as the
/// backlog cap.
pub(crate) fn listen(addr: &str) -> io::Result<TcpListener> {
    let addr: SocketAddr = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unresolvable listen address"))?;

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_cloexec(true)?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(max_backlog() as i32)?;

    TcpListener::from_std(socket.into())
}

/// The kernel's accept-queue cap, truncated to what the backlog field can
/// hold. Falls back to the historical default when /proc is unreadable.
fn max_backlog() -> usize {
    let backlog = fs::read_to_string("/proc/sys/net/core/somaxconn")
        .ok()
        .and_then(|contents| {
            contents
                .split_whitespace()
                .next()
                .and_then(|field| field.parse::<usize>().ok())
        })
        .filter(|&value| value > 0)
        .unwrap_or(128);

    backlog.min(MAX_BACKLOG)
}

/// The accept loop. Each accepted fd goes to the subReactor currently
/// tracking the fewest fds; the load reads are deliberately unsynchronized
/// (exact balance is not required) and ties resolve to the lowest index.
pub(crate) fn run(
    listener: TcpListener,
    subs: Vec<(Arc<SubReactor>, Sender<Intake>)>,
    log: Logger,
) {
    let iomux = match IoMux::new() {
        Ok(iomux) => iomux,
        Err(err) => {
            error!(log, "main reactor multiplexer failed"; "error" => %err);
            return;
        }
    };
    if let Err(err) = iomux.add(&listener, LISTENER, Ready::readable(), PollOpt::level()) {
        error!(log, "main reactor listener registration failed"; "error" => %err);
        return;
    }

    let mut events = Events::with_capacity(8);

    loop {
        if let Err(err) = iomux.wait(&mut events) {
            error!(log, "main reactor terminating"; "error" => %err);
            return;
        }

        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(log, "accepted connection"; "peer" => %peer);

                    let mut min = 0;
                    for index in 1..subs.len() {
                        if subs[index].0.load() < subs[min].0.load() {
                            min = index;
                        }
                    }

                    subs[min].0.bump_load();
                    if subs[min].1.send(Intake::Conn(stream)).is_err() {
                        // The subReactor is gone; the stream closes on drop.
                        warn!(log, "sub reactor unavailable, dropping connection");
                        return;
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(log, "accept failed"; "error" => %err);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backlog_respects_the_u16_cap() {
        assert!(max_backlog() <= MAX_BACKLOG);
        assert!(max_backlog() > 0);
    }

    #[test]
    fn listener_binds_ephemeral_ports() {
        let listener = listen("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }
}
