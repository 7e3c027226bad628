//! Client communication.
//!
//! One nonblocking UDP socket carries the primary traffic; an optional TCP
//! listener accepts framed connections for clients behind lossy links. Both
//! feed the same dispatcher. The event loop multiplexes everything through a
//! single readiness source and drives the server's periodic tick from the
//! wait timeout.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::unix::io::{AsRawFd, BorrowedFd, RawFd};
use std::time::Instant;

use log::{debug, info, warn};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use crate::ll::tnfs_abi::{
    CONN_TIMEOUT, MAX_TCP_CONN, MAXMSGSZ, TCP_KA_COUNT, TCP_KA_IDLE, TCP_KA_INTVL, TICK_INTERVAL,
};
use crate::server::Tnfsd;

/// Readiness events a source can report for a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub(crate) readable: bool,
    pub(crate) hangup: bool,
}

/// The OS readiness demultiplexer, reduced to what the event loop needs.
/// Registration is per wait: callers re-register their live descriptors
/// before each wait, which keeps the source stateless across iterations.
pub(crate) trait ReadinessSource {
    fn register(&mut self, fd: RawFd);
    fn wait(&mut self, timeout: std::time::Duration) -> io::Result<Vec<(RawFd, Readiness)>>;
}

/// `poll(2)`-backed readiness source.
#[derive(Debug, Default)]
pub(crate) struct PollReadiness {
    fds: Vec<RawFd>,
}

impl ReadinessSource for PollReadiness {
    fn register(&mut self, fd: RawFd) {
        self.fds.push(fd);
    }

    fn wait(&mut self, timeout: std::time::Duration) -> io::Result<Vec<(RawFd, Readiness)>> {
        // The descriptors stay open for the whole wait: they are owned by
        // the transport that registered them this iteration.
        let mut poll_fds: Vec<PollFd<'_>> = self
            .fds
            .iter()
            .map(|&fd| PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, PollFlags::POLLIN))
            .collect();
        let timeout = PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX);
        match poll(&mut poll_fds, timeout) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => {
                self.fds.clear();
                return Ok(Vec::new());
            }
            Err(errno) => {
                self.fds.clear();
                return Err(io::Error::from_raw_os_error(errno as i32));
            }
        }
        let mut ready = Vec::new();
        for (&fd, poll_fd) in self.fds.iter().zip(&poll_fds) {
            let revents = poll_fd.revents().unwrap_or(PollFlags::empty());
            if !revents.is_empty() {
                ready.push((
                    fd,
                    Readiness {
                        readable: revents.contains(PollFlags::POLLIN),
                        hangup: revents
                            .intersects(PollFlags::POLLHUP | PollFlags::POLLERR),
                    },
                ));
            }
        }
        self.fds.clear();
        Ok(ready)
    }
}

/// One accepted TCP connection.
#[derive(Debug)]
struct TcpConn {
    stream: TcpStream,
    peer: SocketAddr,
    last_active: Instant,
}

/// The daemon's sockets and event loop.
#[derive(Debug)]
pub struct Transport {
    udp: UdpSocket,
    listener: Option<TcpListener>,
    conns: Vec<TcpConn>,
}

impl Transport {
    /// Bind the UDP socket (and the TCP listener unless disabled) on `port`.
    pub fn bind(port: u16, with_tcp: bool) -> io::Result<Transport> {
        let udp = UdpSocket::bind(("0.0.0.0", port))?;
        udp.set_nonblocking(true)?;
        let listener = if with_tcp {
            let listener = TcpListener::bind(("0.0.0.0", port))?;
            listener.set_nonblocking(true)?;
            Some(listener)
        } else {
            None
        };
        info!(
            "listening on port {port} (udp{})",
            if with_tcp { "+tcp" } else { "" }
        );
        Ok(Transport {
            udp,
            listener,
            conns: Vec::new(),
        })
    }

    /// Run the event loop forever: wait for readiness, drain each ready
    /// socket to completion, tick the server once per wakeup.
    pub fn run(&mut self, server: &mut Tnfsd) -> io::Result<()> {
        let mut source = PollReadiness::default();
        self.run_with(server, &mut source)
    }

    fn run_with(
        &mut self,
        server: &mut Tnfsd,
        source: &mut dyn ReadinessSource,
    ) -> io::Result<()> {
        loop {
            source.register(self.udp.as_raw_fd());
            if let Some(listener) = &self.listener {
                source.register(listener.as_raw_fd());
            }
            for conn in &self.conns {
                source.register(conn.stream.as_raw_fd());
            }

            let ready = source.wait(TICK_INTERVAL)?;
            let now = Instant::now();

            for (fd, readiness) in ready {
                if fd == self.udp.as_raw_fd() {
                    self.drain_udp(server, now);
                } else if self
                    .listener
                    .as_ref()
                    .is_some_and(|l| l.as_raw_fd() == fd)
                {
                    self.accept_pending(now);
                } else {
                    self.service_conn(server, fd, readiness, now);
                }
            }

            self.sweep_conns(server, now);
            server.tick(now);
        }
    }

    fn drain_udp(&mut self, server: &mut Tnfsd, now: Instant) {
        let mut buf = [0u8; MAXMSGSZ];
        loop {
            match self.udp.recv_from(&mut buf) {
                Ok((len, src)) => {
                    if let Some(reply) = server.handle_message(src, None, &buf[..len], now) {
                        if let Err(err) = self.udp.send_to(&reply, src) {
                            // The client will retry with the same seq.
                            warn!("udp send to {src} failed: {err}");
                        }
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("udp receive failed: {err}");
                    break;
                }
            }
        }
    }

    fn accept_pending(&mut self, now: Instant) {
        let Some(listener) = &self.listener else {
            return;
        };
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if self.conns.len() >= MAX_TCP_CONN {
                        warn!("refusing connection from {peer}: connection table full");
                        continue;
                    }
                    if let Err(err) = configure_stream(&stream) {
                        warn!("dropping connection from {peer}: {err}");
                        continue;
                    }
                    debug!("accepted tcp connection from {peer}");
                    self.conns.push(TcpConn {
                        stream,
                        peer,
                        last_active: now,
                    });
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("accept failed: {err}");
                    break;
                }
            }
        }
    }

    fn service_conn(
        &mut self,
        server: &mut Tnfsd,
        fd: RawFd,
        readiness: Readiness,
        now: Instant,
    ) {
        let Some(idx) = self
            .conns
            .iter()
            .position(|c| c.stream.as_raw_fd() == fd)
        else {
            return;
        };
        if readiness.hangup {
            self.drop_conn(server, idx, "peer hung up");
            return;
        }
        if !readiness.readable {
            return;
        }

        // One read is one message: the protocol keeps each request inside a
        // datagram-sized frame on TCP as well.
        let mut buf = [0u8; MAXMSGSZ];
        let conn = &mut self.conns[idx];
        match conn.stream.read(&mut buf) {
            Ok(0) => self.drop_conn(server, idx, "closed"),
            Ok(len) => {
                conn.last_active = now;
                let peer = conn.peer;
                if let Some(reply) = server.handle_message(peer, Some(fd), &buf[..len], now) {
                    if let Err(err) = self.conns[idx].stream.write_all(&reply) {
                        warn!("tcp send to {peer} failed: {err}");
                        self.drop_conn(server, idx, "send failure");
                    }
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => {
                warn!("tcp read from {} failed: {err}", conn.peer);
                self.drop_conn(server, idx, "read failure");
            }
        }
    }

    fn sweep_conns(&mut self, server: &mut Tnfsd, now: Instant) {
        let mut idx = 0;
        while idx < self.conns.len() {
            if now.duration_since(self.conns[idx].last_active) > CONN_TIMEOUT {
                self.drop_conn(server, idx, "idle timeout");
            } else {
                idx += 1;
            }
        }
    }

    fn drop_conn(&mut self, server: &mut Tnfsd, idx: usize, why: &str) {
        let conn = self.conns.swap_remove(idx);
        info!("tcp connection from {} dropped: {why}", conn.peer);
        server.reset_cli_fd(conn.stream.as_raw_fd());
    }
}

/// Keepalive probes spot dead peers that never say goodbye.
fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    use nix::sys::socket::{setsockopt, sockopt};

    stream.set_nonblocking(true)?;
    setsockopt(stream, sockopt::KeepAlive, &true).map_err(io_from_errno)?;
    #[cfg(target_os = "linux")]
    {
        setsockopt(stream, sockopt::TcpKeepIdle, &TCP_KA_IDLE).map_err(io_from_errno)?;
        setsockopt(stream, sockopt::TcpKeepInterval, &TCP_KA_INTVL).map_err(io_from_errno)?;
        setsockopt(stream, sockopt::TcpKeepCount, &TCP_KA_COUNT).map_err(io_from_errno)?;
    }
    Ok(())
}

fn io_from_errno(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}
