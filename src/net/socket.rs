//! The task-friendly socket.
//!
//! Every operation issues the syscall on a non-blocking descriptor; on
//! would-block it parks the task in `fdwait` keyed on the descriptor and an
//! optional deadline, then retries. A deadline expiring first surfaces as
//! [`Error::TimedOut`].

use std::io;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::socket::{
    accept4, bind, connect, getpeername, getsockname, recv, send, shutdown, socket,
    AddressFamily, MsgFlags, Shutdown, SockFlag, SockType, SockaddrStorage,
};

use crate::error::{Error, Result};
use crate::net::{resolve, socket_family};
use crate::sched::{fdwait, Interest};

fn storage_to_addr(ss: &SockaddrStorage) -> Result<SocketAddr> {
    if let Some(sin) = ss.as_sockaddr_in() {
        Ok(SocketAddr::V4(SocketAddrV4::new(sin.ip(), sin.port())))
    } else if let Some(sin6) = ss.as_sockaddr_in6() {
        Ok(SocketAddr::V6(SocketAddrV6::new(
            sin6.ip(),
            sin6.port(),
            sin6.flowinfo(),
            sin6.scope_id(),
        )))
    } else {
        Err(Error::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            "non-inet socket address",
        )))
    }
}

/// A non-blocking stream socket bound to the scheduler through `fdwait`.
#[derive(Debug)]
pub struct NetSock {
    fd: OwnedFd,
}

impl NetSock {
    /// A fresh non-blocking TCP socket of the given family.
    pub fn stream(family: AddressFamily) -> Result<Self> {
        let fd = socket(
            family,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        Ok(Self { fd })
    }

    pub(crate) fn from_owned(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Resolve `host` and connect to each returned address in turn, with
    /// `timeout` applied per attempt. Fails with a hostname error when
    /// resolution fails, otherwise with the last connect error.
    ///
    /// Resolution blocks the OS thread; dialing tasks should run on a
    /// [`DIAL_STACK_SIZE`](crate::task::DIAL_STACK_SIZE) stack.
    pub fn dial(host: &str, port: u16, timeout: Option<Duration>) -> Result<Self> {
        let addrs = resolve(host, port)?;
        let mut last_err = None;
        for addr in addrs {
            let sock = Self::stream(socket_family(&addr))?;
            match sock.connect(addr, timeout) {
                Ok(()) => return Ok(sock),
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        // resolve() returned at least one address, so an error is recorded.
        Err(last_err.expect("no connect attempts made"))
    }

    /// Connect to `addr`, suspending until the handshake finishes or the
    /// timeout passes.
    pub fn connect(&self, addr: SocketAddr, timeout: Option<Duration>) -> Result<()> {
        let ss = SockaddrStorage::from(addr);
        match connect(self.fd.as_raw_fd(), &ss) {
            Ok(()) => Ok(()),
            Err(Errno::EINPROGRESS) => {
                if !fdwait(self.fd.as_raw_fd(), Interest::WRITABLE, timeout)? {
                    return Err(Error::TimedOut);
                }
                // Writability reports completion; the verdict is in SO_ERROR.
                match self.take_socket_error()? {
                    0 => Ok(()),
                    errno => Err(Error::Io(io::Error::from_raw_os_error(errno))),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Accept one connection, returning the new socket and the peer address.
    pub fn accept(&self, timeout: Option<Duration>) -> Result<(NetSock, SocketAddr)> {
        loop {
            match accept4(
                self.fd.as_raw_fd(),
                SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            ) {
                Ok(raw) => {
                    // Safety: accept4 just returned this descriptor to us.
                    let sock = NetSock::from_owned(unsafe { OwnedFd::from_raw_fd(raw) });
                    let peer = sock.peer_addr()?;
                    return Ok((sock, peer));
                }
                Err(Errno::EAGAIN) => {
                    if !fdwait(self.fd.as_raw_fd(), Interest::READABLE, timeout)? {
                        return Err(Error::TimedOut);
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Receive into `buf`; `Ok(0)` is end-of-stream.
    pub fn recv(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        loop {
            match recv(self.fd.as_raw_fd(), buf, MsgFlags::empty()) {
                Ok(n) => return Ok(n),
                Err(Errno::EAGAIN) => {
                    if !fdwait(self.fd.as_raw_fd(), Interest::READABLE, timeout)? {
                        return Err(Error::TimedOut);
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Send from `buf`, returning the number of bytes written (possibly
    /// short).
    pub fn send(&self, buf: &[u8], timeout: Option<Duration>) -> Result<usize> {
        loop {
            match send(self.fd.as_raw_fd(), buf, MsgFlags::MSG_NOSIGNAL) {
                Ok(n) => return Ok(n),
                Err(Errno::EAGAIN) => {
                    if !fdwait(self.fd.as_raw_fd(), Interest::WRITABLE, timeout)? {
                        return Err(Error::TimedOut);
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Receive into successive regions of `buf` until it is full, the peer
    /// closes, or the timeout passes. Returns the bytes received; a timeout
    /// just ends the read early.
    pub fn recvall(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let mut pos = 0;
        while pos != buf.len() {
            match self.recv(&mut buf[pos..], timeout) {
                Ok(0) => break,
                Ok(n) => pos += n,
                Err(Error::TimedOut) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(pos)
    }

    /// Send all of `buf`, looping over short writes.
    pub fn sendall(&self, buf: &[u8], timeout: Option<Duration>) -> Result<usize> {
        let mut pos = 0;
        while pos != buf.len() {
            pos += self.send(&buf[pos..], timeout)?;
        }
        Ok(pos)
    }

    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        let ss = SockaddrStorage::from(addr);
        bind(self.fd.as_raw_fd(), &ss)?;
        Ok(())
    }

    /// Start listening. The default backlog is deliberately huge; the kernel
    /// truncates it to its own maximum.
    pub fn listen(&self, backlog: i32) -> Result<()> {
        let ret = unsafe { libc::listen(self.fd.as_raw_fd(), backlog) };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        shutdown(self.fd.as_raw_fd(), how)?;
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let ss: SockaddrStorage = getsockname(self.fd.as_raw_fd())?;
        storage_to_addr(&ss)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        let ss: SockaddrStorage = getpeername(self.fd.as_raw_fd())?;
        storage_to_addr(&ss)
    }

    pub fn set_reuseaddr(&self) -> Result<()> {
        let one: libc::c_int = 1;
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Clear FD_CLOEXEC so a listening socket survives exec and can be
    /// shared with child processes.
    pub(crate) fn clear_cloexec(&self) -> Result<()> {
        let flags = unsafe { libc::fcntl(self.fd.as_raw_fd(), libc::F_GETFD) };
        if flags < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let ret = unsafe {
            libc::fcntl(
                self.fd.as_raw_fd(),
                libc::F_SETFD,
                flags & !libc::FD_CLOEXEC,
            )
        };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn take_socket_error(&self) -> Result<i32> {
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(err)
    }
}

impl AsRawFd for NetSock {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task;
    use std::io::Write;
    use std::time::Instant;

    /// Recv against a peer that never sends must fail with `TimedOut` close
    /// to the requested deadline.
    #[test]
    fn recv_times_out_against_a_silent_peer() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept but never write.
        let silent = std::thread::spawn(move || listener.accept());

        crate::run(move || {
            let sock = NetSock::dial(&addr.ip().to_string(), addr.port(), None)?;
            let start = Instant::now();
            let mut buf = [0u8; 16];
            let res = sock.recv(&mut buf, Some(Duration::from_millis(100)));
            assert!(matches!(res, Err(Error::TimedOut)));

            let elapsed = start.elapsed();
            assert!(
                elapsed >= Duration::from_millis(80) && elapsed < Duration::from_millis(500),
                "timed out at {elapsed:?}, wanted ~100ms"
            );
            Ok(())
        })
        .unwrap();

        let _ = silent.join();
    }

    #[test]
    fn dial_and_roundtrip_against_std_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let echo = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            std::io::Read::read_exact(&mut conn, &mut buf).unwrap();
            conn.write_all(&buf).unwrap();
        });

        crate::run(move || {
            let sock = NetSock::dial(&addr.ip().to_string(), addr.port(), None)?;
            assert_eq!(sock.sendall(b"hello", None)?, 5);

            let mut buf = [0u8; 5];
            let n = sock.recvall(&mut buf, Some(Duration::from_secs(5)))?;
            assert_eq!(&buf[..n], b"hello");
            Ok(())
        })
        .unwrap();

        echo.join().unwrap();
    }

    #[test]
    fn recv_sees_end_of_stream_after_peer_close() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let closer = std::thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            drop(conn);
        });

        crate::run(move || {
            let sock = NetSock::dial(&addr.ip().to_string(), addr.port(), None)?;
            let mut buf = [0u8; 8];
            assert_eq!(sock.recv(&mut buf, Some(Duration::from_secs(5)))?, 0);
            Ok(())
        })
        .unwrap();

        closer.join().unwrap();
    }

    #[test]
    fn dial_to_unresolvable_host_is_a_hostname_error() {
        crate::run(|| {
            let res = task::spawn_with_stack(
                || {
                    let res = NetSock::dial("definitely-not-a-real-host.invalid.", 80, None);
                    assert!(matches!(res, Err(Error::Hostname { .. })));
                    Ok(())
                },
                crate::task::DIAL_STACK_SIZE,
            );
            res.map(|_| ())
        })
        .unwrap();
    }

    /// Requires a routable blackhole; exercised manually.
    #[test]
    #[ignore = "needs a routable address that drops SYNs"]
    fn connect_times_out_against_a_blackhole() {
        crate::run(|| {
            let sock = NetSock::stream(AddressFamily::Inet)?;
            let start = Instant::now();
            let res = sock.connect(
                "10.255.255.1:81".parse().unwrap(),
                Some(Duration::from_millis(100)),
            );
            assert!(matches!(res, Err(Error::TimedOut)));
            let elapsed = start.elapsed();
            assert!(
                elapsed >= Duration::from_millis(80) && elapsed < Duration::from_millis(200),
                "timed out at {elapsed:?}"
            );
            Ok(())
        })
        .unwrap();
    }
}
