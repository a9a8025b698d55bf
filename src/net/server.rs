//! The accept-loop server.
//!
//! One listening socket shared by one accept loop per scheduler thread. Each
//! accepted connection gets its own task running the user's handler.
//! Resource exhaustion (out of descriptors, buffers or memory) is absorbed
//! with an exponential backoff instead of tearing the server down.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use nix::sys::socket::Shutdown;

use crate::error::{Error, Result};
use crate::net::socket::NetSock;
use crate::sched;
use crate::task;

const ACCEPT_BACKLOG: i32 = 100_000;
const BACKOFF_MIN: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_millis(500);

/// Exponential delay generator bounded to `[min, max]`; reset on success.
struct Backoff {
    min: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self { min, max, next: min }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (delay * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.next = self.min;
    }
}

fn is_resource_exhausted(err: &Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}

type OnConnection = dyn Fn(NetSock) -> Result<()> + Send + Sync + 'static;

struct ServerInner {
    sock: NetSock,
    protocol: String,
    handler: Box<OnConnection>,
}

/// A listening socket plus the handler run for each accepted connection.
///
/// Every accept loop and the server handle itself share the inner state; the
/// listening descriptor closes when the last of them is gone.
pub struct NetServer {
    inner: Arc<ServerInner>,
}

impl NetServer {
    /// Bind a listening socket on `addr` (`port` 0 picks a free port; read it
    /// back with [`local_addr`](NetServer::local_addr)).
    ///
    /// The listening descriptor keeps SO_REUSEADDR and clears FD_CLOEXEC so
    /// it can be shared across exec.
    pub fn bind<F>(addr: SocketAddr, protocol: impl Into<String>, handler: F) -> Result<NetServer>
    where
        F: Fn(NetSock) -> Result<()> + Send + Sync + 'static,
    {
        let sock = NetSock::stream(super::socket_family(&addr))?;
        sock.set_reuseaddr()?;
        sock.clear_cloexec()?;
        sock.bind(addr)?;
        sock.listen(ACCEPT_BACKLOG)?;

        Ok(NetServer {
            inner: Arc::new(ServerInner {
                sock,
                protocol: protocol.into(),
                handler: Box::new(handler),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.sock.local_addr()
    }

    pub fn listen_fd(&self) -> RawFd {
        self.inner.sock.as_raw_fd()
    }

    /// Run accept loops until failure: one on the current task plus one
    /// scheduler thread for each additional requested thread.
    ///
    /// If the local loop unwinds (cancellation included), the listening
    /// socket is shut down both ways so every sibling loop exits too, then
    /// the error propagates after the siblings are joined.
    pub fn serve(&self, nthreads: usize) -> Result<()> {
        let addr = self.local_addr()?;
        tracing::info!(
            protocol = %self.inner.protocol,
            %addr,
            threads = nthreads.max(1),
            "listening"
        );

        let mut siblings = Vec::new();
        for _ in 1..nthreads {
            let inner = self.inner.clone();
            siblings.push(sched::spawn_thread(move || accept_loop(inner))?);
        }

        let res = accept_loop(self.inner.clone());
        if res.is_err() {
            // Induce the sibling loops to quit without invalidating the fd
            // while they still hold it.
            let _ = self.inner.sock.shutdown(Shutdown::Both);
        }
        for sibling in siblings {
            let _ = sibling.join();
        }
        res
    }
}

fn accept_loop(inner: Arc<ServerInner>) -> Result<()> {
    task::set_name(format!("accept[{}]", inner.protocol));
    let mut backoff = Backoff::new(BACKOFF_MIN, BACKOFF_MAX);

    loop {
        match inner.sock.accept(None) {
            Ok((sock, peer)) => {
                // A descriptor in the stdio range means somebody closed
                // stdin/stdout/stderr; nothing sane can follow.
                let raw = sock.as_raw_fd();
                if raw <= 2 {
                    return Err(Error::Other(anyhow!(
                        "accept returned stdio descriptor {raw}"
                    )));
                }

                backoff.reset();
                tracing::debug!(%peer, "accepted");
                let client_inner = inner.clone();
                match task::spawn(move || client_task(client_inner, sock)) {
                    Ok(_) => task::yield_now()?, // give the new client a turn
                    Err(e) => {
                        // Task spawn ran out of memory; shed load briefly.
                        let delay = backoff.next_delay();
                        tracing::error!(error = %e, ?delay, "task spawn failed, sleeping");
                        task::sleep(delay)?;
                    }
                }
            }
            Err(ref e) if is_resource_exhausted(e) => {
                let delay = backoff.next_delay();
                tracing::error!(error = %e, ?delay, "accept failed, sleeping");
                task::sleep(delay)?;
            }
            // The listening socket was shut down under us: a sibling loop
            // (or serve itself) is tearing the server down.
            Err(Error::Io(ref e)) if e.raw_os_error() == Some(libc::EINVAL) => {
                return Ok(());
            }
            Err(e) if e.is_injected() => return Err(e),
            Err(e) => {
                tracing::error!(error = %e, "accept failed");
                task::yield_now()?;
            }
        }
    }
}

fn client_task(inner: Arc<ServerInner>, sock: NetSock) -> Result<()> {
    if let Err(e) = (inner.handler)(sock) {
        if e.is_injected() {
            tracing::debug!(error = %e, "client task unwound");
        } else {
            tracing::error!(error = %e, "unhandled client task error");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::{Read, Write};
    use std::sync::mpsc;

    #[test]
    fn backoff_doubles_to_the_cap_and_resets() {
        let mut bo = Backoff::new(BACKOFF_MIN, BACKOFF_MAX);
        let steps: Vec<u64> = (0..5).map(|_| bo.next_delay().as_millis() as u64).collect();
        assert_eq!(steps, vec![100, 200, 400, 500, 500]);

        bo.reset();
        assert_eq!(bo.next_delay(), BACKOFF_MIN);
    }

    #[test]
    fn resource_exhaustion_is_classified() {
        for errno in [libc::EMFILE, libc::ENFILE, libc::ENOBUFS, libc::ENOMEM] {
            let err = Error::Io(std::io::Error::from_raw_os_error(errno));
            assert!(is_resource_exhausted(&err));
        }
        let err = Error::Io(std::io::Error::from_raw_os_error(libc::ECONNABORTED));
        assert!(!is_resource_exhausted(&err));
    }

    fn start_echo_server() -> SocketAddr {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = crate::run(move || {
                let server = NetServer::bind(
                    "127.0.0.1:0".parse().unwrap(),
                    "echo",
                    |sock| {
                        let mut buf = [0u8; 4096];
                        loop {
                            let n = sock.recv(&mut buf, None)?;
                            if n == 0 {
                                return Ok(());
                            }
                            sock.sendall(&buf[..n], None)?;
                        }
                    },
                )?;
                tx.send(server.local_addr()?).unwrap();
                server.serve(1)
            });
        });
        rx.recv().expect("server failed to bind")
    }

    /// Byte-for-byte echo across payload sizes, with a write-side half-close
    /// ending each session. A concurrent reader thread keeps the windows
    /// draining so large payloads cannot deadlock on full buffers.
    #[rstest]
    #[case::one_kib(1024)]
    #[case::sixty_four_kib(64 * 1024)]
    #[case::one_mib(1 << 20)]
    fn echoes_byte_for_byte(#[case] size: usize) {
        let addr = start_echo_server();

        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let conn = std::net::TcpStream::connect(addr).unwrap();

        let mut reader = conn.try_clone().unwrap();
        let expect = payload.clone();
        let read_side = std::thread::spawn(move || {
            let mut echoed = Vec::with_capacity(expect.len());
            reader.read_to_end(&mut echoed).unwrap();
            assert_eq!(echoed, expect);
        });

        let mut writer = conn;
        writer.write_all(&payload).unwrap();
        writer.shutdown(std::net::Shutdown::Write).unwrap();
        read_side.join().unwrap();

        // The per-connection task exited; the server keeps accepting.
        let mut second = std::net::TcpStream::connect(addr).unwrap();
        second.write_all(b"again\n").unwrap();
        second.shutdown(std::net::Shutdown::Write).unwrap();
        let mut echoed = Vec::new();
        second.read_to_end(&mut echoed).unwrap();
        assert_eq!(echoed, b"again\n");
    }

    #[test]
    fn serve_on_multiple_threads_accepts_on_all_of_them() {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = crate::run(move || {
                let server = NetServer::bind(
                    "127.0.0.1:0".parse().unwrap(),
                    "echo",
                    |sock| {
                        let mut buf = [0u8; 1024];
                        loop {
                            let n = sock.recv(&mut buf, None)?;
                            if n == 0 {
                                return Ok(());
                            }
                            sock.sendall(&buf[..n], None)?;
                        }
                    },
                )?;
                tx.send(server.local_addr()?).unwrap();
                server.serve(3)
            });
        });
        let addr = rx.recv().unwrap();

        let clients: Vec<_> = (0..8)
            .map(|i| {
                std::thread::spawn(move || {
                    let msg = format!("client-{i}");
                    let mut conn = std::net::TcpStream::connect(addr).unwrap();
                    conn.write_all(msg.as_bytes()).unwrap();
                    conn.shutdown(std::net::Shutdown::Write).unwrap();
                    let mut echoed = Vec::new();
                    conn.read_to_end(&mut echoed).unwrap();
                    assert_eq!(echoed, msg.as_bytes());
                })
            })
            .collect();
        for c in clients {
            c.join().unwrap();
        }
    }
}
