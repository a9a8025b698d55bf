//! Level-triggered readiness poller over epoll.
//!
//! One poller per scheduler. Tasks register a descriptor with interest bits
//! and suspend; the event loop's `wait` reports readiness and hands back the
//! tasks to wake. The poller also owns the read end of the scheduler's wake
//! pipe: any thread can write one byte to the other end to pop a blocked
//! `wait` promptly, and the poller drains all pending bytes on each wake.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::task::TaskRef;

bitflags::bitflags! {
    /// Readiness interest bits for [`fdwait`](crate::sched::fdwait) and the
    /// multi-fd [`poll`](crate::sched::poll) entry point.
    ///
    /// `ERROR` (error/hang-up) is always reported, whether requested or not.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READABLE = 1;
        const WRITABLE = 1 << 1;
        const ERROR = 1 << 2;
    }
}

impl Interest {
    fn epoll_bits(self) -> u32 {
        let mut ev = (libc::EPOLLERR | libc::EPOLLHUP) as u32;
        if self.contains(Interest::READABLE) {
            ev |= libc::EPOLLIN as u32;
        }
        if self.contains(Interest::WRITABLE) {
            ev |= libc::EPOLLOUT as u32;
        }
        ev
    }

    fn from_epoll_bits(ev: u32) -> Interest {
        let mut got = Interest::empty();
        if ev & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0 {
            got |= Interest::READABLE;
        }
        if ev & libc::EPOLLOUT as u32 != 0 {
            got |= Interest::WRITABLE;
        }
        if ev & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            got |= Interest::ERROR;
        }
        got
    }
}

/// Per-fd registration: the waiting task plus the cell where observed
/// readiness bits are accumulated for it to read after resumption.
struct Registration {
    task: TaskRef,
    hit: Arc<AtomicU8>,
}

pub(crate) struct Poller {
    epfd: OwnedFd,
    wake_rx: OwnedFd,
    registrations: HashMap<RawFd, Registration>,
}

impl Poller {
    /// `wake_rx` is the read end of the scheduler's wake pipe; it is
    /// registered readable for the poller's whole lifetime.
    pub(crate) fn new(wake_rx: OwnedFd) -> io::Result<Self> {
        let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: epoll_create1 just returned this descriptor to us.
        let epfd = unsafe { std::os::fd::FromRawFd::from_raw_fd(raw) };

        let poller = Self {
            epfd,
            wake_rx,
            registrations: HashMap::new(),
        };

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: poller.wake_rx.as_raw_fd() as u64,
        };
        let ret = unsafe {
            libc::epoll_ctl(
                poller.epfd.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                poller.wake_rx.as_raw_fd(),
                &mut ev,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(poller)
    }

    /// Register `fd` pointing at `task`. At most one task may wait on a
    /// descriptor at a time; a second registration is an error.
    pub(crate) fn add(
        &mut self,
        fd: RawFd,
        interest: Interest,
        task: TaskRef,
        hit: Arc<AtomicU8>,
    ) -> io::Result<()> {
        if self.registrations.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "another task is already waiting on this descriptor",
            ));
        }

        let mut ev = libc::epoll_event {
            events: interest.epoll_bits(),
            u64: fd as u64,
        };
        let ret =
            unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        self.registrations.insert(fd, Registration { task, hit });
        Ok(())
    }

    /// Change the interest bits of an existing registration in place.
    #[allow(dead_code)]
    pub(crate) fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if !self.registrations.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "descriptor is not registered",
            ));
        }

        let mut ev = libc::epoll_event {
            events: interest.epoll_bits(),
            u64: fd as u64,
        };
        let ret =
            unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Drop the registration for `fd`. ENOENT/EBADF are tolerated: the
    /// descriptor may have been closed while the task was suspended.
    pub(crate) fn remove(&mut self, fd: RawFd) {
        if self.registrations.remove(&fd).is_some() {
            let ret = unsafe {
                libc::epoll_ctl(
                    self.epfd.as_raw_fd(),
                    libc::EPOLL_CTL_DEL,
                    fd,
                    std::ptr::null_mut(),
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT)
                    && err.raw_os_error() != Some(libc::EBADF)
                {
                    tracing::debug!(fd, error = %err, "epoll deregistration failed");
                }
            }
        }
    }

    #[allow(dead_code)]
    pub(crate) fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Block up to `timeout_ms` for readiness. Records observed bits into
    /// each ready registration's `hit` cell and returns the tasks to wake.
    /// Wake-pipe traffic is drained internally and never surfaced.
    pub(crate) fn wait(&mut self, timeout_ms: i32) -> io::Result<Vec<TaskRef>> {
        const MAX_EVENTS: usize = 64;
        let mut events: [libc::epoll_event; MAX_EVENTS] =
            [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let mut woken = Vec::new();
        for ev in &events[..n as usize] {
            let fd = ev.u64 as RawFd;

            if fd == self.wake_rx.as_raw_fd() {
                self.drain_wake_pipe();
                continue;
            }

            if let Some(reg) = self.registrations.get(&fd) {
                let got = Interest::from_epoll_bits(ev.events);
                reg.hit.fetch_or(got.bits(), Ordering::Release);
                woken.push(reg.task.clone());
            }
        }

        Ok(woken)
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.wake_rx.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

/// Write one byte into a wake pipe, unblocking the poller on its other end.
/// EAGAIN means a wake is already pending, which is just as good.
pub(crate) fn wake(wake_tx: &OwnedFd) {
    let byte = 1u8;
    unsafe {
        libc::write(
            wake_tx.as_raw_fd(),
            &byte as *const u8 as *const libc::c_void,
            1,
        );
    }
}

/// Create the non-blocking wake pipe: `(read_end, write_end)`.
pub(crate) fn wake_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    // Safety: pipe2 just returned these descriptors to us.
    unsafe {
        Ok((
            std::os::fd::FromRawFd::from_raw_fd(fds[0]),
            std::os::fd::FromRawFd::from_raw_fd(fds[1]),
        ))
    }
}
