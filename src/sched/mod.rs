//! The per-thread scheduler ("proc") and its event loop.
//!
//! Each scheduler owns one OS thread, a FIFO run queue (lockable by other
//! threads for cross-scheduler wakeups), an epoll poller with a wake pipe, a
//! timeout heap and the tasks it is running. The loop: drain the run queue,
//! resuming each task; destroy exited tasks and hand off migrating ones;
//! block in the poller no longer than the nearest deadline; wake tasks whose
//! descriptors turned ready; expire due timeouts; exit once no non-systask
//! remains.

mod registry;
pub(crate) mod poller;
pub(crate) mod timer;

#[cfg(test)]
mod tests;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::task;
use crate::task::{ProcId, TaskFlags, TaskRef};
use poller::Poller;
use timer::{TimerHeap, TimeoutKind};

pub use poller::Interest;

/// Upper bound for one poller block when the timeout heap is empty. The wake
/// pipe pops the poller early whenever another thread enqueues work.
const MAX_POLL_MS: i32 = 60_000;

thread_local! {
    static PROC: RefCell<Option<Rc<Proc>>> = const { RefCell::new(None) };
}

/// The cross-thread face of a scheduler: the run queue other threads may
/// append to, the wake pipe that pops its poller, and the census that
/// decides shutdown.
pub(crate) struct ProcShared {
    pub(crate) id: ProcId,
    runq: Mutex<VecDeque<TaskRef>>,
    wake_tx: OwnedFd,
    user_tasks: AtomicUsize,
}

impl ProcShared {
    fn new() -> io::Result<(Arc<Self>, OwnedFd)> {
        let (wake_rx, wake_tx) = poller::wake_pipe()?;
        let shared = Arc::new(Self {
            id: ProcId::next(),
            runq: Mutex::new(VecDeque::new()),
            wake_tx,
            user_tasks: AtomicUsize::new(0),
        });
        Ok((shared, wake_rx))
    }

    /// Append `task` if it is not already queued, waking the poller when the
    /// caller is not this scheduler's own thread. The READY flag is the
    /// duplicate guard: a second enqueue while queued is a no-op.
    pub(crate) fn enqueue(&self, task: TaskRef) {
        if task.test_flag(TaskFlags::EXITING) {
            return;
        }
        let queued = {
            let mut q = self.runq.lock();
            if task.set_flag(TaskFlags::READY) {
                false
            } else {
                tracing::trace!(task = %task.id(), proc = %self.id, "enqueue");
                q.push_back(task);
                true
            }
        };
        if queued && current_proc_id() != Some(self.id) {
            poller::wake(&self.wake_tx);
        }
    }

    /// Atomically take the whole queue, clearing READY so the drained tasks
    /// can be re-enqueued while they run.
    fn take_runq(&self) -> VecDeque<TaskRef> {
        let mut q = self.runq.lock();
        let batch = std::mem::take(&mut *q);
        for t in &batch {
            t.take_flag(TaskFlags::READY);
        }
        batch
    }

    fn runq_is_empty(&self) -> bool {
        self.runq.lock().is_empty()
    }

    pub(crate) fn inc_user_tasks(&self) {
        self.user_tasks.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_user_tasks(&self) {
        self.user_tasks.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn load(&self) -> usize {
        self.user_tasks.load(Ordering::Acquire)
    }
}

struct ProcInner {
    poller: Poller,
    timers: TimerHeap,
    /// Tasks owned (strongly held) by this scheduler.
    tasks: Vec<TaskRef>,
    current: Option<TaskRef>,
    /// Monotonic clock sample, refreshed per loop turn ("procnow").
    now: Instant,
    nswitch: u64,
}

pub(crate) struct Proc {
    shared: Arc<ProcShared>,
    inner: RefCell<ProcInner>,
}

impl Proc {
    /// Bind a scheduler to the calling thread. Fails if the thread already
    /// runs one.
    fn new() -> Result<Rc<Proc>> {
        let (shared, wake_rx) = ProcShared::new().map_err(Error::Io)?;
        let id = shared.id;
        registry::register(shared.clone());
        Self::attach(shared, wake_rx).inspect_err(|_| registry::unregister(id))
    }

    pub(super) fn attach(shared: Arc<ProcShared>, wake_rx: OwnedFd) -> Result<Rc<Proc>> {
        let poller = Poller::new(wake_rx).map_err(Error::Io)?;
        let proc = Rc::new(Proc {
            shared,
            inner: RefCell::new(ProcInner {
                poller,
                timers: TimerHeap::new(),
                tasks: Vec::new(),
                current: None,
                now: Instant::now(),
                nswitch: 0,
            }),
        });

        PROC.with(|cell| {
            let mut slot = cell.borrow_mut();
            if slot.is_some() {
                return Err(Error::Other(anyhow!(
                    "a weft scheduler is already running on this thread"
                )));
            }
            *slot = Some(proc.clone());
            Ok(())
        })?;

        tracing::debug!(proc = %proc.shared.id, "scheduler attached");
        Ok(proc)
    }

    pub(crate) fn shared(&self) -> &ProcShared {
        &self.shared
    }

    pub(crate) fn now(&self) -> Instant {
        self.inner.borrow().now
    }

    fn refresh_now(&self) {
        self.inner.borrow_mut().now = Instant::now();
    }

    pub(crate) fn add_timer(&self, task: TaskRef, when: Instant) -> u64 {
        self.inner.borrow_mut().timers.add(task, when)
    }

    pub(crate) fn cancel_timer(&self, token: u64) -> bool {
        self.inner.borrow_mut().timers.cancel(token)
    }

    fn run_loop(&self) -> Result<()> {
        loop {
            self.refresh_now();

            let batch = self.shared.take_runq();
            for task in batch {
                self.run_task(task)?;
            }

            if self.shared.load() == 0 && self.shared.runq_is_empty() {
                tracing::debug!(proc = %self.shared.id, "no user tasks left, exiting");
                return Ok(());
            }

            let timeout_ms = self.poll_bound();
            let woken = self
                .inner
                .borrow_mut()
                .poller
                .wait(timeout_ms)
                .map_err(Error::Io)?;
            for t in &woken {
                ready(t);
            }

            self.refresh_now();
            let now = self.now();
            let expired = self.inner.borrow_mut().timers.pop_expired(now);
            for t in &expired {
                ready(t);
            }
        }
    }

    /// Poller bound for this turn: zero if cross-thread work already arrived,
    /// else the nearest pending deadline, else a large clamp.
    fn poll_bound(&self) -> i32 {
        if !self.shared.runq_is_empty() {
            return 0;
        }
        let inner = self.inner.borrow();
        match inner.timers.next_deadline() {
            None => MAX_POLL_MS,
            Some(when) => {
                if when <= inner.now {
                    0
                } else {
                    ceil_ms(when - inner.now).min(MAX_POLL_MS as u64) as i32
                }
            }
        }
    }

    fn run_task(&self, task: TaskRef) -> Result<()> {
        if task.take_flag(TaskFlags::ADOPT) {
            self.inner.borrow_mut().tasks.push(task.clone());
        }

        {
            let mut inner = self.inner.borrow_mut();
            inner.current = Some(task.clone());
            inner.nswitch += 1;
        }

        // Safety: only the owning scheduler's thread resumes the coroutine,
        // and no borrow of the proc state is held across the swap.
        let finished = {
            let coro = unsafe { task.coro_mut() };
            match coro.as_mut() {
                Some(c) => c.resume(),
                None => true,
            }
        };

        self.inner.borrow_mut().current = None;

        if finished {
            self.destroy(task);
        } else if task.take_flag(TaskFlags::MIGRATING) {
            self.hand_off(task)?;
        }
        Ok(())
    }

    /// Tear down an exited task. Runs on the scheduler stack: a task cannot
    /// be destroyed on its own stack.
    fn destroy(&self, task: TaskRef) {
        tracing::trace!(task = %task.id(), "destroying");
        // Safety: owning thread, task no longer running.
        unsafe {
            *task.coro_mut() = None;
        }
        let leftovers: Vec<u64> = unsafe { task.aux() }
            .timeouts
            .drain(..)
            .map(|p| p.token)
            .collect();

        {
            let mut inner = self.inner.borrow_mut();
            for token in leftovers {
                inner.timers.cancel(token);
            }
            if let Some(at) = inner.tasks.iter().position(|t| Arc::ptr_eq(t, &task)) {
                inner.tasks.remove(at);
            }
        }

        task::unregister(task.id());
        task.set_owner(None);
        if !task.test_flag(TaskFlags::SYSTASK) {
            self.shared.dec_user_tasks();
        }
    }

    /// Hand a migrating task to its destination: the requested scheduler,
    /// else the least-loaded other one, else a freshly spawned one.
    fn hand_off(&self, task: TaskRef) -> Result<()> {
        // Safety: the task is suspended; we still own it.
        let target = unsafe { task.aux() }.migrate_to.take().flatten();

        {
            let mut inner = self.inner.borrow_mut();
            if let Some(at) = inner.tasks.iter().position(|t| Arc::ptr_eq(t, &task)) {
                inner.tasks.remove(at);
            }
        }
        let counts = !task.test_flag(TaskFlags::SYSTASK);
        if counts {
            self.shared.dec_user_tasks();
        }

        let dest = target
            .and_then(registry::get)
            .or_else(|| registry::pick_least_loaded(self.shared.id));

        match dest {
            Some(dest) => {
                tracing::debug!(task = %task.id(), from = %self.shared.id, to = %dest.id, "migrating");
                task.set_owner(Some(dest.id));
                if counts {
                    dest.inc_user_tasks();
                }
                task.set_flag(TaskFlags::ADOPT);
                dest.enqueue(task);
                Ok(())
            }
            None => registry::spawn_proc_for(task).map(|_| ()),
        }
    }

    pub(crate) fn dump(&self) -> String {
        use std::fmt::Write;

        let inner = self.inner.borrow();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "proc[{}] tasks={} switches={}",
            self.shared.id,
            inner.tasks.len(),
            inner.nswitch
        );
        for t in &inner.tasks {
            let marker = match &inner.current {
                Some(c) if Arc::ptr_eq(c, t) => '*',
                _ => ' ',
            };
            let (state, since) = t.state();
            let _ = writeln!(
                out,
                "{marker} {:>6}  {:<24} {:<10} {:?}",
                t.id().to_string(),
                t.name(),
                state,
                since.elapsed()
            );
        }
        out
    }

    /// Drop whatever the loop left behind (systasks, stranded wakeups).
    /// Dropping a suspended coroutine force-unwinds its stack so guards
    /// release their resources.
    fn shutdown(&self) {
        let leftovers: Vec<TaskRef> = {
            let mut inner = self.inner.borrow_mut();
            inner.current = None;
            std::mem::take(&mut inner.tasks)
        };
        for task in leftovers {
            task.set_flag(TaskFlags::EXITING);
            // Safety: owning thread; the task is suspended.
            let coro = unsafe { task.coro_mut() }.take();
            drop(coro);
            task::unregister(task.id());
        }
        registry::unregister(self.shared.id);
        PROC.with(|cell| cell.borrow_mut().take());
        tracing::debug!(proc = %self.shared.id, "scheduler detached");
    }
}

fn ceil_ms(d: Duration) -> u64 {
    ((d.as_micros() + 999) / 1000) as u64
}

/// Run `f` with the calling thread's scheduler.
///
/// # Panics
/// Panics outside a scheduler thread (i.e. outside [`run`]).
pub(crate) fn with_proc<R>(f: impl FnOnce(&Proc) -> R) -> R {
    PROC.with(|cell| {
        let slot = cell.borrow();
        let proc = slot
            .as_ref()
            .expect("not inside a weft scheduler; wrap the code in weft::run");
        f(proc)
    })
}

pub(crate) fn try_with_proc<R>(f: impl FnOnce(&Proc) -> R) -> Option<R> {
    PROC.with(|cell| cell.borrow().as_ref().map(|proc| f(proc)))
}

/// The monotonic clock sample taken by the current scheduler this loop turn.
///
/// # Panics
/// Panics outside a scheduler thread.
pub fn procnow() -> Instant {
    with_proc(|p| p.now())
}

/// Id of the scheduler running on this thread.
///
/// # Panics
/// Panics outside a scheduler thread.
pub fn current_id() -> ProcId {
    with_proc(|p| p.shared.id)
}

pub(crate) fn current_proc_id() -> Option<ProcId> {
    try_with_proc(|p| p.shared.id)
}

/// The task currently executing on this thread's scheduler.
///
/// # Panics
/// Panics outside a task.
pub(crate) fn current_task() -> TaskRef {
    try_current_task().expect("not inside a task")
}

pub(crate) fn try_current_task() -> Option<TaskRef> {
    try_with_proc(|p| p.inner.borrow().current.clone()).flatten()
}

/// Make `task` ready on its owning scheduler, waking that scheduler if it is
/// another thread's. A no-op for exiting tasks, tasks already queued, and
/// tasks currently between owners.
pub(crate) fn ready(task: &TaskRef) {
    if task.test_flag(TaskFlags::EXITING) {
        return;
    }
    let Some(pid) = task.owner() else {
        tracing::trace!(task = %task.id(), "ready on ownerless task ignored");
        return;
    };
    let Some(shared) = registry::get(pid) else {
        return;
    };
    shared.enqueue(task.clone());
}

/// Adopt a freshly spawned task into the current scheduler and queue it.
pub(crate) fn adopt_and_ready(task: TaskRef) {
    with_proc(|p| {
        task.set_owner(Some(p.shared.id));
        p.inner.borrow_mut().tasks.push(task.clone());
        p.shared.inc_user_tasks();
    });
    ready(&task);
}

/// Swap the current task out to its scheduler. On resumption, deliver any
/// pending cancellation or expired timeout payload as an `Err`.
pub(crate) fn suspend() -> Result<()> {
    let task = current_task();
    // Safety: the yielder was stored at coroutine entry on this thread and
    // stays valid until the coroutine completes.
    let yielder = unsafe { task.aux() }.yielder;
    debug_assert!(!yielder.is_null(), "suspend before coroutine entry");
    unsafe { (*yielder).suspend(()) };
    task.check_injection()
}

/// Install a timeout `delay` from procnow on `task`, both in the scheduler's
/// heap and in the task's own pending list.
pub(crate) fn add_timeout(task: &TaskRef, delay: Duration, kind: TimeoutKind) -> u64 {
    with_proc(|p| {
        let when = p.now() + delay;
        let token = p.add_timer(task.clone(), when);
        // Safety: a task only installs timeouts on itself, on its own thread.
        let aux = unsafe { task.aux() };
        let at = aux.timeouts.partition_point(|t| t.when <= when);
        aux.timeouts.insert(
            at,
            task::PendingTimeout { token, when, kind },
        );
        token
    })
}

/// Remove a timeout from the heap and the task's pending list; tolerant of
/// entries already consumed by expiry.
pub(crate) fn cancel_timeout(task: &TaskRef, token: u64) {
    with_proc(|p| p.cancel_timer(token));
    // Safety: as in add_timeout.
    let aux = unsafe { task.aux() };
    aux.timeouts.retain(|t| t.token != token);
}

/// Suspend the current task until `fd` is ready for `interest` or the
/// timeout passes. Returns `true` if readiness caused the wake and `false`
/// if the deadline expired first.
pub fn fdwait(fd: RawFd, interest: Interest, timeout: Option<Duration>) -> Result<bool> {
    let task = current_task();
    let hit = Arc::new(AtomicU8::new(0));

    with_proc(|p| {
        p.inner
            .borrow_mut()
            .poller
            .add(fd, interest, task.clone(), hit.clone())
    })
    .map_err(Error::Io)?;
    let token = timeout.map(|d| add_timeout(&task, d, TimeoutKind::Wake));
    task.set_state("fdwait");

    let res = suspend();

    with_proc(|p| p.inner.borrow_mut().poller.remove(fd));
    if let Some(token) = token {
        cancel_timeout(&task, token);
    }
    res?;

    Ok(hit.load(Ordering::Acquire) != 0)
}

/// One descriptor of a multi-fd [`poll`].
#[derive(Debug, Clone, Copy)]
pub struct PollDesc {
    pub fd: RawFd,
    pub events: Interest,
    pub revents: Interest,
}

impl PollDesc {
    pub fn new(fd: RawFd, events: Interest) -> Self {
        Self {
            fd,
            events,
            revents: Interest::empty(),
        }
    }
}

/// Suspend until at least one of `fds` is ready or the timeout passes.
/// Fills in `revents` and returns the number of ready descriptors; a wake
/// with none ready (timeout or spurious) returns `0` and the caller may
/// re-enter.
pub fn poll(fds: &mut [PollDesc], timeout: Option<Duration>) -> Result<usize> {
    let task = current_task();
    let mut hits = Vec::with_capacity(fds.len());

    let mut added = 0usize;
    let add_res: io::Result<()> = with_proc(|p| {
        let mut inner = p.inner.borrow_mut();
        for desc in fds.iter() {
            let hit = Arc::new(AtomicU8::new(0));
            inner
                .poller
                .add(desc.fd, desc.events, task.clone(), hit.clone())?;
            hits.push(hit);
            added += 1;
        }
        Ok(())
    });
    if let Err(e) = add_res {
        with_proc(|p| {
            let mut inner = p.inner.borrow_mut();
            for desc in &fds[..added] {
                inner.poller.remove(desc.fd);
            }
        });
        return Err(Error::Io(e));
    }

    let token = timeout.map(|d| add_timeout(&task, d, TimeoutKind::Wake));
    task.set_state("poll");

    let res = suspend();

    with_proc(|p| {
        let mut inner = p.inner.borrow_mut();
        for desc in fds.iter() {
            inner.poller.remove(desc.fd);
        }
    });
    if let Some(token) = token {
        cancel_timeout(&task, token);
    }
    res?;

    let mut ready_fds = 0;
    for (desc, hit) in fds.iter_mut().zip(hits) {
        desc.revents = Interest::from_bits_truncate(hit.load(Ordering::Acquire));
        if !desc.revents.is_empty() {
            ready_fds += 1;
        }
    }
    Ok(ready_fds)
}

/// Run a scheduler on the calling thread with `f` as its first task; returns
/// once every non-systask has exited.
pub fn run<F>(f: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let proc = Proc::new()?;
    let res = (|| {
        task::spawn(f)?;
        proc.run_loop()
    })();
    proc.shutdown();
    res
}

/// A scheduler started on its own OS thread by [`spawn_thread`].
pub struct ProcHandle {
    id: ProcId,
    handle: thread::JoinHandle<Result<()>>,
}

impl ProcHandle {
    pub fn id(&self) -> ProcId {
        self.id
    }

    /// Wait for the scheduler thread to finish (all its non-systasks gone).
    pub fn join(self) -> Result<()> {
        self.handle
            .join()
            .map_err(|_| Error::Other(anyhow!("scheduler thread panicked")))?
    }
}

/// Start an additional scheduler on a new OS thread, seeded with `f` as its
/// first task.
pub fn spawn_thread<F>(f: F) -> Result<ProcHandle>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let (shared, wake_rx) = ProcShared::new().map_err(Error::Io)?;
    let id = shared.id;
    registry::register(shared.clone());

    let handle = thread::Builder::new()
        .name(format!("weft-{id}"))
        .spawn(move || -> Result<()> {
            let proc =
                Proc::attach(shared, wake_rx).inspect_err(|_| registry::unregister(id))?;
            let res = (|| {
                task::spawn(f)?;
                proc.run_loop()
            })();
            proc.shutdown();
            res
        })
        .map_err(Error::Io)?;

    Ok(ProcHandle { id, handle })
}
