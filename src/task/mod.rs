//! Tasks: cooperatively scheduled units of execution with their own stacks.
//!
//! A task is spawned with a body and a fixed stack size, runs when its
//! scheduler's event loop selects it, may suspend any number of times
//! (yield, sleep, fdwait, qutex/rendez waits), and exits when its body
//! returns. Cancellation and scoped deadlines are delivered as `Err` values
//! from the suspension the task is parked in, so `?` unwinds the task
//! through its call frames and RAII guards release what it holds.

mod id;

use std::cell::UnsafeCell;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::coro::{Coro, TaskYielder};
use crate::error::{Error, Result};
use crate::sched;
use crate::sched::timer::TimeoutKind;

pub use id::{ProcId, TaskId};

/// Default task stack. Generously sized; the runtime does not detect
/// overflow beyond the stack's guard page.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Stack size for tasks that perform address resolution: `getaddrinfo` is
/// stack-hungry, so dialers get a large stack.
pub const DIAL_STACK_SIZE: usize = 8 * 1024 * 1024;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct TaskFlags: u8 {
        /// Present in its scheduler's run queue.
        const READY = 1;
        /// Body returned; the scheduler destroys the task after swapping away.
        const EXITING = 1 << 1;
        /// Does not count toward the scheduler's shutdown census.
        const SYSTASK = 1 << 2;
        /// Sticky cancellation request; injected at the next swap-in.
        const CANCELED = 1 << 3;
        /// Cancellation already injected; do not inject again.
        const UNWINDING = 1 << 4;
        /// Suspended for migration; the event loop hands it off.
        const MIGRATING = 1 << 5;
        /// Arrived from another scheduler; adopt into the task list.
        const ADOPT = 1 << 6;
    }
}

pub(crate) type TaskRef = Arc<TaskInner>;

/// A timeout owned by this task, mirroring an entry in the owning
/// scheduler's timer heap. Kept sorted by deadline so expired payloads
/// drain in deadline order at swap-in.
pub(crate) struct PendingTimeout {
    pub(crate) token: u64,
    pub(crate) when: Instant,
    pub(crate) kind: TimeoutKind,
}

/// State only ever touched from the owning scheduler's thread: the yielder
/// used to swap out, the pending timeouts, and the migration target.
pub(crate) struct TaskAux {
    pub(crate) yielder: *const TaskYielder,
    pub(crate) timeouts: Vec<PendingTimeout>,
    pub(crate) migrate_to: Option<Option<ProcId>>,
}

pub(crate) struct TaskInner {
    id: TaskId,
    flags: AtomicU8,
    name: Mutex<String>,
    /// Diagnostic state string plus when it last changed.
    state: Mutex<(String, Instant)>,
    /// Owning scheduler. Rewritten when the task is handed off.
    owner: Mutex<Option<ProcId>>,
    /// The execution stack. Taken (dropped) when the task is destroyed.
    coro: UnsafeCell<Option<Coro>>,
    aux: UnsafeCell<TaskAux>,
}

// Safety: the task record crosses threads (cross-scheduler ready/cancel,
// migration), but the two UnsafeCell fields are only ever touched from the
// thread of the scheduler that currently owns the task, and ownership only
// changes at suspension points. Everything else is atomics and mutexes.
unsafe impl Send for TaskInner {}
unsafe impl Sync for TaskInner {}

impl TaskInner {
    fn new(coro: Option<Coro>) -> TaskRef {
        let id = TaskId::next();
        Arc::new(Self {
            id,
            flags: AtomicU8::new(0),
            name: Mutex::new(format!("task[{id}]")),
            state: Mutex::new(("new".to_string(), Instant::now())),
            owner: Mutex::new(None),
            coro: UnsafeCell::new(coro),
            aux: UnsafeCell::new(TaskAux {
                yielder: std::ptr::null(),
                timeouts: Vec::new(),
                migrate_to: None,
            }),
        })
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    /// Set `flags`, returning whether any of them were already set.
    pub(crate) fn set_flag(&self, flags: TaskFlags) -> bool {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel) & flags.bits() != 0
    }

    /// Clear `flags`, returning whether any of them were set.
    pub(crate) fn take_flag(&self, flags: TaskFlags) -> bool {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel) & flags.bits() != 0
    }

    pub(crate) fn test_flag(&self, flags: TaskFlags) -> bool {
        self.flags.load(Ordering::Acquire) & flags.bits() != 0
    }

    pub(crate) fn owner(&self) -> Option<ProcId> {
        *self.owner.lock()
    }

    pub(crate) fn set_owner(&self, owner: Option<ProcId>) {
        *self.owner.lock() = owner;
    }

    pub(crate) fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub(crate) fn set_name(&self, name: String) {
        *self.name.lock() = name;
    }

    pub(crate) fn state(&self) -> (String, Instant) {
        self.state.lock().clone()
    }

    pub(crate) fn set_state(&self, state: &str) {
        *self.state.lock() = (state.to_string(), Instant::now());
    }

    /// # Safety
    /// Only the thread of the scheduler that currently owns the task may
    /// call this, and the returned reference must not be held across a
    /// suspension.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn aux(&self) -> &mut TaskAux {
        &mut *self.aux.get()
    }

    /// # Safety
    /// As for [`TaskInner::aux`]; additionally the caller must not already
    /// hold the coroutine reference (the scheduler only takes it while the
    /// task is not inside `aux`-touching code of its own).
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn coro_mut(&self) -> &mut Option<Coro> {
        &mut *self.coro.get()
    }

    /// Runs on the task's own stack immediately after every swap-in: convert
    /// a pending cancellation into `Interrupted` (once), then drain expired
    /// timeouts in deadline order, surfacing a deadline payload if one fired.
    pub(crate) fn check_injection(&self) -> Result<()> {
        if self.test_flag(TaskFlags::CANCELED) && !self.test_flag(TaskFlags::UNWINDING) {
            self.set_flag(TaskFlags::UNWINDING);
            tracing::trace!(task = %self.id, "injecting interrupt");
            return Err(Error::Interrupted);
        }

        loop {
            let now = sched::procnow();
            // Safety: we are running on the owning scheduler's thread.
            let expired = {
                let aux = unsafe { self.aux() };
                match aux.timeouts.first() {
                    Some(pending) if pending.when <= now => Some(aux.timeouts.remove(0)),
                    _ => None,
                }
            };
            let Some(pending) = expired else {
                return Ok(());
            };
            // The heap entry may already have been popped by expiry.
            sched::with_proc(|p| p.cancel_timer(pending.token));
            if pending.kind == TimeoutKind::Deadline {
                tracing::trace!(task = %self.id, "injecting deadline");
                return Err(Error::DeadlineReached);
            }
        }
    }
}

impl std::fmt::Debug for TaskInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// Process-wide id → task map, serving cross-thread [`cancel`].
fn registry() -> &'static DashMap<u64, Weak<TaskInner>> {
    static TASKS: OnceLock<DashMap<u64, Weak<TaskInner>>> = OnceLock::new();
    TASKS.get_or_init(DashMap::new)
}

pub(crate) fn lookup(id: TaskId) -> Option<TaskRef> {
    registry().get(&id.as_u64()).and_then(|weak| weak.upgrade())
}

pub(crate) fn unregister(id: TaskId) {
    registry().remove(&id.as_u64());
}

/// Spawn a task with the default stack size and mark it ready on the current
/// scheduler. Returns the new task's id.
pub fn spawn<F>(f: F) -> Result<TaskId>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    spawn_with_stack(f, DEFAULT_STACK_SIZE)
}

/// As [`spawn`], with a caller-chosen stack size. Dialing tasks should use
/// [`DIAL_STACK_SIZE`].
pub fn spawn_with_stack<F>(f: F, stack_bytes: usize) -> Result<TaskId>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let coro = Coro::new(stack_bytes, move |yielder| {
        let task = sched::current_task();
        // Safety: entry runs on the owning scheduler's thread; the yielder
        // stays valid until the coroutine completes.
        unsafe { task.aux() }.yielder = yielder;

        match f() {
            Ok(()) => {}
            Err(e) if e.is_injected() => {
                tracing::debug!(task = %task.id(), error = %e, "task unwound")
            }
            Err(e) => tracing::error!(task = %task.id(), error = %e, "task failed"),
        }

        task.set_state("exiting");
        task.set_flag(TaskFlags::EXITING);
        // Returning swaps to the event loop one last time; the scheduler
        // destroys the task there (it cannot be destroyed on its own stack).
    })
    .map_err(Error::Io)?;

    let task = TaskInner::new(Some(coro));
    let id = task.id();
    registry().insert(id.as_u64(), Arc::downgrade(&task));
    sched::adopt_and_ready(task);
    Ok(id)
}

/// Requeue the current task behind everything already ready and swap to the
/// scheduler.
pub fn yield_now() -> Result<()> {
    let task = sched::current_task();
    sched::ready(&task);
    task.set_state("yield");
    sched::suspend()
}

/// Park the current task for `dur` (millisecond resolution).
pub fn sleep(dur: Duration) -> Result<()> {
    let task = sched::current_task();
    let token = sched::add_timeout(&task, dur, TimeoutKind::Wake);
    task.set_state("sleep");
    let res = sched::suspend();
    sched::cancel_timeout(&task, token);
    res
}

/// Flag the task `id` as canceled and make it ready so the cancellation is
/// observed at its next swap-in. May be called from any thread. Returns
/// `false` if no live task has that id; canceling an exiting task is a
/// no-op.
pub fn cancel(id: TaskId) -> bool {
    let Some(task) = lookup(id) else {
        return false;
    };
    task.set_flag(TaskFlags::CANCELED);
    tracing::trace!(task = %id, "cancel requested");
    sched::ready(&task);
    true
}

/// Id of the currently running task.
///
/// # Panics
/// Panics when called from outside a task.
pub fn id() -> TaskId {
    sched::current_task().id()
}

/// As [`id`], returning `None` outside a task.
pub fn try_id() -> Option<TaskId> {
    sched::try_current_task().map(|t| t.id())
}

/// Set the current task's diagnostic name.
pub fn set_name(name: impl Into<String>) {
    sched::current_task().set_name(name.into());
}

/// Set the current task's diagnostic state string.
pub fn set_state(state: impl Into<String>) {
    sched::current_task().set_state(&state.into());
}

/// Mark the current task as a systask: it no longer counts toward the
/// scheduler's shutdown census.
pub fn system() {
    let task = sched::current_task();
    if !task.set_flag(TaskFlags::SYSTASK) {
        sched::with_proc(|p| p.shared().dec_user_tasks());
    }
}

/// Move the current task to another scheduler: the one identified by `to`,
/// or, when `None`, the least-loaded other scheduler (a new one is started
/// if there is none). The task resumes on the destination.
pub fn migrate(to: Option<ProcId>) -> Result<()> {
    let task = sched::current_task();
    // Safety: running on the owning scheduler's thread.
    unsafe { task.aux() }.migrate_to = Some(to);
    task.set_flag(TaskFlags::MIGRATING);
    task.set_state("migrate");
    sched::suspend()
}

/// A multi-line listing of every task on the current scheduler:
/// `{id, name, state, elapsed-since-state-change}`.
pub fn dump() -> String {
    sched::with_proc(|p| p.dump())
}

/// Write [`dump`] to `w`.
pub fn dump_to(w: &mut impl io::Write) -> io::Result<()> {
    w.write_all(dump().as_bytes())?;
    w.flush()
}

/// A bare task record for unit tests of scheduler internals; it has no
/// stack and must never be resumed.
#[cfg(test)]
pub(crate) fn test_task() -> TaskRef {
    TaskInner::new(None)
}
