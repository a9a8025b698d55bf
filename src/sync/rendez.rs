//! Rendez: a condition-variable-like primitive used with a held qutex.
//!
//! Waiters are tasks, queued FIFO behind a thread-level mutex; `wakeup`
//! re-queues the longest-waiting task on its own scheduler, crossing
//! scheduler boundaries through the wake pipe when needed.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::sched;
use crate::sync::qutex::QutexGuard;
use crate::task::TaskRef;

#[derive(Default)]
pub struct Rendez {
    waiting: Mutex<VecDeque<TaskRef>>,
}

impl Rendez {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release `guard`, wait to be woken, then re-acquire the qutex. As with
    /// any condition wait, the caller must re-check its predicate: a wakeup
    /// may race with another task claiming the condition first.
    ///
    /// On an injected failure (cancellation, deadline) the task is removed
    /// from the waiter list and the error propagates; the qutex is NOT
    /// re-acquired, since the unwinding task has no use for it.
    pub fn wait<'a, T>(&self, guard: QutexGuard<'a, T>) -> Result<QutexGuard<'a, T>> {
        let me = sched::current_task();
        let qutex = guard.qutex();

        // Release first, then queue: a wakeup issued in between is lost, but
        // the predicate loop the caller runs makes that benign.
        drop(guard);
        {
            let mut w = self.waiting.lock();
            if !w.iter().any(|t| Arc::ptr_eq(t, &me)) {
                w.push_back(me.clone());
            }
        }

        me.set_state("rendez");
        match sched::suspend() {
            Ok(()) => qutex.lock(),
            Err(e) => {
                let mut w = self.waiting.lock();
                if let Some(at) = w.iter().position(|t| Arc::ptr_eq(t, &me)) {
                    w.remove(at);
                }
                Err(e)
            }
        }
    }

    /// Wake the longest-waiting task, if any. It will contend for the qutex
    /// when it runs.
    pub fn wakeup(&self) {
        let woken = self.waiting.lock().pop_front();
        if let Some(task) = woken {
            tracing::trace!(task = %task.id(), "rendez wakeup");
            sched::ready(&task);
        }
    }

    /// Wake every waiting task.
    pub fn wakeup_all(&self) {
        let woken: Vec<TaskRef> = self.waiting.lock().drain(..).collect();
        for task in woken {
            sched::ready(&task);
        }
    }
}

impl Drop for Rendez {
    fn drop(&mut self) {
        // Dropping a rendez with parked tasks would strand them.
        assert!(
            self.waiting.get_mut().is_empty(),
            "rendez dropped with tasks still waiting"
        );
    }
}

impl std::fmt::Debug for Rendez {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rendez").finish_non_exhaustive()
    }
}
