//! Thin wrapper over stackful coroutines.
//!
//! A [`Coro`] owns a fixed-size stack chosen by the caller and swaps execution
//! between that stack and the scheduler's own stack. Suspension can happen at
//! any call depth: the entry closure receives a yielder whose address is
//! stashed in the task record so nested frames can reach it.

use std::io;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult};

/// The yielder type tasks use to swap back to their scheduler.
pub(crate) type TaskYielder = corosensei::Yielder<(), ()>;

pub(crate) struct Coro {
    inner: Coroutine<(), (), ()>,
}

impl Coro {
    /// Allocate a `stack_bytes` stack and arrange for `f` to run on it at the
    /// first resume. `f` must be `Send`: a suspended coroutine may be resumed
    /// from a different OS thread after an explicit migration.
    pub(crate) fn new<F>(stack_bytes: usize, f: F) -> io::Result<Self>
    where
        F: FnOnce(&TaskYielder) + Send + 'static,
    {
        let stack = DefaultStack::new(stack_bytes)?;
        Ok(Self {
            inner: Coroutine::with_stack(stack, move |yielder, ()| f(yielder)),
        })
    }

    /// Swap to the coroutine's stack. Returns `true` once the entry closure
    /// has returned; the coroutine must not be resumed again after that.
    pub(crate) fn resume(&mut self) -> bool {
        matches!(self.inner.resume(()), CoroutineResult::Return(()))
    }
}

impl std::fmt::Debug for Coro {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coro").finish_non_exhaustive()
    }
}

// Dropping a suspended Coro force-unwinds its stack, so destructors on the
// task stack run even when the scheduler shuts down with live tasks.
