//! Scoped deadlines.
//!
//! Arming a [`Deadline`] installs a deadline-reached timeout on the current
//! task; dropping it removes the timeout. If the deadline trips while the
//! task is suspended, the suspension it is parked in returns
//! [`Error::DeadlineReached`](crate::Error::DeadlineReached) at resumption.
//! Nothing is injected while the task is running: the payload is observed
//! the next time the task swaps in.

use std::time::{Duration, Instant};

use crate::sched;
use crate::sched::timer::TimeoutKind;
use crate::task::TaskRef;

pub struct Deadline {
    task: TaskRef,
    token: u64,
    when: Instant,
    armed: bool,
}

impl Deadline {
    /// Arm a deadline `dur` from now on the current task.
    ///
    /// The deadline must be dropped on the scheduler that armed it: arming
    /// and then migrating with the deadline still in scope is not supported.
    pub fn new(dur: Duration) -> Self {
        let task = sched::current_task();
        let token = sched::add_timeout(&task, dur, TimeoutKind::Deadline);
        Self {
            when: sched::procnow() + dur,
            task,
            token,
            armed: true,
        }
    }

    /// Time left before the deadline trips; zero once it has.
    pub fn remaining(&self) -> Duration {
        if self.armed {
            self.when.saturating_duration_since(Instant::now())
        } else {
            Duration::ZERO
        }
    }

    /// Disarm without waiting for scope exit.
    pub fn cancel(&mut self) {
        if self.armed {
            self.armed = false;
            sched::cancel_timeout(&self.task, self.token);
        }
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Deadline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deadline")
            .field("armed", &self.armed)
            .field("remaining", &self.remaining())
            .finish()
    }
}
