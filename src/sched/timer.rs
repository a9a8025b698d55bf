//! Time-ordered timeout heap.
//!
//! A sorted vector keyed by deadline; ties keep insertion order. The head's
//! deadline bounds how long the event loop may block in the poller. Entries
//! only wake their task; deadline payloads are delivered from the task's own
//! pending list when it swaps back in.

use std::time::Instant;

use crate::task::TaskRef;

/// What expiry delivers to the owning task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeoutKind {
    /// Just wake the task (sleep, fdwait deadline).
    Wake,
    /// Raise `Error::DeadlineReached` on the task at resumption.
    Deadline,
}

struct Entry {
    token: u64,
    when: Instant,
    task: TaskRef,
}

pub(crate) struct TimerHeap {
    entries: Vec<Entry>,
    next_token: u64,
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_token: 1,
        }
    }

    /// Insert a deadline for `task`, returning a token for cancellation.
    pub(crate) fn add(&mut self, task: TaskRef, when: Instant) -> u64 {
        let token = self.next_token;
        self.next_token += 1;

        // partition_point with <= keeps equal deadlines in insertion order.
        let at = self.entries.partition_point(|e| e.when <= when);
        self.entries.insert(at, Entry { token, when, task });
        token
    }

    /// Remove the entry for `token` if it is still pending. Expired entries
    /// have already been popped, so a miss is not an error.
    pub(crate) fn cancel(&mut self, token: u64) -> bool {
        match self.entries.iter().position(|e| e.token == token) {
            Some(at) => {
                self.entries.remove(at);
                true
            }
            None => false,
        }
    }

    /// Pop every entry with `when <= now`, in deadline order, and return the
    /// tasks to wake.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Vec<TaskRef> {
        let end = self.entries.partition_point(|e| e.when <= now);
        self.entries.drain(..end).map(|e| e.task).collect()
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|e| e.when)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
