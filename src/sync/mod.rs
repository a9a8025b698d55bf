//! Synchronization primitives whose waiters are tasks, not threads.

mod deadline;
mod qutex;
mod rendez;

pub use deadline::Deadline;
pub use qutex::{Qutex, QutexGuard};
pub use rendez::Rendez;
