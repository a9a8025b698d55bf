//! # weft — cooperatively scheduled tasks over per-thread event loops
//!
//! `weft` multiplexes many lightweight stackful tasks onto one OS thread per
//! scheduler, turning blocking-style socket code into cooperative suspensions
//! keyed on descriptor readiness and deadlines.
//!
//! ## Usage
//! Enter the runtime with [`run`], which drives the calling thread's
//! scheduler until every non-systask has exited.
//!
//! * [`task`] — spawn, yield, sleep, cancel, migrate, diagnostics.
//! * [`sync`] — [`sync::Qutex`] (FIFO-fair task mutex), [`sync::Rendez`]
//!   (condition wait), [`sync::Deadline`] (scoped timeout).
//! * [`net`] — [`net::NetSock`] (dial/connect/accept/recv/send) and
//!   [`net::NetServer`] (multi-threaded accept loops with backoff).
//! * [`sched`] — [`sched::fdwait`] and multi-fd [`sched::poll`] for custom
//!   descriptor waits; [`spawn_thread`] for extra schedulers.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! fn main() -> weft::Result<()> {
//!     weft::run(|| {
//!         weft::task::spawn(|| {
//!             weft::task::sleep(Duration::from_millis(10))?;
//!             println!("hello from a task");
//!             Ok(())
//!         })?;
//!         Ok(())
//!     })
//! }
//! ```

mod coro;
mod error;

pub mod net;
pub mod sched;
pub mod sync;
pub mod task;

pub use error::{Error, Result};
pub use sched::{run, spawn_thread};
