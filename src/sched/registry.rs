//! Process-wide registry of live schedulers.
//!
//! Serves cross-thread wakeups (`ready` on a task owned elsewhere) and the
//! destination choice for explicit migration: a named scheduler, the least
//! loaded other one, or a freshly spawned one.

use std::sync::{Arc, OnceLock};
use std::thread;

use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::task::{ProcId, TaskFlags, TaskRef};

use super::{Proc, ProcShared};

fn procs() -> &'static DashMap<u64, Arc<ProcShared>> {
    static PROCS: OnceLock<DashMap<u64, Arc<ProcShared>>> = OnceLock::new();
    PROCS.get_or_init(DashMap::new)
}

pub(crate) fn register(shared: Arc<ProcShared>) {
    procs().insert(shared.id.as_u64(), shared);
}

pub(crate) fn unregister(id: ProcId) {
    procs().remove(&id.as_u64());
}

pub(crate) fn get(id: ProcId) -> Option<Arc<ProcShared>> {
    procs().get(&id.as_u64()).map(|e| e.value().clone())
}

/// The scheduler with the fewest user tasks, excluding `exclude`.
pub(crate) fn pick_least_loaded(exclude: ProcId) -> Option<Arc<ProcShared>> {
    procs()
        .iter()
        .filter(|e| e.value().id != exclude)
        .min_by_key(|e| e.value().load())
        .map(|e| e.value().clone())
}

/// Start a new scheduler thread whose first work is the migrated `task`.
/// The task is enqueued before the thread starts, so the new loop cannot
/// decide it is idle and exit early.
pub(crate) fn spawn_proc_for(task: TaskRef) -> Result<ProcId> {
    let (shared, wake_rx) = ProcShared::new().map_err(Error::Io)?;
    let id = shared.id;
    register(shared.clone());

    task.set_owner(Some(id));
    if !task.test_flag(TaskFlags::SYSTASK) {
        shared.inc_user_tasks();
    }
    task.set_flag(TaskFlags::ADOPT);
    shared.enqueue(task.clone());
    tracing::debug!(task = %task.id(), proc = %id, "spawning scheduler for migrated task");

    thread::Builder::new()
        .name(format!("weft-{id}"))
        .spawn(move || {
            let proc = match Proc::attach(shared, wake_rx) {
                Ok(p) => p,
                Err(e) => {
                    unregister(id);
                    tracing::error!(proc = %id, error = %e, "scheduler thread failed to start");
                    return;
                }
            };
            if let Err(e) = proc.run_loop() {
                tracing::error!(proc = %id, error = %e, "scheduler loop failed");
            }
            proc.shutdown();
        })
        .map_err(Error::Io)?;

    Ok(id)
}
