use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::task;
use crate::task::TaskFlags;

use super::*;

/// First resumption order equals the order of first ready (spawn order).
#[test]
fn tasks_first_run_in_spawn_order() {
    crate::run(|| {
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in 0..5u32 {
            let order = order.clone();
            task::spawn(move || {
                order.lock().unwrap().push(label);
                Ok(())
            })?;
        }
        task::yield_now()?;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        Ok(())
    })
    .unwrap();
}

/// A second ready while a task is queued is a no-op: the run queue never
/// holds duplicates.
#[test]
fn duplicate_ready_is_a_noop() {
    crate::run(|| {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs2 = runs.clone();
        let id = task::spawn(move || {
            runs2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })?;

        let queued = task::lookup(id).expect("task is live");
        assert!(queued.test_flag(TaskFlags::READY));
        ready(&queued);
        ready(&queued);

        task::yield_now()?;
        task::yield_now()?;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        Ok(())
    })
    .unwrap();
}

#[test]
fn sleep_wakes_close_to_its_deadline() {
    crate::run(|| {
        let start = Instant::now();
        task::sleep(Duration::from_millis(50))?;
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(45) && elapsed < Duration::from_millis(400),
            "slept {elapsed:?}, wanted ~50ms"
        );
        Ok(())
    })
    .unwrap();
}

/// Canceling a sleeping task is observed at its next swap-in, well inside
/// the sleep it would otherwise finish.
#[test]
fn cancel_interrupts_a_sleeping_task() {
    crate::run(|| {
        let observed = Arc::new(AtomicUsize::new(0));
        let observed2 = observed.clone();
        let id = task::spawn(move || {
            let res = task::sleep(Duration::from_secs(10));
            if matches!(res, Err(Error::Interrupted)) {
                observed2.fetch_add(1, Ordering::SeqCst);
            }
            res
        })?;

        task::sleep(Duration::from_millis(20))?; // target is parked now
        let start = Instant::now();
        assert!(task::cancel(id));

        while observed.load(Ordering::SeqCst) == 0 {
            task::sleep(Duration::from_millis(5))?;
        }
        assert!(start.elapsed() < Duration::from_secs(1));
        Ok(())
    })
    .unwrap();
}

#[test]
fn cancel_of_unknown_id_returns_false() {
    crate::run(|| {
        let id = task::spawn(|| Ok(()))?;
        task::yield_now()?; // let it exit and be destroyed
        assert!(!task::cancel(id));
        Ok(())
    })
    .unwrap();
}

/// A task that never suspends again never observes its cancellation.
#[test]
fn cancel_without_suspension_is_never_observed() {
    crate::run(|| {
        let finished = Arc::new(AtomicUsize::new(0));
        let finished2 = finished.clone();
        let id = task::spawn(move || {
            finished2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })?;
        // Flag it before it first runs; with no suspension inside the body
        // the flag is simply never delivered.
        assert!(task::cancel(id));
        task::yield_now()?;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        Ok(())
    })
    .unwrap();
}

/// fdwait returns ready when readiness arrives first, timed-out when the
/// deadline wins.
#[test]
fn fdwait_distinguishes_ready_from_timeout() {
    crate::run(|| {
        let (rx, tx) = poller::wake_pipe().map_err(Error::Io)?;
        use std::os::fd::AsRawFd;

        // Deadline first: nothing ever lands on the pipe.
        let start = Instant::now();
        let ready = fdwait(
            rx.as_raw_fd(),
            Interest::READABLE,
            Some(Duration::from_millis(50)),
        )?;
        assert!(!ready, "nothing was written, must time out");
        assert!(start.elapsed() >= Duration::from_millis(45));

        // Readiness first: a writer task fills the pipe while we wait.
        let writer_tx = tx;
        task::spawn(move || {
            task::sleep(Duration::from_millis(10))?;
            poller::wake(&writer_tx);
            Ok(())
        })?;
        let ready = fdwait(
            rx.as_raw_fd(),
            Interest::READABLE,
            Some(Duration::from_secs(5)),
        )?;
        assert!(ready, "writer task made the pipe readable");
        Ok(())
    })
    .unwrap();
}

/// The multi-fd entry point reports which descriptors are ready; a pure
/// timeout reports zero and leaves revents empty.
#[test]
fn poll_reports_ready_descriptor_count() {
    crate::run(|| {
        use std::os::fd::AsRawFd;
        let (quiet_rx, _quiet_tx) = poller::wake_pipe().map_err(Error::Io)?;
        let (loud_rx, loud_tx) = poller::wake_pipe().map_err(Error::Io)?;
        poller::wake(&loud_tx);

        let mut descs = [
            PollDesc::new(quiet_rx.as_raw_fd(), Interest::READABLE),
            PollDesc::new(loud_rx.as_raw_fd(), Interest::READABLE),
        ];
        let n = poll(&mut descs, Some(Duration::from_secs(5)))?;
        assert_eq!(n, 1);
        assert!(descs[0].revents.is_empty());
        assert!(descs[1].revents.contains(Interest::READABLE));

        // Timeout path: nothing ready, count is zero.
        let mut descs = [PollDesc::new(quiet_rx.as_raw_fd(), Interest::READABLE)];
        let n = poll(&mut descs, Some(Duration::from_millis(20)))?;
        assert_eq!(n, 0);
        Ok(())
    })
    .unwrap();
}

/// run() returns once the last non-systask exits, even with a systask still
/// parked in a long sleep.
#[test]
fn scheduler_exits_when_user_census_reaches_zero() {
    let start = Instant::now();
    crate::run(|| {
        task::spawn(|| {
            task::system();
            // Parked far beyond the test horizon; shutdown unwinds it.
            let _ = task::sleep(Duration::from_secs(600));
            Ok(())
        })?;
        task::sleep(Duration::from_millis(20))?;
        Ok(())
    })
    .unwrap();
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[test]
fn migrate_moves_the_task_to_the_named_scheduler() {
    let seen = Arc::new(Mutex::new(None));
    let seen2 = seen.clone();

    // A second scheduler kept alive by a parked task long enough for the
    // migration to land.
    let sibling = crate::spawn_thread(|| {
        task::sleep(Duration::from_millis(500))?;
        Ok(())
    })
    .unwrap();
    let sibling_id = sibling.id();

    crate::run(move || {
        let home = current_id();
        assert_ne!(home, sibling_id);

        task::migrate(Some(sibling_id))?;
        *seen2.lock().unwrap() = Some(current_id());
        Ok(())
    })
    .unwrap();

    // The home scheduler exits as soon as the task leaves it; the sibling
    // only finishes once the migrated task has run there.
    sibling.join().unwrap();
    assert_eq!(*seen.lock().unwrap(), Some(sibling_id));
}

#[test]
fn migrate_with_no_target_spawns_or_picks_another_scheduler() {
    let moved = Arc::new(Mutex::new(None));
    let moved2 = moved.clone();

    crate::run(move || {
        let home = current_id();
        task::migrate(None)?;
        *moved2.lock().unwrap() = Some((home, current_id()));
        Ok(())
    })
    .unwrap();

    // run() returns the moment the task leaves its home scheduler; give the
    // destination a beat to resume it.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some((home, landed)) = *moved.lock().unwrap() {
            assert_ne!(home, landed, "migration must leave the home scheduler");
            break;
        }
        assert!(Instant::now() < deadline, "migrated task never resumed");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn dump_lists_tasks_with_name_and_state() {
    crate::run(|| {
        task::spawn(|| {
            task::set_name("dozer");
            task::sleep(Duration::from_millis(100))?;
            Ok(())
        })?;
        task::sleep(Duration::from_millis(20))?; // dozer is asleep now

        let listing = task::dump();
        assert!(listing.contains("dozer"), "got:\n{listing}");
        assert!(listing.contains("sleep"), "got:\n{listing}");
        Ok(())
    })
    .unwrap();
}

/// Nested runtimes on one thread are refused.
#[test]
fn nested_run_is_an_error() {
    crate::run(|| {
        let res = crate::run(|| Ok(()));
        assert!(res.is_err());
        Ok(())
    })
    .unwrap();
}
