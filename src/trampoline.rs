//! A platform-provided single-job FIFO used to bound host-stack depth across synchronous
//! callback chains.
//!
//! Every [`crate::config::DEFAULT_MAX_STACK_DEPTH`] re-entries of the async boundary, the next
//! re-entry is scheduled here instead of being invoked directly. A thread-local queue is
//! sufficient: the async boundary only ever trampolines onto the thread that is currently
//! driving the synchronous callback chain that triggered the re-entry in the first place.

use std::cell::RefCell;
use std::collections::VecDeque;

type Job = Box<dyn FnOnce() + Send>;

thread_local! {
    static QUEUE: RefCell<VecDeque<Job>> = const { RefCell::new(VecDeque::new()) };
    static DRAINING: RefCell<bool> = const { RefCell::new(false) };
}

/// Schedules `job` to run on this thread, after the currently-executing synchronous callback
/// chain unwinds to the nearest trampoline boundary.
///
/// If no drain is currently in progress on this thread, this call itself becomes the drain loop
/// (so a single `schedule` from ordinary code still runs synchronously, just after any jobs
/// queued ahead of it); if a drain is already in progress (we're being called from inside a job),
/// the job is simply enqueued and the outer drain loop will pick it up, which is what actually
/// bounds the host-stack depth.
pub(crate) fn schedule(job: Job) {
    QUEUE.with(|q| q.borrow_mut().push_back(job));

    let already_draining = DRAINING.with(|d| *d.borrow());
    if already_draining {
        return;
    }

    DRAINING.with(|d| *d.borrow_mut() = true);
    loop {
        let next = QUEUE.with(|q| q.borrow_mut().pop_front());
        match next {
            Some(job) => job(),
            None => break,
        }
    }
    DRAINING.with(|d| *d.borrow_mut() = false);
}
