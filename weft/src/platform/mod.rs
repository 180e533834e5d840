//! Platform primitives: one-shot notes, OS thread creation, and the
//! thread-local current-worker pointer. The context-switch primitive
//! lives in [`context`].

pub mod context;

#[cfg(not(target_arch = "x86_64"))]
compile_error!("weft's context-switch primitive is implemented for x86_64 only");

use std::cell::Cell;
use std::sync::{Condvar, Mutex};
use std::thread;

use crate::sched::worker::Worker;

/// One-shot wait/wake primitive.
///
/// The contract is strict: at most one thread sleeps on a note at a time,
/// and each `wakeup` unblocks exactly one `sleep` (a `wakeup` before the
/// `sleep` makes that `sleep` return immediately). `clear` re-arms the
/// note for the next round.
pub struct Note {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Note {
    pub const fn new() -> Note {
        Note {
            set: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn clear(&self) {
        *self.set.lock().unwrap() = false;
    }

    pub fn sleep(&self) {
        let mut set = self.set.lock().unwrap();
        while !*set {
            set = self.cond.wait(set).unwrap();
        }
    }

    pub fn wakeup(&self) {
        *self.set.lock().unwrap() = true;
        self.cond.notify_one();
    }
}

thread_local! {
    static CURRENT_WORKER: Cell<Option<&'static Worker>> = const { Cell::new(None) };
}

pub(crate) fn set_current_worker(w: &'static Worker) {
    CURRENT_WORKER.with(|c| c.set(Some(w)));
}

pub(crate) fn try_current_worker() -> Option<&'static Worker> {
    CURRENT_WORKER.with(|c| c.get())
}

pub(crate) fn current_worker() -> &'static Worker {
    try_current_worker().unwrap_or_else(|| crate::throw("not running on a scheduler worker"))
}

/// Start a named OS thread for a worker. Workers are never destroyed, so
/// the join handle is dropped.
pub(crate) fn spawn_thread(name: String, f: impl FnOnce() + Send + 'static) {
    if let Err(err) = thread::Builder::new().name(name).spawn(f) {
        log::error!("worker thread creation failed: {err}");
        crate::throw("out of OS threads");
    }
}

#[cfg(test)]
mod tests {
    use super::Note;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn note_wakeup_before_sleep_returns_immediately() {
        let note = Note::new();
        note.clear();
        note.wakeup();
        note.sleep();
    }

    #[test]
    fn note_wakeup_unblocks_sleeper() {
        let note = Arc::new(Note::new());
        note.clear();
        let sleeper = {
            let note = Arc::clone(&note);
            thread::spawn(move || note.sleep())
        };
        note.wakeup();
        sleeper.join().unwrap();
    }

    #[test]
    fn note_clear_rearms() {
        let note = Note::new();
        note.wakeup();
        note.sleep();
        note.clear();
        note.wakeup();
        note.sleep();
    }
}
