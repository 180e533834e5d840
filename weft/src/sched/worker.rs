//! The worker control block and worker main loop.
//!
//! A worker is one OS thread that runs tasks. Each worker owns a
//! bootstrap task (`g0`) whose "stack" is the OS thread stack itself; all
//! scheduler code runs there, reached by switching off whatever task
//! stack is current. Workers are created on first unmet demand and never
//! destroyed.

use std::cell::{Cell, UnsafeCell};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::AtomicI32;

use crate::platform::context::current_sp;
use crate::platform::{self, Note};
use crate::sched::task::Task;

pub struct Worker {
    pub(crate) id: i32,
    /// Bootstrap task: holds the resume point on the OS thread stack from
    /// which every scheduler entry runs.
    pub(crate) g0: Arc<Task>,

    /// Task currently running on this worker.
    pub(crate) curg: UnsafeCell<Option<Arc<Task>>>,

    // Direct hand-off slot: written under the scheduler lock, consumed by
    // this worker after its note fires.
    pub(crate) nextg: UnsafeCell<Option<Arc<Task>>>,
    pub(crate) wait_nextg: Cell<bool>,
    pub(crate) have_nextg: Note,

    /// Wiring: task that must run on this worker.
    pub(crate) locked_g: UnsafeCell<Option<Arc<Task>>>,
    /// This worker's private idle task, parked until nothing else runs.
    pub(crate) idle_g: UnsafeCell<Option<Arc<Task>>>,

    pub(crate) mallocing: Cell<bool>,
    pub(crate) gcing: Cell<bool>,
    /// Lock-depth diagnostic; yielding while non-zero is fatal.
    pub(crate) locks: AtomicI32,

    pub(crate) profile_hz: Cell<i32>,

    /// Return value in flight from a retiring stack segment.
    pub(crate) cret: Cell<usize>,

    /// Per-worker cache of fixed-size stack segments.
    pub(crate) stack_cache: UnsafeCell<Vec<NonNull<u8>>>,
}

// A worker's interior-mutable fields are owned by its OS thread; the
// hand-off slots are written only under the scheduler lock while the
// worker is parked.
unsafe impl Sync for Worker {}

impl Worker {
    /// Allocate a worker. Workers live forever, so the allocation leaks
    /// by design.
    pub(crate) fn new(id: i32) -> &'static Worker {
        Box::leak(Box::new(Worker {
            id,
            g0: Arc::new(Task::new()),
            curg: UnsafeCell::new(None),
            nextg: UnsafeCell::new(None),
            wait_nextg: Cell::new(false),
            have_nextg: Note::new(),
            locked_g: UnsafeCell::new(None),
            idle_g: UnsafeCell::new(None),
            mallocing: Cell::new(false),
            gcing: Cell::new(false),
            locks: AtomicI32::new(0),
            profile_hz: Cell::new(0),
            cret: Cell::new(0),
            stack_cache: UnsafeCell::new(Vec::new()),
        }))
    }

    pub fn id(&self) -> i32 {
        self.id
    }
}

/// Worker entry: runs on the worker's own OS thread and never returns.
pub(crate) fn mstart(w: &'static Worker) -> ! {
    platform::set_current_worker(w);

    // Record the bootstrap resume point. Once schedule runs we are never
    // coming back here, so later scheduler entries reuse this stack space
    // from the same position. The bootstrap context is entered with a
    // fresh call, never resumed, so only sp matters.
    unsafe {
        let ctx = w.g0.sched.get();
        (*ctx).sp = ((current_sp() - 64) & !0xF) as *mut u8;
        (*ctx).pc = usize::MAX;
        (*ctx).task = Arc::as_ptr(&w.g0) as *mut Task;
    }

    log::debug!("worker w{} started", w.id);
    crate::sched::schedule(None)
}
