//! The task control block.
//!
//! A `Task` is one lightweight execution: a growable segmented stack, a
//! saved execution context, and the scheduler bookkeeping to move it
//! between the run queue, a worker, and the dead-task free list.
//!
//! Ownership protocol: a task is mutated either by the worker currently
//! running it, or under the scheduler lock while it is not running.
//! The `Cell`/`UnsafeCell` fields rely on that protocol; the atomics
//! (`status`, `flags`, `m`) are the fields that legitimately race with
//! `ready` and the syscall paths.

use std::cell::{Cell, UnsafeCell};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use atomic_enum::atomic_enum;
use bitflags::bitflags;

use crate::consts::STACK_GUARD;
use crate::panicking::{Defer, Panic};
use crate::platform::context::Context;
use crate::sched::worker::Worker;

/// Entry point of a spawned task. Receives a pointer to the argument
/// block copied onto its stack at spawn time.
pub type TaskEntry = unsafe extern "sysv64" fn(*mut u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn new(raw: u64) -> Self {
        TaskId(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for TaskId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[atomic_enum]
#[derive(PartialEq, Eq)]
pub enum TaskStatus {
    Idle,
    Runnable,
    Running,
    Syscall,
    Waiting,
    Moribund,
    Dead,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u32 {
        /// Wake this task again the next time it parks in the scheduler.
        /// Set by `ready` on a task that is still on a worker, and by the
        /// `exit_syscall` slow path.
        const READY_ON_STOP = 1 << 0;
        /// A panic is draining this task's defer list; the next segment
        /// installed by frame growth is marked as a panic segment.
        const IS_PANIC = 1 << 1;
    }
}

pub struct Task {
    pub(crate) id: Cell<TaskId>,
    pub(crate) status: AtomicTaskStatus,

    /// Saved execution context, written by the owning worker at each
    /// suspension point.
    pub(crate) sched: UnsafeCell<Context>,
    pub(crate) entry: Cell<Option<TaskEntry>>,
    /// PC of the spawn call that created this task (diagnostics only).
    pub(crate) spawn_pc: Cell<usize>,

    // Stack spine. `stack0` is the initial allocation, kept for free-list
    // validation; `stack_base` points at the top segment's header.
    pub(crate) stack0: Cell<*mut u8>,
    pub(crate) stack_base: Cell<*mut u8>,
    pub(crate) stack_guard: Cell<*mut u8>,

    // Stack extent snapshot taken at syscall entry so a collector can
    // scan a task not currently bound to a worker. Cleared on re-entry.
    pub(crate) gc_sp: Cell<*mut u8>,
    pub(crate) gc_stack: Cell<*mut u8>,
    pub(crate) gc_guard: Cell<*mut u8>,

    /// Worker currently running this task, null otherwise. Written by the
    /// dispatching worker, read under the scheduler lock by `ready`.
    pub(crate) m: AtomicPtr<Worker>,
    /// Wiring: this task runs only on this worker.
    pub(crate) locked_m: Cell<Option<&'static Worker>>,
    /// Set when this task is a worker's dedicated idle task.
    pub(crate) idle_m: Cell<Option<&'static Worker>>,

    pub(crate) flags: AtomicU32,
    pub(crate) wait_reason: Cell<&'static str>,

    // Heads of the deferred-call and panic-record lists (LIFO).
    pub(crate) defers: Cell<*mut Defer>,
    pub(crate) panics: Cell<*mut Panic>,

    /// Segment staged for reclamation by retirement; freed once execution
    /// has resumed on the previous segment.
    pub(crate) pending_free: Cell<Option<(NonNull<u8>, usize)>>,
}

// See the ownership protocol in the module docs.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    pub(crate) fn new() -> Task {
        Task {
            id: Cell::new(TaskId(0)),
            status: AtomicTaskStatus::new(TaskStatus::Idle),
            sched: UnsafeCell::new(Context::zeroed()),
            entry: Cell::new(None),
            spawn_pc: Cell::new(0),
            stack0: Cell::new(ptr::null_mut()),
            stack_base: Cell::new(ptr::null_mut()),
            stack_guard: Cell::new(ptr::null_mut()),
            gc_sp: Cell::new(ptr::null_mut()),
            gc_stack: Cell::new(ptr::null_mut()),
            gc_guard: Cell::new(ptr::null_mut()),
            m: AtomicPtr::new(ptr::null_mut()),
            locked_m: Cell::new(None),
            idle_m: Cell::new(None),
            flags: AtomicU32::new(0),
            wait_reason: Cell::new(""),
            defers: Cell::new(ptr::null_mut()),
            panics: Cell::new(ptr::null_mut()),
            pending_free: Cell::new(None),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id.get()
    }

    pub fn status(&self) -> TaskStatus {
        self.status.load(Ordering::SeqCst)
    }

    pub(crate) fn set_flag(&self, flag: TaskFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::SeqCst);
    }

    pub(crate) fn clear_flag(&self, flag: TaskFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::SeqCst);
    }

    /// Test-and-clear.
    pub(crate) fn take_flag(&self, flag: TaskFlags) -> bool {
        self.flags.fetch_and(!flag.bits(), Ordering::SeqCst) & flag.bits() != 0
    }

    /// A dead task is only reusable if its spine was retired back to the
    /// original segment.
    pub(crate) fn stack_is_original(&self) -> bool {
        self.stack_guard.get() as usize - STACK_GUARD == self.stack0.get() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_set_clear_take() {
        let t = Task::new();
        assert!(!t.take_flag(TaskFlags::READY_ON_STOP));
        t.set_flag(TaskFlags::READY_ON_STOP);
        t.set_flag(TaskFlags::IS_PANIC);
        assert!(t.take_flag(TaskFlags::READY_ON_STOP));
        assert!(!t.take_flag(TaskFlags::READY_ON_STOP));
        assert!(t.take_flag(TaskFlags::IS_PANIC));
    }

    #[test]
    fn fresh_task_is_idle() {
        let t = Task::new();
        assert!(t.status() == TaskStatus::Idle);
        assert_eq!(t.id().as_u64(), 0);
    }
}
