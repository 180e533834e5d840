//! weft — a user-space M:N scheduler.
//!
//! Many lightweight tasks, each with its own growable segmented stack,
//! are multiplexed onto a bounded pool of OS threads. Tasks are
//! cooperative: they leave their worker only at an explicit yield,
//! syscall bracket, stack growth, panic, or exit. At most
//! `WEFT_MAX_WORKERS` workers execute task code simultaneously; a
//! stop-the-world coordinator can lower that cap to 1 to get a
//! single-threaded critical section.
//!
//! Typical entry:
//!
//! ```no_run
//! fn main() {
//!     weft::boot(
//!         |_| {
//!             weft::spawn(|n| println!("hello from task {n}"), 1);
//!         },
//!         0,
//!     );
//! }
//! ```
//!
//! The process exits with code 0 once the last task has exited.

mod consts;
mod logger;
mod panicking;
mod platform;
mod profile;
mod sched;
mod stack;
mod trace;

pub use consts::{STACK_EXTRA, STACK_GUARD, STACK_MIN};
pub use panicking::{DeferFn, defer_call, defer_return, panic_any, try_recover};
pub use profile::{SamplerFn, set_cpu_profile, sigprof};
pub use sched::task::{Task, TaskEntry, TaskId, TaskStatus};
pub use sched::{
    SchedSnapshot, boot, enter_syscall, exit_syscall, exit_task, init_done, lock_thread,
    sched_snapshot, schedinit, set_idle_task, set_max_workers, spawn, spawn_raw, start_the_world,
    stop_the_world, task_count, thread_locked, unlock_thread, worker_count, worker_id, yield_now,
};
pub use stack::segment::{SegFn, grow_call, segment_count};
pub use trace::{task_header, traceback_all};

/// Fatal invariant violation: print and abort. Nothing is recovered at
/// this layer.
pub(crate) fn throw(msg: &str) -> ! {
    eprintln!("fatal error: {msg}");
    if let Some(g) = sched::try_current_task() {
        eprintln!("{}", trace::task_header(&g));
    }
    std::process::abort()
}
