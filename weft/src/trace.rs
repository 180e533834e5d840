//! Task status printing and the all-tasks traceback.

use std::fmt::Write as _;
use std::sync::Arc;

use crate::consts::TRACE_PCS_MAX;
use crate::sched::task::{Task, TaskStatus};
use crate::sched::{self, try_current_task};
use crate::stack::segment::SegmentHeader;

/// One-line header for a task: id and status (or wait reason).
pub fn task_header(g: &Task) -> String {
    let status = match g.status() {
        TaskStatus::Idle => "idle",
        TaskStatus::Runnable => "runnable",
        TaskStatus::Running => "running",
        TaskStatus::Syscall => "syscall",
        TaskStatus::Waiting => {
            let reason = g.wait_reason.get();
            if reason.is_empty() { "waiting" } else { reason }
        }
        TaskStatus::Moribund => "moribund",
        TaskStatus::Dead => "???",
    };
    format!("task {} [{}]:", g.id(), status)
}

/// Collect program counters describing where `gp` is suspended: the given
/// pc/lr first, then the continuation of each stack segment outward.
/// Returns the number of entries written.
pub(crate) fn collect_pcs(pc: usize, lr: usize, gp: Option<&Task>, buf: &mut [usize]) -> usize {
    let cap = buf.len();
    let mut n = 0;
    if pc != 0 && n < cap {
        buf[n] = pc;
        n += 1;
    }
    if lr != 0 && n < cap {
        buf[n] = lr;
        n += 1;
    }
    if let Some(g) = gp {
        unsafe {
            let mut top = g.stack_base.get() as *const SegmentHeader;
            while !top.is_null() && !(*top).prev_base.is_null() && n < cap {
                let p = (*top).ctx.pc;
                if p != 0 {
                    buf[n] = p;
                    n += 1;
                }
                top = (*top).prev_base as *const SegmentHeader;
            }
        }
    }
    n
}

/// Print a header and a short program-counter walk for every non-dead
/// task except the caller's. Only meaningful while the world is stopped
/// or the process is going down; concurrent tasks are sampled racily.
pub fn traceback_all() {
    let me = try_current_task();
    for g in sched::all_tasks() {
        if let Some(me) = &me
            && Arc::ptr_eq(me, &g)
        {
            continue;
        }
        if g.status() == TaskStatus::Dead {
            continue;
        }
        let mut buf = [0usize; TRACE_PCS_MAX];
        let (pc, spawn_pc) = unsafe { ((*g.sched.get()).pc, g.spawn_pc.get()) };
        let n = collect_pcs(pc, spawn_pc, Some(&g), &mut buf);
        let mut line = String::new();
        for pc in &buf[..n] {
            let _ = write!(line, " {pc:#x}");
        }
        eprintln!();
        eprintln!("{}", task_header(&g));
        eprintln!("\tpc:{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::task::TaskId;
    use std::sync::atomic::Ordering;

    #[test]
    fn header_status_strings() {
        let t = Task::new();
        t.id.set(TaskId::new(7));
        assert_eq!(task_header(&t), "task 7 [idle]:");

        t.status.store(TaskStatus::Runnable, Ordering::SeqCst);
        assert_eq!(task_header(&t), "task 7 [runnable]:");

        t.status.store(TaskStatus::Waiting, Ordering::SeqCst);
        assert_eq!(task_header(&t), "task 7 [waiting]:");
        t.wait_reason.set("new task");
        assert_eq!(task_header(&t), "task 7 [new task]:");

        t.status.store(TaskStatus::Moribund, Ordering::SeqCst);
        assert_eq!(task_header(&t), "task 7 [moribund]:");

        t.status.store(TaskStatus::Dead, Ordering::SeqCst);
        assert_eq!(task_header(&t), "task 7 [???]:");
    }

    #[test]
    fn collect_pcs_caps_and_skips_zero() {
        let mut buf = [0usize; 4];
        assert_eq!(collect_pcs(0, 0, None, &mut buf), 0);
        assert_eq!(collect_pcs(0x1000, 0, None, &mut buf), 1);
        assert_eq!(collect_pcs(0x1000, 0x2000, None, &mut buf), 2);
        assert_eq!(buf[1], 0x2000);
    }
}
