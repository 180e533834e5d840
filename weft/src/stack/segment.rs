//! Growable split stacks.
//!
//! A task's stack is a chain of segments. Each segment carries a header
//! at its high end recording the previous segment's bounds, the
//! continuation that returns from the segment, and the argument block
//! that was copied across. [`grow_call`] runs a frame on a new (or
//! borrowed) segment; when the frame returns, the retirement trampoline
//! restores the previous segment and resumes the continuation.

use core::arch::naked_asm;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use crate::consts::{STACK_EXTRA, STACK_GUARD, STACK_MIN, STACK_SYSTEM};
use crate::platform::context::{Context, ctx_resume, ctx_resume_call, ctx_save, current_sp};
use crate::platform::current_worker;
use crate::sched::task::{Task, TaskFlags};
use crate::sched::{current_task_ref, try_current_task};
use crate::stack::{stack_alloc, stack_free};

/// A frame run on a grown segment: receives its copied argument block,
/// returns one machine word.
pub type SegFn = unsafe extern "sysv64" fn(*mut u8) -> usize;

/// Header planted at the high-address end of every segment.
#[repr(C)]
pub(crate) struct SegmentHeader {
    /// Previous segment's header address; null in the innermost segment.
    pub prev_base: *mut u8,
    pub prev_guard: *mut u8,
    /// Continuation resumed when the segment retires.
    pub ctx: Context,
    /// Caller's argument block; return values are copied back here.
    pub argp: *mut u8,
    pub argsize: u32,
    /// Set when this segment was created while a panic was draining the
    /// defer list; checked by recover.
    pub panic: bool,
    /// Segment bytes to reclaim at retirement; 0 for a borrowed header.
    pub free: usize,
}

pub(crate) const HEADER_SIZE: usize = size_of::<SegmentHeader>();
const _: () = assert!(HEADER_SIZE % 16 == 0);

// A borrowed header is planted on the caller's own segment while
// grow_call keeps executing there; this gap below the live stack pointer
// keeps grow_call's remaining calls off the header.
const BORROW_SLACK: usize = 1024;

/// Allocate a task's initial segment and plant a zeroed header on top.
pub(crate) fn install_initial_segment(g: &Task, stacksize: usize) {
    let total = STACK_SYSTEM + stacksize;
    let stk = stack_alloc(total).as_ptr();
    unsafe {
        g.stack0.set(stk);
        g.stack_guard.set(stk.add(STACK_GUARD));
        let base = stk.add(total - HEADER_SIZE);
        base.write_bytes(0, HEADER_SIZE);
        g.stack_base.set(base);
    }
}

/// Run `f(argp)` with at least `frame_size` bytes of stack available,
/// growing onto a new segment when the current one is too small.
///
/// This is the library form of the split-stack prologue: call it before
/// pushing a frame that may not fit. `frame_size == 1` is the
/// reflect-call sentinel: no frame reservation, but a segment header is
/// always installed above `f`'s frame (borrowing space on the current
/// segment when there is room), which is what lets recover identify a
/// deferred call's frame.
///
/// `argsize` bytes at `argp` are copied to the new segment top and passed
/// to `f`; on return they are copied back (out-parameters survive) and
/// `f`'s return value is delivered as the result.
///
/// # Safety
/// Must be called from a running task. `argp` must point at `argsize`
/// readable-writable bytes, `argsize` a multiple of 8. `f` must not
/// return by any path other than a normal return or the runtime's own
/// panic unwind.
#[inline(never)]
pub unsafe fn grow_call(frame_size: usize, f: SegFn, argp: *mut u8, argsize: u32) -> usize {
    // Raw reference: no droppable locals may live across the ctx_save
    // below, and tasks are never freed.
    let g = current_task_ref();
    let sp = unsafe { current_sp() };

    if sp < g.stack_guard.get() as usize - STACK_GUARD {
        log::error!(
            "split stack overflow: {:#x} < {:#x}",
            sp,
            g.stack_guard.get() as usize - STACK_GUARD
        );
        crate::throw("split stack overflow");
    }
    if argsize % 8 != 0 {
        crate::throw("stack grow with misaligned argument size");
    }

    let reflectcall = frame_size == 1;
    let mut frame_size = if reflectcall { 0 } else { frame_size };

    // Enough room on the current segment: run the frame in place. A
    // reflect call always gets a header, so it never takes this path.
    if !reflectcall && sp.saturating_sub(frame_size + 32) > g.stack_guard.get() as usize {
        return unsafe { f(argp) };
    }

    let top: *mut SegmentHeader;
    let stk: *mut u8;
    let free: usize;
    if reflectcall
        && sp.saturating_sub(BORROW_SLACK + HEADER_SIZE + argsize as usize + 32)
            > g.stack_guard.get() as usize
    {
        // Called to run a frame with an arbitrary argument size and the
        // current segment has space: the header is necessary to unwind,
        // but no new segment is.
        top = (((sp - BORROW_SLACK) & !0xF) - HEADER_SIZE) as *mut SegmentHeader;
        stk = unsafe { g.stack_guard.get().sub(STACK_GUARD) };
        free = 0;
    } else {
        frame_size += argsize as usize + STACK_EXTRA;
        if frame_size < STACK_MIN {
            frame_size = STACK_MIN;
        }
        frame_size += STACK_SYSTEM;
        frame_size = (frame_size + 15) & !15;
        stk = stack_alloc(frame_size).as_ptr();
        top = unsafe { stk.add(frame_size - HEADER_SIZE) } as *mut SegmentHeader;
        free = frame_size;
    }

    unsafe {
        (*top).prev_base = g.stack_base.get();
        (*top).prev_guard = g.stack_guard.get();
        (*top).argp = argp;
        (*top).argsize = argsize;
        (*top).free = free;
        (*top).panic = g.take_flag(TaskFlags::IS_PANIC);
        (*top).ctx = Context::zeroed();
        (*top).ctx.task = g as *const Task as *mut Task;

        g.stack_base.set(top as *mut u8);
        g.stack_guard.set(stk.add(STACK_GUARD));

        let args_dst = (top as *mut u8).sub(argsize as usize);
        if argsize > 0 {
            ptr::copy_nonoverlapping(argp, args_dst, argsize as usize);
        }

        if ctx_save(&mut (*top).ctx) != 0 {
            // Resumed by segment retirement, back on the previous
            // segment. Everything is re-derived: frame slots from before
            // the save must not be trusted here.
            let m = current_worker();
            let g = current_task_ref();
            if let Some((seg, size)) = g.pending_free.take() {
                stack_free(seg, size);
            }
            return m.cret.get();
        }

        // Continue as if the retirement trampoline had called `f` on the
        // new segment.
        let mut label = Context::zeroed();
        label.sp = args_dst;
        label.pc = retire_pc();
        label.task = g as *const Task as *mut Task;
        ctx_resume_call(
            &label,
            core::mem::transmute::<SegFn, crate::platform::context::RawEntry>(f),
        )
    }
}

pub(crate) fn retire_pc() -> usize {
    lessstack as usize
}

/// Return trampoline for frames run on a grown segment: entered by `ret`
/// with the frame's return value still in rax.
#[unsafe(naked)]
unsafe extern "sysv64" fn lessstack() -> ! {
    naked_asm!("mov rdi, rax", "call {retire}", retire = sym retire_segment)
}

/// Retire the top stack segment: copy the argument block back, restore
/// the previous segment bounds, stage the dying segment for reclamation
/// and resume the grow continuation. Runs on the dying segment, which
/// stays mapped until the continuation frees it.
unsafe extern "sysv64" fn retire_segment(cret: usize) -> ! {
    let m = current_worker();
    let g = current_task_ref();
    unsafe {
        let top = g.stack_base.get() as *mut SegmentHeader;

        // Fault here if the continuation's owner is bad, before resuming.
        if !ptr::eq((*top).ctx.task, g as *const Task) {
            crate::throw("segment continuation owned by another task");
        }

        let argsize = (*top).argsize as usize;
        if argsize > 0 {
            ptr::copy_nonoverlapping((top as *mut u8).sub(argsize), (*top).argp, argsize);
        }

        let stk = g.stack_guard.get().sub(STACK_GUARD);
        if (*top).free != 0 {
            g.pending_free
                .set(Some((NonNull::new_unchecked(stk), (*top).free)));
        }
        g.stack_base.set((*top).prev_base);
        g.stack_guard.set((*top).prev_guard);

        m.cret.set(cret);
        ctx_resume(&(*top).ctx, 1)
    }
}

/// Retire segments of `gp` until the one containing `sp` is reached, or
/// only the innermost remains (`sp` null). Must run off `gp`'s stack
/// (scheduler or recovery, both on a bootstrap stack).
pub(crate) fn unwind_segments(gp: &Task, sp: *mut u8) {
    let here = unsafe { current_sp() };
    if let Some(cur) = try_current_task()
        && ptr::eq(Arc::as_ptr(&cur), gp)
        && here >= gp.stack_guard.get() as usize - STACK_GUARD
        && here < gp.stack_base.get() as usize
    {
        crate::throw("segment unwind on own stack");
    }

    unsafe {
        loop {
            let top = gp.stack_base.get() as *mut SegmentHeader;
            if top.is_null() || (*top).prev_base.is_null() {
                break;
            }
            let stk = gp.stack_guard.get().sub(STACK_GUARD);
            if !sp.is_null() && stk <= sp && sp < gp.stack_base.get() {
                break;
            }
            gp.stack_base.set((*top).prev_base);
            gp.stack_guard.set((*top).prev_guard);
            if (*top).free != 0 {
                stack_free(NonNull::new_unchecked(stk), (*top).free);
            }
        }
    }

    if !sp.is_null()
        && ((sp as usize) < gp.stack_guard.get() as usize - STACK_GUARD
            || (gp.stack_base.get() as usize) < sp as usize)
    {
        log::error!(
            "unwind: {:p} not in [{:#x}, {:p}]",
            sp,
            gp.stack_guard.get() as usize - STACK_GUARD,
            gp.stack_base.get()
        );
        crate::throw("bad segment unwind");
    }
}

/// Number of segments in the calling task's stack spine (1 when only the
/// initial segment is held). Debugging hook.
pub fn segment_count() -> usize {
    let g = current_task_ref();
    let mut n = 1;
    unsafe {
        let mut top = g.stack_base.get() as *const SegmentHeader;
        while !top.is_null() && !(*top).prev_base.is_null() {
            n += 1;
            top = (*top).prev_base as *const SegmentHeader;
        }
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::FIXED_STACK;

    #[test]
    fn header_geometry() {
        assert_eq!(HEADER_SIZE % 16, 0);
        assert!(HEADER_SIZE < STACK_GUARD);
    }

    #[test]
    fn initial_segment_invariants() {
        let g = Task::new();
        install_initial_segment(&g, STACK_MIN);
        assert!(g.stack_is_original());
        let base = g.stack_base.get() as usize;
        let stk = g.stack0.get() as usize;
        assert_eq!(base + HEADER_SIZE, stk + FIXED_STACK);
        assert_eq!(base % 16, 0);
        unsafe {
            let top = g.stack_base.get() as *const SegmentHeader;
            assert!((*top).prev_base.is_null());
            assert_eq!((*top).free, 0);
        }
    }
}
