//! Deferred calls and panic/recover.
//!
//! Each task carries a LIFO list of deferred calls and a list of active
//! panic records. A panic drains the defer list, running each deferred
//! function through the reflect-call path so its frame sits at the top of
//! a panic-marked stack segment; `try_recover` succeeds only when called
//! directly from such a frame. Recovery then resumes the registering
//! frame as if its `defer_call` had returned 1.

use core::arch::naked_asm;
use std::any::Any;
use std::process;
use std::ptr;

use crate::platform::context::{Context, ctx_resume};
use crate::sched::current_task_ref;
use crate::sched::task::{Task, TaskFlags};
use crate::stack::segment::{SegFn, SegmentHeader, grow_call, unwind_segments};

/// A deferred function: receives a pointer to its captured argument
/// block.
pub type DeferFn = unsafe extern "sysv64" fn(*mut u8);

pub(crate) struct Defer {
    pub fn_: DeferFn,
    /// Captured argument bytes, passed back to `fn_` when it runs.
    pub args: Box<[u8]>,
    /// Resume point in the registering frame; resuming it makes that
    /// frame's `defer_call` return 1. `ctx.sp` doubles as the frame key
    /// for `defer_return`.
    pub ctx: Context,
    pub nofree: bool,
    pub link: *mut Defer,
}

pub(crate) struct Panic {
    pub arg: Option<Box<dyn Any + Send>>,
    /// Top segment at the time the panic started.
    #[allow(unused)]
    pub stack_base: *mut u8,
    pub recovered: bool,
    pub link: *mut Panic,
}

/// Register `f` to run when the current frame returns (via
/// [`defer_return`]), when the task exits, or during a panic unwind.
/// `argsize` bytes at `argp` are captured now and passed to `f` later.
///
/// Returns 0. A return value of 1 means a panic was recovered by this
/// deferred call and the unwind has resumed here: the caller must
/// return immediately without running the rest of its body.
///
/// # Safety
/// Must be called from a running task, directly from the frame that will
/// call `defer_return` (or return into the task exit path). `argp` must
/// point at `argsize` readable bytes, `argsize` a multiple of 8.
#[unsafe(naked)]
pub unsafe extern "sysv64" fn defer_call(f: DeferFn, argp: *const u8, argsize: u32) -> usize {
    // Capture the caller's resume point before touching any register, so
    // a recovery can re-enter the caller as if this call returned 1. The
    // context is built in a stack temp and copied into the record by the
    // inner call.
    naked_asm!(
        "sub rsp, 0x48",
        "lea rax, [rsp + 0x50]",
        "mov [rsp + 0x00], rax",
        "mov rax, [rsp + 0x48]",
        "mov [rsp + 0x08], rax",
        "mov [rsp + 0x10], rbx",
        "mov [rsp + 0x18], rbp",
        "mov [rsp + 0x20], r12",
        "mov [rsp + 0x28], r13",
        "mov [rsp + 0x30], r14",
        "mov [rsp + 0x38], r15",
        "mov qword ptr [rsp + 0x40], 0",
        "mov rcx, rsp",
        "call {inner}",
        "add rsp, 0x48",
        "ret",
        inner = sym defer_call_inner,
    )
}

unsafe extern "sysv64" fn defer_call_inner(
    f: DeferFn,
    argp: *const u8,
    argsize: u32,
    ctx: *const Context,
) -> usize {
    let g = current_task_ref();
    let mut args = vec![0u8; argsize as usize].into_boxed_slice();
    if argsize > 0 {
        unsafe { ptr::copy_nonoverlapping(argp, args.as_mut_ptr(), argsize as usize) };
    }
    let mut ctx = unsafe { ptr::read(ctx) };
    ctx.task = g as *const Task as *mut Task;
    let d = Box::into_raw(Box::new(Defer {
        fn_: f,
        args,
        ctx,
        nofree: false,
        link: g.defers.get(),
    }));
    g.defers.set(d);
    0
}

/// Run the deferred calls registered by the calling frame, newest first.
/// Call at the end of any frame that used [`defer_call`]; deferred calls
/// left unfired here still run at task exit.
#[unsafe(naked)]
pub unsafe extern "sysv64" fn defer_return() {
    naked_asm!(
        "lea rdi, [rsp + 8]",
        "jmp {inner}",
        inner = sym defer_return_inner,
    )
}

unsafe extern "sysv64" fn defer_return_inner(caller_sp: usize) {
    let g = current_task_ref();
    loop {
        let d = g.defers.get();
        if d.is_null() {
            return;
        }
        unsafe {
            if (*d).ctx.sp as usize != caller_sp {
                return;
            }
            g.defers.set((*d).link);
            ((*d).fn_)((*d).args.as_ptr() as *mut u8);
            if !(*d).nofree {
                drop(Box::from_raw(d));
            }
        }
    }
}

/// Run every outstanding deferred call of the current task, newest first.
/// Used by the task exit path.
pub(crate) fn run_defers() {
    let g = current_task_ref();
    loop {
        let d = g.defers.get();
        if d.is_null() {
            break;
        }
        unsafe {
            g.defers.set((*d).link);
            reflect_call((*d).fn_, (*d).args.as_ptr() as *mut u8, (&(*d).args).len() as u32);
            if !(*d).nofree {
                drop(Box::from_raw(d));
            }
        }
    }
}

/// Run `f(argp)` with a segment header installed directly above its
/// frame, so the frame is identifiable as the top of its segment.
pub(crate) unsafe fn reflect_call(f: DeferFn, argp: *mut u8, argsize: u32) {
    unsafe {
        grow_call(1, core::mem::transmute::<DeferFn, SegFn>(f), argp, argsize);
    }
}

/// Start a panic on the current task: drain the defer list, running each
/// deferred call on a panic-marked segment. If one of them recovers, the
/// registering frame is resumed (its `defer_call` returns 1) and this
/// function does not return to its caller either way. An unrecovered
/// panic prints every active panic record once and exits the process
/// with code 2.
pub fn panic_any(value: Box<dyn Any + Send>) -> ! {
    let g = current_task_ref();
    let p = Box::into_raw(Box::new(Panic {
        arg: Some(value),
        stack_base: g.stack_base.get(),
        recovered: false,
        link: g.panics.get(),
    }));
    g.panics.set(p);

    loop {
        let d = g.defers.get();
        if d.is_null() {
            break;
        }
        unsafe {
            // Off the list first: a recursive panic must not re-run it.
            g.defers.set((*d).link);
            g.set_flag(TaskFlags::IS_PANIC);
            reflect_call((*d).fn_, (*d).args.as_ptr() as *mut u8, (&(*d).args).len() as u32);
            if (*p).recovered {
                g.panics.set((*p).link);
                drop(Box::from_raw(p));
                // Put the recovering defer back for the unwind to find.
                (*d).link = g.defers.get();
                g.defers.set(d);
                crate::sched::mcall(recovery);
                crate::throw("recovery failed");
            }
            if !(*d).nofree {
                drop(Box::from_raw(d));
            }
        }
    }

    // Ran out of deferred calls.
    print_panics(g.panics.get());
    process::exit(2);
}

fn print_panics(p: *mut Panic) {
    unsafe {
        if !(*p).link.is_null() {
            print_panics((*p).link);
            eprint!("\t");
        }
        eprint!("panic: {}", describe(&(*p).arg));
        if (*p).recovered {
            eprint!(" [recovered]");
        }
        eprintln!();
    }
}

fn describe(arg: &Option<Box<dyn Any + Send>>) -> String {
    let Some(v) = arg else {
        return "(recovered value)".into();
    };
    if let Some(s) = v.downcast_ref::<&str>() {
        (*s).into()
    } else if let Some(s) = v.downcast_ref::<String>() {
        s.clone()
    } else if let Some(n) = v.downcast_ref::<usize>() {
        n.to_string()
    } else if let Some(n) = v.downcast_ref::<u64>() {
        n.to_string()
    } else if let Some(n) = v.downcast_ref::<i64>() {
        n.to_string()
    } else if let Some(n) = v.downcast_ref::<i32>() {
        n.to_string()
    } else {
        "(value of unknown type)".into()
    }
}

/// Recovery unwind, run on the bootstrap stack: retire segments above the
/// recovering defer's frame and resume it with `defer_call` returning 1.
pub(crate) unsafe extern "sysv64" fn recovery(gp: *mut Task) -> ! {
    let gp = unsafe { &*gp };
    let d = gp.defers.get();
    if d.is_null() {
        crate::throw("recovery without a deferred call");
    }
    unsafe {
        gp.defers.set((*d).link);
        let ctx = (*d).ctx;
        unwind_segments(gp, ctx.sp);
        if !(*d).nofree {
            drop(Box::from_raw(d));
        }
        ctx_resume(&ctx, 1)
    }
}

/// Consume the active panic if the caller is entitled to: a panic must be
/// in progress and not yet recovered, `frame_argp` (the argument pointer
/// the deferred call received) must sit at the top of the current stack
/// segment, and that segment must be panic-marked. Returns the panic
/// value on success, `None` otherwise.
pub fn try_recover(frame_argp: *const u8) -> Option<Box<dyn Any + Send>> {
    let g = current_task_ref();
    let p = g.panics.get();
    unsafe {
        if p.is_null() || (*p).recovered {
            return None;
        }

        // The deferred call ran through the reflect-call path, so its
        // argument block abuts the segment header. Anything between
        // top - argsize and top counts as the top of the segment.
        let mut top = g.stack_base.get() as *const SegmentHeader;
        let argp = frame_argp as usize;
        if argp < top as usize - (*top).argsize as usize || (top as usize) < argp {
            return None;
        }

        // The deferred call's own frame may have grown a segment of its
        // own immediately; if the copied arguments abut the older top,
        // back up to the segment the reflect call made for the panic.
        let oldtop = (*top).prev_base as *const SegmentHeader;
        if !oldtop.is_null() && (*top).argp as usize == oldtop as usize - (*top).argsize as usize {
            top = oldtop;
        }

        if !(*top).panic {
            return None;
        }

        (*p).recovered = true;
        (*p).arg.take()
    }
}
