//! Execution-context primitive for x86_64.
//!
//! A [`Context`] is a resumable point of execution: the stack pointer,
//! the program counter to continue at, the callee-saved register file the
//! sysv64 ABI requires to be intact at that point, and a back-pointer to
//! the owning task. Everything else (caller-saved registers) is dead
//! across a call by ABI contract, which is what makes the setjmp-style
//! [`ctx_save`] / [`ctx_resume`] pair sound at call boundaries.

use core::arch::naked_asm;
use core::mem::offset_of;

use crate::sched::task::Task;

/// Entry signature for code dispatched onto a stack via
/// [`ctx_resume_call`]: it receives a pointer to its argument block.
pub type RawEntry = unsafe extern "sysv64" fn(*mut u8) -> !;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Context {
    pub sp: *mut u8,
    pub pc: usize,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    /// Owning task, for diagnostics and traceback. Never read by the asm.
    pub task: *mut Task,
}

/// The asm below hard-codes these offsets.
pub const CONTEXT_SIZE: usize = 0x48;
const _: () = assert!(size_of::<Context>() == CONTEXT_SIZE);
const _: () = assert!(offset_of!(Context, sp) == 0x00);
const _: () = assert!(offset_of!(Context, pc) == 0x08);
const _: () = assert!(offset_of!(Context, rbx) == 0x10);
const _: () = assert!(offset_of!(Context, rbp) == 0x18);
const _: () = assert!(offset_of!(Context, r12) == 0x20);
const _: () = assert!(offset_of!(Context, r13) == 0x28);
const _: () = assert!(offset_of!(Context, r14) == 0x30);
const _: () = assert!(offset_of!(Context, r15) == 0x38);
const _: () = assert!(offset_of!(Context, task) == 0x40);

impl Context {
    pub const fn zeroed() -> Self {
        Context {
            sp: core::ptr::null_mut(),
            pc: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            task: core::ptr::null_mut(),
        }
    }
}

/// Capture the caller's resume point into `ctx`.
///
/// Returns 0 when called directly, and the `retval` given to
/// [`ctx_resume`] when the context is resumed later. The captured point
/// is the instruction after this call, with the caller's callee-saved
/// registers and stack pointer as they were at the call.
///
/// # Safety
/// `ctx` must be valid for writes. Resuming is only sound while the
/// caller's frame is still intact (it must not have returned) and from a
/// different stack.
#[unsafe(naked)]
pub unsafe extern "sysv64" fn ctx_save(ctx: *mut Context) -> usize {
    naked_asm!(
        "lea rax, [rsp + 8]",
        "mov [rdi + 0x00], rax",
        "mov rax, [rsp]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        "xor eax, eax",
        "ret",
    )
}

/// Resume a context captured by [`ctx_save`], delivering `retval` as that
/// call's return value. Does not return.
///
/// # Safety
/// `ctx` must have been filled by [`ctx_save`] (or hand-built with a
/// valid sp/pc pair), and the frame it points into must still be live.
#[unsafe(naked)]
pub unsafe extern "sysv64" fn ctx_resume(ctx: *const Context, retval: usize) -> ! {
    naked_asm!(
        "mov rbx, [rdi + 0x10]",
        "mov rbp, [rdi + 0x18]",
        "mov r12, [rdi + 0x20]",
        "mov r13, [rdi + 0x28]",
        "mov r14, [rdi + 0x30]",
        "mov r15, [rdi + 0x38]",
        "mov rsp, [rdi + 0x00]",
        "mov rax, rsi",
        "jmp [rdi + 0x08]",
    )
}

/// Enter `f` at the stack position `ctx.sp`, with `ctx.pc` planted as the
/// return trampoline and `ctx.sp` passed as `f`'s argument pointer.
///
/// The stack pointer is aligned down to 16 below the argument block, then
/// the trampoline address is pushed, so `f` starts with the ABI-required
/// alignment and `ret`s straight into the trampoline. Used for first
/// dispatch of a task (trampoline = task exit) and for running a grown
/// frame (trampoline = segment retirement).
///
/// # Safety
/// `ctx.sp` must point at a valid argument block on a live stack with
/// enough room below it for `f`'s frames; `ctx.pc` must be the address of
/// a trampoline prepared to be entered by `ret`.
#[unsafe(naked)]
pub unsafe extern "sysv64" fn ctx_resume_call(ctx: *const Context, f: RawEntry) -> ! {
    naked_asm!(
        "mov rcx, [rdi + 0x00]",
        "mov rax, [rdi + 0x08]",
        "mov rsp, rcx",
        "and rsp, -16",
        "push rax",
        "mov rdi, rcx",
        "jmp rsi",
    )
}

/// Switch to the bootstrap stack at `sp` and call `f(arg)` there. `f`
/// must never return; if it does, the process is taken down.
///
/// # Safety
/// `sp` must be a 16-aligned position on the worker's bootstrap stack
/// with its live frames above it.
#[unsafe(naked)]
pub unsafe extern "sysv64" fn switch_to_bootstrap(
    sp: *mut u8,
    f: unsafe extern "sysv64" fn(*mut Task) -> !,
    arg: *mut Task,
) -> ! {
    naked_asm!(
        "mov rsp, rdi",
        "mov rdi, rdx",
        "call rsi",
        "call {returned}",
        returned = sym bootstrap_call_returned,
    )
}

extern "sysv64" fn bootstrap_call_returned() -> ! {
    crate::throw("scheduler call on bootstrap stack returned");
}

/// Stack pointer of the caller (the value it has just after this call
/// returns).
#[unsafe(naked)]
pub unsafe extern "sysv64" fn current_sp() -> usize {
    naked_asm!("lea rax, [rsp + 8]", "ret")
}
