//! The scheduler core.
//!
//! The scheduler's job is to match ready-to-run tasks with idle workers.
//! If there are ready tasks and no parked worker, dispatch starts a new
//! worker on a new OS thread, so that all ready tasks can run
//! simultaneously, up to the CPU cap. Workers never go away.
//!
//! By default at most one worker runs task code at a time; the
//! `WEFT_MAX_WORKERS` environment variable or [`set_max_workers`] raises
//! the cap. State is guarded by one lock plus the packed atomic word in
//! [`word`]; the lock is never held across task code or a note sleep.

pub mod task;
pub mod word;
pub mod worker;

use core::arch::naked_asm;
use std::collections::VecDeque;
use std::env;
use std::process;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::consts::{MAX_WORKERS_CAP, SPAWN_ARGS_MAX, STACK_MIN};
use crate::platform::context::{ctx_resume, ctx_resume_call, ctx_save, switch_to_bootstrap};
use crate::platform::{self, Note, current_worker, try_current_worker};
use crate::stack::segment::{HEADER_SIZE, install_initial_segment, unwind_segments};
use task::{Task, TaskEntry, TaskFlags, TaskId, TaskStatus};
use word::{GWAITING_DELTA, MCPU_DELTA, SchedWord, WAITSTOP_DELTA};
use worker::{Worker, mstart};

struct SchedInner {
    /// Dead tasks available for reuse.
    gfree: Vec<Arc<Task>>,
    goidgen: u64,

    /// Runnable tasks, FIFO.
    runq: VecDeque<Arc<Task>>,
    /// Tasks that are alive.
    gcount: i64,
    /// Tasks using a CPU or in a syscall.
    grunning: i64,

    /// Parked workers, LIFO.
    mfree: Vec<&'static Worker>,
    /// Workers ever created.
    mcount: i32,

    allg: Vec<Arc<Task>>,
    allm: Vec<&'static Worker>,

    /// A worker waiting on its hand-off note whose wakeup is deferred to
    /// the next unlock, so the wakeup never contends with a lock the
    /// woken worker is about to take.
    mwakeup: Option<&'static Worker>,

    /// The configured CPU cap (`mcpumax` is restored to this after a
    /// stop-the-world).
    max_workers: u32,
}

impl SchedInner {
    const fn new() -> SchedInner {
        SchedInner {
            gfree: Vec::new(),
            goidgen: 0,
            runq: VecDeque::new(),
            gcount: 0,
            grunning: 0,
            mfree: Vec::new(),
            mcount: 0,
            allg: Vec::new(),
            allm: Vec::new(),
            mwakeup: None,
            max_workers: 1,
        }
    }
}

struct Sched {
    lock: spin::Mutex<SchedInner>,
    word: SchedWord,
    /// One coordinator at a time sets `waitstop` and waits here for the
    /// over-cap workers to park.
    stopped: Note,
    gc_waiting: AtomicBool,
    /// Initialization phase: tasks queue up but are not started.
    predawn: AtomicBool,
    profile_hz: AtomicI32,
}

static SCHED: Sched = Sched {
    lock: spin::Mutex::new(SchedInner::new()),
    word: SchedWord::new(),
    stopped: Note::new(),
    gc_waiting: AtomicBool::new(false),
    predawn: AtomicBool::new(false),
    profile_hz: AtomicI32::new(0),
};

static BOOT_WORKER: spin::Once<&'static Worker> = spin::Once::new();

type SchedGuard<'a> = spin::MutexGuard<'a, SchedInner>;

/// Release the scheduler lock, then deliver the deferred wakeup if one
/// was staged.
fn sched_unlock(mut inner: SchedGuard) {
    let mw = inner.mwakeup.take();
    drop(inner);
    if let Some(m) = mw {
        m.have_nextg.wakeup();
    }
}

pub(crate) fn try_current_task() -> Option<Arc<Task>> {
    try_current_worker().and_then(|m| unsafe { (*m.curg.get()).clone() })
}

pub(crate) fn current_task() -> Arc<Task> {
    try_current_task().unwrap_or_else(|| crate::throw("no current task"))
}

/// Borrow the current task without touching its refcount. Tasks are never
/// freed (they are recycled through the free list), so the reference is
/// stable; this is the form safe to hold across a context save.
pub(crate) fn current_task_ref() -> &'static Task {
    let m = platform::current_worker();
    unsafe {
        match &*m.curg.get() {
            Some(g) => &*Arc::as_ptr(g),
            None => crate::throw("no current task"),
        }
    }
}

// ---------------------------------------------------------------------------
// Run queue and worker pool. All of these require the scheduler lock.

fn haveg(inner: &SchedInner) -> bool {
    if !inner.runq.is_empty() {
        return true;
    }
    match try_current_worker() {
        Some(m) => unsafe { (*m.idle_g.get()).is_some() },
        None => false,
    }
}

/// Put a task on the run queue.
fn gput(inner: &mut SchedInner, gp: Arc<Task>) {
    // A wired task is handed straight to its worker.
    if let Some(m) = gp.locked_m.get()
        && SCHED.word.can_add_mcpu()
    {
        mnextg(inner, m, gp);
        return;
    }

    // A worker's dedicated idle task goes to its idle slot.
    if let Some(m) = gp.idle_m.get() {
        unsafe {
            if let Some(old) = &*m.idle_g.get() {
                log::error!(
                    "w{} idle slot out of sync: task {} vs task {}",
                    m.id,
                    old.id(),
                    gp.id()
                );
                crate::throw("double idle task");
            }
            *m.idle_g.get() = Some(gp);
        }
        return;
    }

    inner.runq.push_back(gp);
    if inner.runq.len() == 1 {
        SCHED.word.xadd(GWAITING_DELTA);
    }
}

/// Take a task off the run queue, falling back to the current worker's
/// idle task.
fn gget(inner: &mut SchedInner) -> Option<Arc<Task>> {
    if let Some(gp) = inner.runq.pop_front() {
        if inner.runq.is_empty() {
            SCHED.word.xsub(GWAITING_DELTA);
        }
        return Some(gp);
    }
    try_current_worker().and_then(|m| unsafe { (*m.idle_g.get()).take() })
}

/// Park a worker on the free list.
fn mput(inner: &mut SchedInner, m: &'static Worker) {
    inner.mfree.push(m);
}

/// Get a worker to run `gp`: its wired worker if any, else a parked one.
fn mget(inner: &mut SchedInner, gp: &Task) -> Option<&'static Worker> {
    if let Some(m) = gp.locked_m.get() {
        return Some(m);
    }
    inner.mfree.pop()
}

/// Put a dead task on the free list.
fn gfput(inner: &mut SchedInner, gp: Arc<Task>) {
    if !gp.stack_is_original() {
        crate::throw("invalid stack on freed task");
    }
    inner.gfree.push(gp);
}

fn gfget(inner: &mut SchedInner) -> Option<Arc<Task>> {
    inner.gfree.pop()
}

/// Mark a task ready to run. It might be running already and about to
/// stop; the scheduler lock protects its status from changing underfoot.
fn readylocked(inner: &mut SchedInner, gp: &Arc<Task>) {
    if !gp.m.load(Ordering::SeqCst).is_null() {
        // Running on a worker; ready it when it next stops.
        gp.set_flag(TaskFlags::READY_ON_STOP);
        return;
    }

    let status = gp.status.load(Ordering::SeqCst);
    if status == TaskStatus::Runnable || status == TaskStatus::Running {
        log::error!("task {} has status {} in ready", gp.id(), status as u32);
        crate::throw("bad task status in ready");
    }
    gp.status.store(TaskStatus::Runnable, Ordering::SeqCst);

    gput(inner, gp.clone());
    if !SCHED.predawn.load(Ordering::SeqCst) {
        matchmg(inner);
    }
}

/// Pass `gp` to `m` for running. The caller has already charged the CPU
/// cap for it.
fn mnextg(inner: &mut SchedInner, m: &'static Worker, gp: Arc<Task>) {
    inner.grunning += 1;
    unsafe {
        *m.nextg.get() = Some(gp);
    }
    if m.wait_nextg.get() {
        m.wait_nextg.set(false);
        if let Some(prev) = inner.mwakeup.replace(m) {
            prev.have_nextg.wakeup();
        }
    }
}

fn mcommoninit(inner: &mut SchedInner) -> &'static Worker {
    let m = Worker::new(inner.mcount);
    inner.mcount += 1;
    inner.allm.push(m);
    m
}

/// Hand ready tasks to workers while there is work and the CPU cap has
/// room, starting new workers as needed.
fn matchmg(inner: &mut SchedInner) {
    if let Some(m) = try_current_worker()
        && (m.mallocing.get() || m.gcing.get())
    {
        return;
    }

    while haveg(inner) && SCHED.word.can_add_mcpu() {
        let gp = gget(inner).unwrap_or_else(|| crate::throw("gget inconsistency"));

        let m = match mget(inner, &gp) {
            Some(m) => m,
            None => {
                let m = mcommoninit(inner);
                log::debug!("starting worker w{} for task {}", m.id, gp.id());
                platform::spawn_thread(format!("weft-w{}", m.id), move || mstart(m));
                m
            }
        };
        mnextg(inner, m, gp);
    }
}

/// Get the next task for the current worker. The scheduler must be
/// locked on entry and is unlocked on return. Guarantees that at most
/// `mcpumax` tasks are running on CPUs (not in syscalls) at any time.
fn nextgandunlock(mut inner: SchedGuard) -> Arc<Task> {
    let m = current_worker();

    if word::mcpu(SCHED.word.load()) > MAX_WORKERS_CAP {
        crate::throw("negative mcpu");
    }

    // A task staged in the hand-off slot already had its mcpu charged
    // when it was passed to mnextg.
    if let Some(gp) = unsafe { (*m.nextg.get()).take() } {
        sched_unlock(inner);
        return gp;
    }

    if unsafe { (*m.locked_g.get()).is_some() } {
        // This worker can only run one task, and it is not ready. Make
        // sure some other worker exists to drain the regular run queue.
        if !inner.runq.is_empty() {
            matchmg(&mut inner);
            if let Some(gp) = unsafe { (*m.nextg.get()).take() } {
                sched_unlock(inner);
                return gp;
            }
        }
    } else {
        while haveg(&inner) && SCHED.word.can_add_mcpu() {
            let gp = gget(&mut inner).unwrap_or_else(|| crate::throw("gget inconsistency"));

            if let Some(lm) = gp.locked_m.get() {
                // Wired to another worker; pass it along.
                mnextg(&mut inner, lm, gp);
                continue;
            }

            inner.grunning += 1;
            sched_unlock(inner);
            return gp;
        }

        // The loop ended because the queue is empty or the CPU cap is
        // reached. Entersyscall sets `gwaiting` before touching the
        // queue, so its lock-free decrement cannot invalidate the
        // decision to park.
        mput(&mut inner, m);
    }

    let v = SCHED.word.load();
    if inner.grunning == 0 {
        crate::throw("all tasks are asleep - deadlock!");
    }
    unsafe {
        *m.nextg.get() = None;
    }
    m.wait_nextg.set(true);
    m.have_nextg.clear();

    // A stop-the-world coordinator is waiting for all but its CPU to
    // park. Entersyscall may have decremented mcpu too, but then it sees
    // waitstop and takes its slow path; exitsyscall never leaves mcpu
    // above mcpumax.
    if word::waitstop(v) && word::mcpu(v) <= word::mcpumax(v) {
        SCHED.word.xsub(WAITSTOP_DELTA);
        SCHED.stopped.wakeup();
    }
    sched_unlock(inner);

    m.have_nextg.sleep();
    match unsafe { (*m.nextg.get()).take() } {
        Some(gp) => gp,
        None => crate::throw("bad hand-off slot after wakeup"),
    }
}

// ---------------------------------------------------------------------------
// The worker loop.

/// One round of the scheduler: account for the task that just stopped,
/// find the next one, and run it. `prev` is the task that was running, or
/// `None` on a worker's first round. Runs on the bootstrap stack; never
/// returns.
pub(crate) fn schedule(prev: Option<Arc<Task>>) -> ! {
    let m = current_worker();
    let mut inner = SCHED.lock.lock();

    if let Some(gp) = prev {
        if SCHED.predawn.load(Ordering::SeqCst) {
            crate::throw("rescheduling during init");
        }

        gp.m.store(ptr::null_mut(), Ordering::SeqCst);
        inner.grunning -= 1;
        let v = SCHED.word.xsub(MCPU_DELTA);
        if word::mcpu(v) > MAX_WORKERS_CAP {
            crate::throw("negative mcpu in scheduler");
        }

        match gp.status.load(Ordering::SeqCst) {
            TaskStatus::Running => {
                gp.status.store(TaskStatus::Runnable, Ordering::SeqCst);
                gput(&mut inner, gp.clone());
            }
            TaskStatus::Moribund => {
                gp.status.store(TaskStatus::Dead, Ordering::SeqCst);
                if let Some(lm) = gp.locked_m.take() {
                    unsafe {
                        *lm.locked_g.get() = None;
                    }
                }
                gp.idle_m.set(None);
                unwind_segments(&gp, ptr::null_mut());
                gfput(&mut inner, gp.clone());
                inner.gcount -= 1;
                if inner.gcount == 0 {
                    log::debug!("last task exited");
                    process::exit(0);
                }
            }
            TaskStatus::Syscall => {
                // Yielded out of exitsyscall; requeued below through
                // its ready-on-stop flag.
            }
            status => {
                log::error!("task {} has status {} in schedule", gp.id(), status as u32);
                crate::throw("bad task status in schedule");
            }
        }
        if gp.take_flag(TaskFlags::READY_ON_STOP) {
            readylocked(&mut inner, &gp);
        }
    }

    // Find (or wait for) a task to run; unlocks the scheduler.
    let gp = nextgandunlock(inner);
    gp.clear_flag(TaskFlags::READY_ON_STOP);
    gp.status.store(TaskStatus::Running, Ordering::SeqCst);
    gp.m.store(m as *const Worker as *mut Worker, Ordering::SeqCst);
    unsafe {
        *m.curg.get() = Some(gp.clone());
    }

    let hz = SCHED.profile_hz.load(Ordering::SeqCst);
    if m.profile_hz.get() != hz {
        m.profile_hz.set(hz);
    }

    unsafe {
        let ctx = gp.sched.get();
        if (*ctx).pc == task_exit_pc() {
            // First dispatch: enter the task through its entry function.
            let entry = gp
                .entry
                .get()
                .unwrap_or_else(|| crate::throw("task has no entry"));
            let raw = Arc::as_ptr(&gp);
            drop(gp);
            ctx_resume_call(
                (*raw).sched.get(),
                core::mem::transmute::<TaskEntry, crate::platform::context::RawEntry>(entry),
            );
        }
        let raw = Arc::as_ptr(&gp);
        drop(gp);
        ctx_resume((*raw).sched.get(), 1)
    }
}

/// Switch to the bootstrap stack and run `f` there with the current task
/// as argument. Returns when the task is next resumed.
pub(crate) fn mcall(f: unsafe extern "sysv64" fn(*mut Task) -> !) {
    let m = current_worker();
    let gp: *mut Task = unsafe {
        match &*m.curg.get() {
            Some(g) => Arc::as_ptr(g) as *mut Task,
            None => crate::throw("mcall on bootstrap task"),
        }
    };
    unsafe {
        let ctx = (*gp).sched.get();
        (*ctx).task = gp;
        if ctx_save(ctx) == 0 {
            let sp = (*m.g0.sched.get()).sp;
            switch_to_bootstrap(sp, f, gp);
        }
        // Resumed: back on the task's stack.
    }
}

pub(crate) unsafe extern "sysv64" fn schedule_entry(_gp: *mut Task) -> ! {
    let m = current_worker();
    let prev = unsafe { (*m.curg.get()).take() };
    schedule(prev)
}

/// Cooperatively yield the current task. If it is still runnable it goes
/// to the back of the run queue and everyone else waiting gets to run
/// first.
pub fn yield_now() {
    let m = current_worker();
    if m.locks.load(Ordering::SeqCst) != 0 {
        crate::throw("yield while holding locks");
    }
    if unsafe { (*m.curg.get()).is_none() } {
        crate::throw("yield on bootstrap task");
    }
    mcall(schedule_entry);
}

// ---------------------------------------------------------------------------
// Task creation and exit.

fn task_exit_pc() -> usize {
    task_exit as usize
}

/// Return trampoline planted under every task's entry function; entered
/// by `ret` when the entry returns.
#[unsafe(naked)]
unsafe extern "sysv64" fn task_exit() -> ! {
    naked_asm!("call {body}", body = sym task_exit_body)
}

extern "sysv64" fn task_exit_body() -> ! {
    crate::panicking::run_defers();
    let g = current_task_ref();
    g.status.store(TaskStatus::Moribund, Ordering::SeqCst);
    yield_now();
    crate::throw("dead task rescheduled");
}

/// End the current task, running its outstanding deferred calls first.
pub fn exit_task() -> ! {
    task_exit_body()
}

/// Spawn a task from a raw entry point and argument block: `narg` bytes
/// at `argp` are copied onto the new task's stack and their address is
/// passed to `entry`; `nret` extra bytes are reserved for results.
/// `caller_pc` is recorded for diagnostics (pass 0 if unavailable).
///
/// # Safety
/// `argp` must point at `narg` readable bytes, and `entry` must treat the
/// block consistently with what the spawner wrote.
pub unsafe fn spawn_raw(
    entry: TaskEntry,
    argp: *const u8,
    narg: u32,
    nret: u32,
    caller_pc: usize,
) -> TaskId {
    let siz = ((narg as usize + nret as usize) + 7) & !7;
    // A secondary frame could make large argument lists work, but this
    // is almost always an error.
    if siz > SPAWN_ARGS_MAX {
        crate::throw("spawn: argument frame too large for a new task");
    }

    let mut inner = SCHED.lock.lock();

    let newg = match gfget(&mut inner) {
        Some(g) => {
            if !g.stack_is_original() {
                crate::throw("invalid stack on reused task");
            }
            g
        }
        None => {
            let g = Arc::new(Task::new());
            install_initial_segment(&g, STACK_MIN);
            inner.allg.push(g.clone());
            g
        }
    };

    newg.status.store(TaskStatus::Waiting, Ordering::SeqCst);
    newg.wait_reason.set("new task");

    unsafe {
        let sp = newg.stack_base.get().sub(siz);
        if narg > 0 {
            ptr::copy_nonoverlapping(argp, sp, narg as usize);
        }

        let ctx = newg.sched.get();
        *ctx = crate::platform::context::Context::zeroed();
        (*ctx).sp = sp;
        (*ctx).pc = task_exit_pc();
        (*ctx).task = Arc::as_ptr(&newg) as *mut Task;
    }
    newg.entry.set(Some(entry));
    newg.spawn_pc.set(caller_pc);

    inner.gcount += 1;
    inner.goidgen += 1;
    let id = TaskId::new(inner.goidgen);
    newg.id.set(id);

    log::trace!("spawned task {}", id);
    readylocked(&mut inner, &newg);
    sched_unlock(inner);
    id
}

unsafe extern "sysv64" fn call_fn_usize(argp: *mut u8) {
    unsafe {
        let words = argp as *const usize;
        let f = core::mem::transmute::<usize, fn(usize)>(*words);
        let arg = *words.add(1);
        f(arg);
    }
}

/// Spawn a task running `f(arg)`.
pub fn spawn(f: fn(usize), arg: usize) -> TaskId {
    let args = [f as usize, arg];
    unsafe {
        spawn_raw(
            call_fn_usize,
            args.as_ptr() as *const u8,
            size_of_val(&args) as u32,
            0,
            f as usize,
        )
    }
}

// ---------------------------------------------------------------------------
// Syscall hand-off.

/// The current task is about to block in the OS: stop counting it against
/// the CPU cap so another task can run in its place. Must be paired with
/// [`exit_syscall`] around every blocking call.
pub fn enter_syscall() {
    if SCHED.predawn.load(Ordering::SeqCst) {
        return;
    }
    let g = current_task_ref();

    // Leave the stack extent around for a collector and for traceback.
    unsafe {
        let ctx = g.sched.get();
        (*ctx).task = g as *const Task as *mut Task;
        ctx_save(ctx);
        g.gc_sp.set((*ctx).sp);
    }
    g.gc_stack.set(g.stack_base.get());
    g.gc_guard.set(g.stack_guard.get());
    g.status.store(TaskStatus::Syscall, Ordering::SeqCst);
    if (g.gc_sp.get() as usize) < g.gc_guard.get() as usize - crate::consts::STACK_GUARD
        || (g.gc_stack.get() as usize) < g.gc_sp.get() as usize
    {
        crate::throw("inconsistent stack extent in enter_syscall");
    }

    // Fast path: after mcpu--, if the queue is empty and no stop-the-world
    // quorum depends on us, no lock is needed.
    let v = SCHED.word.xsub(MCPU_DELTA);
    if !word::gwaiting(v) && (!word::waitstop(v) || word::mcpu(v) > word::mcpumax(v)) {
        return;
    }

    let mut inner = SCHED.lock.lock();
    let v = SCHED.word.load();
    if word::gwaiting(v) {
        matchmg(&mut inner);
    }
    let v = SCHED.word.load();
    if word::waitstop(v) && word::mcpu(v) <= word::mcpumax(v) {
        SCHED.word.xsub(WAITSTOP_DELTA);
        SCHED.stopped.wakeup();
    }

    // Re-save: matchmg or the wakeup may have clobbered the saved
    // context via dispatch bookkeeping.
    unsafe {
        ctx_save(g.sched.get());
    }
    sched_unlock(inner);
}

/// The current task finished its blocking call: regain a CPU slot or
/// yield until one is free.
pub fn exit_syscall() {
    if SCHED.predawn.load(Ordering::SeqCst) {
        return;
    }
    let m = current_worker();
    let g = current_task_ref();

    // Fast path: if the mcpu++ stays within the cap (and no profiler
    // rate change has to be picked up), keep running without the lock.
    let v = SCHED.word.xadd(MCPU_DELTA);
    if m.profile_hz.get() == SCHED.profile_hz.load(Ordering::SeqCst)
        && word::mcpu(v) <= word::mcpumax(v)
    {
        g.status.store(TaskStatus::Running, Ordering::SeqCst);
        // No collector can be running while we are.
        g.gc_stack.set(ptr::null_mut());
        return;
    }

    // All CPUs are taken. Have the scheduler requeue this task and undo
    // the mcpu++ above exactly once on our behalf.
    g.set_flag(TaskFlags::READY_ON_STOP);
    yield_now();

    // Back on a CPU; only now is the collector known not to be looking
    // at the stale stack extent.
    g.gc_stack.set(ptr::null_mut());
}

// ---------------------------------------------------------------------------
// Stop-the-world / start-the-world.

/// Lower the CPU cap to 1 and wait until this is the only CPU running
/// task code. The caller owns a single-threaded critical section until
/// [`start_the_world`].
pub fn stop_the_world() {
    let mut inner = SCHED.lock.lock();
    if let Some(m) = try_current_worker() {
        m.gcing.set(true);
    }
    SCHED.gc_waiting.store(true, Ordering::SeqCst);
    SCHED.word.set_mcpumax(1);

    // While mcpu > 1.
    loop {
        let v = SCHED.word.load();
        if word::mcpu(v) <= 1 {
            break;
        }

        // Only one coordinator at a time may use the stopped note.
        SCHED.stopped.clear();
        if word::waitstop(v) {
            crate::throw("invalid waitstop");
        }

        // waitstop = 1, predicated on the mcpu read above still holding.
        if !SCHED.word.cas(v, v + WAITSTOP_DELTA) {
            continue;
        }

        sched_unlock(inner);
        SCHED.stopped.sleep();
        inner = SCHED.lock.lock();
    }
    log::debug!("world stopped");
    sched_unlock(inner);
}

/// Restore the CPU cap and hand queued tasks back to workers.
pub fn start_the_world() {
    let mut inner = SCHED.lock.lock();
    SCHED.gc_waiting.store(false, Ordering::SeqCst);
    let n = inner.max_workers;
    SCHED.word.set_mcpumax(n);
    if let Some(m) = try_current_worker() {
        m.gcing.set(false);
    }
    matchmg(&mut inner);
    log::debug!("world started");
    sched_unlock(inner);
}

// ---------------------------------------------------------------------------
// Wiring and the idle task.

/// Wire the current task to its current worker: from now on it runs only
/// there.
pub fn lock_thread() {
    if SCHED.predawn.load(Ordering::SeqCst) {
        crate::throw("cannot wire a task during init");
    }
    let m = current_worker();
    let g = current_task();
    unsafe {
        *m.locked_g.get() = Some(g.clone());
    }
    g.locked_m.set(Some(m));
}

/// Undo [`lock_thread`].
pub fn unlock_thread() {
    let m = current_worker();
    let g = current_task_ref();
    unsafe {
        *m.locked_g.get() = None;
    }
    g.locked_m.set(None);
}

pub fn thread_locked() -> bool {
    let m = current_worker();
    let g = current_task_ref();
    g.locked_m.get().is_some() && unsafe { (*m.locked_g.get()).is_some() }
}

/// Mark the current task as its worker's dedicated idle task: it is run
/// only when the worker has nothing else to do.
pub fn set_idle_task() {
    let g = current_task_ref();
    if g.idle_m.get().is_some() {
        crate::throw("task is already an idle task");
    }
    g.idle_m.set(Some(current_worker()));
}

// ---------------------------------------------------------------------------
// CPU cap control.

/// Set the CPU cap. `n == 0` queries without changing. Returns the
/// previous cap. Lowering the cap below the number of currently running
/// workers yields at the end to let the excess unwind.
pub fn set_max_workers(n: u32) -> u32 {
    let mut inner = SCHED.lock.lock();
    let prev = inner.max_workers;
    let mut n = if n == 0 { prev } else { n };
    if n > MAX_WORKERS_CAP {
        n = MAX_WORKERS_CAP;
    }
    inner.max_workers = n;

    if SCHED.gc_waiting.load(Ordering::SeqCst) {
        // The stop-the-world owns mcpumax; it is restored from
        // max_workers by start_the_world.
        if word::mcpumax(SCHED.word.load()) != 1 {
            crate::throw("invalid mcpumax during stop-the-world");
        }
        sched_unlock(inner);
        return prev;
    }

    SCHED.word.set_mcpumax(n);

    // Fewer allowed CPUs than running: stop this one.
    let v = SCHED.word.load();
    if word::mcpu(v) > n {
        sched_unlock(inner);
        yield_now();
        return prev;
    }
    // Room for more.
    matchmg(&mut inner);
    sched_unlock(inner);
    prev
}

// ---------------------------------------------------------------------------
// Process lifecycle.

/// Initialize the scheduler and its bootstrap worker. Reads the CPU cap
/// from `WEFT_MAX_WORKERS` (default 1, clamped). Until [`init_done`],
/// spawned tasks queue up but do not start.
pub fn schedinit() {
    crate::logger::init();
    BOOT_WORKER.call_once(|| {
        SCHED.predawn.store(true, Ordering::SeqCst);
        let mut inner = SCHED.lock.lock();

        let mut n = 1u32;
        if let Ok(s) = env::var("WEFT_MAX_WORKERS")
            && let Ok(v) = s.parse::<u32>()
            && v != 0
        {
            n = v.min(MAX_WORKERS_CAP);
        }
        inner.max_workers = n;
        SCHED.word.set_mcpumax(n);

        let m0 = mcommoninit(&mut inner);
        drop(inner);
        log::debug!("scheduler initialized, cpu cap {n}");
        m0
    });
}

/// End the initialization phase: tasks spawned before this point get
/// workers now, as `ready` would have given them had it not been predawn.
pub fn init_done() {
    SCHED.predawn.store(false, Ordering::SeqCst);
    let mut inner = SCHED.lock.lock();
    matchmg(&mut inner);
    sched_unlock(inner);
}

unsafe extern "sysv64" fn boot_shim(argp: *mut u8) {
    unsafe {
        let words = argp as *const usize;
        let f = core::mem::transmute::<usize, fn(usize)>(*words);
        let arg = *words.add(1);
        init_done();
        f(arg);
    }
}

/// Boot the runtime on the calling thread: initialize the scheduler,
/// queue `f(arg)` as the first task, and enter the worker loop. Never
/// returns; the process exits with code 0 when the last task ends.
pub fn boot(f: fn(usize), arg: usize) -> ! {
    schedinit();
    let args = [f as usize, arg];
    unsafe {
        spawn_raw(
            boot_shim,
            args.as_ptr() as *const u8,
            size_of_val(&args) as u32,
            0,
            f as usize,
        );
    }
    let m0 = *BOOT_WORKER
        .get()
        .unwrap_or_else(|| crate::throw("scheduler not initialized"));
    mstart(m0)
}

// ---------------------------------------------------------------------------
// Diagnostics and debugging hooks.

/// A snapshot of the atomic scheduling word.
#[derive(Debug, Clone, Copy)]
pub struct SchedSnapshot {
    pub mcpu: u32,
    pub mcpumax: u32,
    pub waitstop: bool,
    pub gwaiting: bool,
}

pub fn sched_snapshot() -> SchedSnapshot {
    let v = SCHED.word.load();
    SchedSnapshot {
        mcpu: word::mcpu(v),
        mcpumax: word::mcpumax(v),
        waitstop: word::waitstop(v),
        gwaiting: word::gwaiting(v),
    }
}

/// Number of tasks that are alive.
pub fn task_count() -> i64 {
    SCHED.lock.lock().gcount
}

/// Number of workers ever created.
pub fn worker_count() -> i32 {
    SCHED.lock.lock().allm.len() as i32
}

/// Id of the worker running the caller.
pub fn worker_id() -> i32 {
    current_worker().id
}

pub(crate) fn all_tasks() -> Vec<Arc<Task>> {
    SCHED.lock.lock().allg.clone()
}

pub(crate) fn set_profile_hz(hz: i32) {
    SCHED.profile_hz.store(hz, Ordering::SeqCst);
}

const _: () = assert!(HEADER_SIZE < STACK_MIN);
