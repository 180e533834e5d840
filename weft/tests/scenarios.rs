//! Scheduler scenarios.
//!
//! The runtime owns process exit (code 0 when the last task dies, code 2
//! on an unrecovered panic), so every scenario runs in a subprocess:
//! this binary re-executes itself with `WEFT_SCENARIO=<name>` and the
//! parent asserts on exit status and output.

use std::env;
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

fn main() {
    if let Ok(name) = env::var("WEFT_SCENARIO") {
        run_scenario(&name);
    }

    let scenarios: &[Scenario] = &[
        Scenario {
            name: "ping_pong",
            workers: "1",
            want_code: 0,
            stdout_has: "ping-pong ok",
            stderr_has: None,
        },
        Scenario {
            name: "counter",
            workers: "4",
            want_code: 0,
            stdout_has: "counter=400000",
            stderr_has: None,
        },
        Scenario {
            name: "stack_growth",
            workers: "1",
            want_code: 0,
            stdout_has: "stack ok deepest=6",
            stderr_has: None,
        },
        Scenario {
            name: "recover_two_up",
            workers: "1",
            want_code: 0,
            stdout_has: "recovered=42",
            stderr_has: None,
        },
        Scenario {
            name: "panic_unrecovered",
            workers: "1",
            want_code: 2,
            stdout_has: "",
            stderr_has: Some("panic: boom"),
        },
        Scenario {
            name: "gc_load",
            workers: "4",
            want_code: 0,
            stdout_has: "gc ok",
            stderr_has: None,
        },
        Scenario {
            name: "syscall",
            workers: "2",
            want_code: 0,
            stdout_has: "syscall ok",
            stderr_has: None,
        },
        Scenario {
            name: "defer_order",
            workers: "1",
            want_code: 0,
            stdout_has: "defer ok",
            stderr_has: None,
        },
        Scenario {
            name: "wired",
            workers: "2",
            want_code: 0,
            stdout_has: "wired ok",
            stderr_has: None,
        },
    ];

    let exe = env::current_exe().expect("current_exe");
    let mut failed = 0;
    for s in scenarios {
        let out = Command::new(&exe)
            .env("WEFT_SCENARIO", s.name)
            .env("WEFT_MAX_WORKERS", s.workers)
            .output()
            .expect("spawn scenario subprocess");
        let stdout = String::from_utf8_lossy(&out.stdout);
        let stderr = String::from_utf8_lossy(&out.stderr);

        let mut problems = Vec::new();
        match out.status.code() {
            Some(code) if code == s.want_code => {}
            code => problems.push(format!("exit {:?}, want {}", code, s.want_code)),
        }
        if !s.stdout_has.is_empty() && !stdout.contains(s.stdout_has) {
            problems.push(format!("stdout missing {:?}", s.stdout_has));
        }
        match s.stderr_has {
            Some(want) => {
                let n = stderr.matches(want).count();
                if n != 1 {
                    problems.push(format!("stderr has {n} occurrences of {want:?}, want 1"));
                }
            }
            None => {
                if stderr.contains("panic:") || stderr.contains("fatal error:") {
                    problems.push(format!("unexpected stderr: {}", stderr.trim_end()));
                }
            }
        }

        if problems.is_empty() {
            println!("scenario {} [ok]", s.name);
        } else {
            failed += 1;
            println!("scenario {} [failed]", s.name);
            for p in &problems {
                println!("    {p}");
            }
            if !stdout.is_empty() {
                println!("    stdout: {}", stdout.trim_end());
            }
            if !stderr.is_empty() {
                println!("    stderr: {}", stderr.trim_end());
            }
        }
    }
    if failed > 0 {
        std::process::exit(1);
    }
}

struct Scenario {
    name: &'static str,
    workers: &'static str,
    want_code: i32,
    stdout_has: &'static str,
    /// Expected exactly once in stderr; `None` forbids panic output.
    stderr_has: Option<&'static str>,
}

fn run_scenario(name: &str) -> ! {
    match name {
        "ping_pong" => weft::boot(ping_pong_main, 0),
        "counter" => weft::boot(counter_main, 0),
        "stack_growth" => weft::boot(stack_main, 0),
        "recover_two_up" => weft::boot(recover_main, 0),
        "panic_unrecovered" => weft::boot(unrecovered_main, 0),
        "gc_load" => weft::boot(gc_main, 0),
        "syscall" => weft::boot(syscall_main, 0),
        "defer_order" => weft::boot(defer_main, 0),
        "wired" => weft::boot(wired_main, 0),
        _ => {
            eprintln!("unknown scenario {name}");
            std::process::exit(3);
        }
    }
}

// ---------------------------------------------------------------------------
// 1. Ping-pong under cap 1: two tasks alternate 1000 times through a
// shared turn word; exactly one worker is ever CPU-running.

static TURN: AtomicU32 = AtomicU32::new(0);
static PP_DONE: AtomicU32 = AtomicU32::new(0);
const ROUNDS: u32 = 1000;

fn ping(_: usize) {
    for _ in 0..ROUNDS {
        while TURN.load(Ordering::SeqCst) != 0 {
            weft::yield_now();
        }
        assert_eq!(weft::sched_snapshot().mcpu, 1);
        TURN.store(1, Ordering::SeqCst);
    }
    PP_DONE.fetch_add(1, Ordering::SeqCst);
}

fn pong(_: usize) {
    for _ in 0..ROUNDS {
        while TURN.load(Ordering::SeqCst) != 1 {
            weft::yield_now();
        }
        assert_eq!(weft::sched_snapshot().mcpu, 1);
        TURN.store(0, Ordering::SeqCst);
    }
    PP_DONE.fetch_add(1, Ordering::SeqCst);
}

fn ping_pong_main(_: usize) {
    weft::spawn(ping, 0);
    weft::spawn(pong, 0);
    while PP_DONE.load(Ordering::SeqCst) < 2 {
        weft::yield_now();
    }
    println!("ping-pong ok");
}

// ---------------------------------------------------------------------------
// 2. Parallel counter under cap 4, with the scheduling word checked from
// inside the run. Also exercises lowering the cap afterwards.

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn count_task(_: usize) {
    for i in 0..100_000u32 {
        COUNTER.fetch_add(1, Ordering::SeqCst);
        if i % 8192 == 0 {
            let s = weft::sched_snapshot();
            assert!(s.mcpu <= s.mcpumax, "mcpu {} > mcpumax {}", s.mcpu, s.mcpumax);
            assert!(s.mcpu <= 4);
            weft::yield_now();
        }
    }
}

fn counter_main(_: usize) {
    for _ in 0..4 {
        weft::spawn(count_task, 0);
    }
    while COUNTER.load(Ordering::SeqCst) < 400_000 {
        weft::yield_now();
    }
    assert_eq!(COUNTER.load(Ordering::SeqCst), 400_000);

    let prev = weft::set_max_workers(2);
    assert_eq!(prev, 4);
    assert_eq!(weft::sched_snapshot().mcpumax, 2);
    println!("counter={}", COUNTER.load(Ordering::SeqCst));
}

// ---------------------------------------------------------------------------
// 3. Stack growth across 5 segments: each level requests a frame too big
// for what is left, forcing an allocation; every return retires one, and
// the task ends back on its original segment.

unsafe extern "sysv64" fn grown_frame(argp: *mut u8) -> usize {
    let depth = unsafe { *(argp as *const u64) };
    if depth <= 1 {
        return weft::segment_count();
    }
    let mut next: u64 = depth - 1;
    unsafe { weft::grow_call(56 * 1024, grown_frame, &mut next as *mut u64 as *mut u8, 8) }
}

fn stack_main(_: usize) {
    assert_eq!(weft::segment_count(), 1);
    let mut depth: u64 = 5;
    let deepest =
        unsafe { weft::grow_call(56 * 1024, grown_frame, &mut depth as *mut u64 as *mut u8, 8) };
    assert_eq!(deepest, 6, "initial segment plus five grown ones");
    assert_eq!(weft::segment_count(), 1);
    println!("stack ok deepest={deepest}");
}

// ---------------------------------------------------------------------------
// 4. Panic recovered two frames up: a defer registered at depth 2
// recovers a panic thrown at depth 5; frames 3-5 unwind without running
// their continuations, and a second recover in the same defer sees
// nothing.

static RECOVERED: AtomicUsize = AtomicUsize::new(0);
static UNWOUND: AtomicU32 = AtomicU32::new(0);
static SKIPPED: AtomicU32 = AtomicU32::new(0);

unsafe extern "sysv64" fn on_panic(argp: *mut u8) {
    match weft::try_recover(argp as *const u8) {
        Some(v) => {
            let n = *v.downcast::<usize>().expect("panic value type");
            RECOVERED.store(n, Ordering::SeqCst);
        }
        None => RECOVERED.store(usize::MAX, Ordering::SeqCst),
    }
    assert!(weft::try_recover(argp as *const u8).is_none());
}

fn depth(n: usize) {
    if n == 2 {
        let mut marker: u64 = 7;
        let r = unsafe { weft::defer_call(on_panic, &mut marker as *mut u64 as *const u8, 8) };
        if r != 0 {
            // A panic below was recovered; control resumed here.
            UNWOUND.store(1, Ordering::SeqCst);
            return;
        }
    }
    if n == 5 {
        weft::panic_any(Box::new(42usize));
    }
    depth(n + 1);
    SKIPPED.fetch_add(1, Ordering::SeqCst);
}

fn recover_main(_: usize) {
    depth(1);
    assert_eq!(RECOVERED.load(Ordering::SeqCst), 42);
    assert_eq!(UNWOUND.load(Ordering::SeqCst), 1);
    assert_eq!(SKIPPED.load(Ordering::SeqCst), 0);
    println!("recovered={}", RECOVERED.load(Ordering::SeqCst));
}

// ---------------------------------------------------------------------------
// 5. Recover refused off the segment top: the deferred call delegates to
// a helper, whose frame is not the top of the panic segment, so the
// panic propagates and the process exits 2 with one panic line.

unsafe extern "sysv64" fn delegating_defer(_argp: *mut u8) {
    not_the_top();
}

fn not_the_top() {
    let local = 0u64;
    assert!(weft::try_recover(&local as *const u64 as *const u8).is_none());
}

fn depth_unrecovered(n: usize) {
    if n == 2 {
        let mut marker: u64 = 7;
        let _ =
            unsafe { weft::defer_call(delegating_defer, &mut marker as *mut u64 as *const u8, 8) };
    }
    if n == 5 {
        weft::panic_any(Box::new("boom"));
    }
    depth_unrecovered(n + 1);
}

fn unrecovered_main(_: usize) {
    depth_unrecovered(1);
    println!("not reached");
}

// ---------------------------------------------------------------------------
// 6. Stop-the-world under load: 8 cooperating spinners at cap 4; the
// coordinator observes mcpu <= 1, walks the tasks, restarts the world,
// and everything completes.

static SPUN: AtomicU32 = AtomicU32::new(0);

fn spinner(_: usize) {
    for i in 0..2000u32 {
        std::hint::black_box(i);
        weft::yield_now();
    }
    SPUN.fetch_add(1, Ordering::SeqCst);
}

fn gc_main(_: usize) {
    for _ in 0..8 {
        weft::spawn(spinner, 0);
    }
    for _ in 0..3 {
        weft::yield_now();
    }

    weft::stop_the_world();
    let s = weft::sched_snapshot();
    assert!(s.mcpu <= 1, "world not stopped: mcpu {}", s.mcpu);
    assert_eq!(s.mcpumax, 1);
    weft::traceback_all();
    weft::start_the_world();

    while SPUN.load(Ordering::SeqCst) < 8 {
        weft::yield_now();
    }
    println!("gc ok");
}

// ---------------------------------------------------------------------------
// 7. Syscall transparency: an empty enter/exit bracket leaves the task on
// the same worker with no visible state change.

static SAMPLES: AtomicU32 = AtomicU32::new(0);

fn sampler(pcs: &[usize]) {
    assert!(!pcs.is_empty());
    SAMPLES.fetch_add(1, Ordering::SeqCst);
}

fn syscall_main(_: usize) {
    assert!(weft::task_count() >= 1);
    assert!(weft::worker_count() >= 1);

    let w = weft::worker_id();
    weft::enter_syscall();
    weft::exit_syscall();
    assert_eq!(weft::worker_id(), w);

    let s = weft::sched_snapshot();
    assert!(s.mcpu >= 1 && s.mcpu <= s.mcpumax);

    // A sample delivered by the platform's timer lands at the sampler.
    weft::set_cpu_profile(100, Some(sampler));
    weft::sigprof(0x1234, 0, 0x5678, None);
    assert_eq!(SAMPLES.load(Ordering::SeqCst), 1);
    weft::set_cpu_profile(0, None);
    weft::sigprof(0x1234, 0, 0x5678, None);
    assert_eq!(SAMPLES.load(Ordering::SeqCst), 1);

    println!("syscall ok");
}

// ---------------------------------------------------------------------------
// 8. Defer ordering: an in-frame defer fires at defer_return; the rest
// fire in reverse registration order at task exit.

static ORDER: Mutex<Vec<u64>> = Mutex::new(Vec::new());

unsafe extern "sysv64" fn record(argp: *mut u8) {
    let n = unsafe { *(argp as *const u64) };
    ORDER.lock().unwrap().push(n);
}

fn defer_task(_: usize) {
    let mut first: u64 = 99;
    unsafe {
        let _ = weft::defer_call(record, &mut first as *mut u64 as *const u8, 8);
        weft::defer_return();
    }
    assert_eq!(*ORDER.lock().unwrap(), vec![99]);

    for i in 1..=5u64 {
        let mut arg = i;
        let _ = unsafe { weft::defer_call(record, &mut arg as *mut u64 as *const u8, 8) };
    }
    // Explicit exit runs the outstanding five, newest first.
    weft::exit_task();
}

fn defer_main(_: usize) {
    weft::spawn(defer_task, 0);
    while ORDER.lock().unwrap().len() < 6 {
        weft::yield_now();
    }
    assert_eq!(*ORDER.lock().unwrap(), vec![99, 5, 4, 3, 2, 1]);
    println!("defer ok");
}

// ---------------------------------------------------------------------------
// 9. Wiring: a task locked to its worker keeps the same worker id across
// yields while other tasks churn.

static WIRED_OK: AtomicU32 = AtomicU32::new(0);

fn churn(_: usize) {
    for _ in 0..200 {
        weft::yield_now();
    }
}

fn wired_task(_: usize) {
    weft::lock_thread();
    assert!(weft::thread_locked());
    let w = weft::worker_id();
    for _ in 0..50 {
        weft::yield_now();
        assert_eq!(weft::worker_id(), w);
    }
    weft::unlock_thread();
    assert!(!weft::thread_locked());
    WIRED_OK.store(1, Ordering::SeqCst);
}

fn wired_main(_: usize) {
    weft::spawn(wired_task, 0);
    weft::spawn(churn, 0);
    weft::spawn(churn, 0);
    while WIRED_OK.load(Ordering::SeqCst) == 0 {
        weft::yield_now();
    }
    println!("wired ok");
}
