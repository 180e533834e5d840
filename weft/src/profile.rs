//! CPU-profile plumbing.
//!
//! The runtime does not own a sampling timer; the platform layer drives
//! one and calls [`sigprof`] from its signal handler. This module keeps
//! the sampler registration, the rate every worker reconciles against at
//! dispatch, and the capped traceback buffer handed to the sampler.

use crate::consts::TRACE_PCS_MAX;
use crate::sched;
use crate::sched::task::Task;
use crate::trace::collect_pcs;

/// Receives the program counters of one sample.
pub type SamplerFn = fn(&[usize]);

struct ProfState {
    sampler: Option<SamplerFn>,
    hz: i32,
    pcbuf: [usize; TRACE_PCS_MAX],
}

static PROF: spin::Mutex<ProfState> = spin::Mutex::new(ProfState {
    sampler: None,
    hz: 0,
    pcbuf: [0; TRACE_PCS_MAX],
});

/// Deliver one profiling sample. Callable from a signal handler: takes
/// only the dedicated profiler lock.
pub fn sigprof(pc: usize, _sp: usize, lr: usize, gp: Option<&Task>) {
    let mut prof = PROF.lock();
    let Some(sampler) = prof.sampler else {
        return;
    };
    if prof.hz == 0 {
        return;
    }
    let buf = &mut prof.pcbuf;
    let n = collect_pcs(pc, lr, gp, buf);
    if n > 0 {
        sampler(&prof.pcbuf[..n]);
    }
}

/// Install (or with `hz == 0` / `None`, remove) the CPU profile sampler.
/// Workers pick the new rate up at their next dispatch.
pub fn set_cpu_profile(hz: i32, sampler: Option<SamplerFn>) {
    // Force sane arguments.
    let hz = if hz < 0 || sampler.is_none() { 0 } else { hz };
    let sampler = if hz == 0 { None } else { sampler };

    // Stop sampling on this worker before taking the profiler lock, so a
    // sample landing here cannot deadlock against us.
    if let Some(m) = crate::platform::try_current_worker() {
        m.profile_hz.set(0);
    }

    {
        let mut prof = PROF.lock();
        prof.sampler = sampler;
        prof.hz = hz;
    }
    sched::set_profile_hz(hz);

    if hz != 0
        && let Some(m) = crate::platform::try_current_worker()
    {
        m.profile_hz.set(hz);
    }
}
